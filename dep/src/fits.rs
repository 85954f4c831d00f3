//! Primary-header access for FITS files.
//!
//! Only what the pipeline needs: read the header cards of the primary HDU,
//! look keywords up, overwrite or add cards, and write a copy of the file
//! with the changed keywords. Reading and writing go through cfitsio via the
//! `fitsio` crate; data units are never touched.

use std::ffi::{CStr, CString};
use std::fmt;
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};

use fitsio::sys;

/// `FLEN_CARD`: one card plus the terminating NUL.
const CARD_BUF: usize = 81;
/// cfitsio `KEY_NO_EXIST`.
const KEY_NO_EXIST: c_int = 202;

/// Keywords owned by cfitsio when it writes an HDU.
const STRUCTURAL: &[&str] = &["SIMPLE", "BITPIX", "EXTEND", "PCOUNT", "GCOUNT", "END"];

#[derive(Debug, thiserror::Error)]
pub enum FitsError {
    #[error("cannot read FITS file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Fitsio(#[from] fitsio::errors::Error),
    #[error("cfitsio error code {0}")]
    Cfitsio(c_int),
    #[error("invalid keyword '{0}'")]
    InvalidKeyword(String),
    #[error("non-finite value for {0}")]
    NonFinite(String),
}

macro_rules! try_cfitsio {
    ($status:expr) => {{
        let s = $status;

        if s != 0 {
            return Err(FitsError::Cfitsio(s));
        }
    }};
}

/// A typed card value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Int(i) => Some(*i as f64),
            HeaderValue::Float(f) => Some(*f),
            HeaderValue::Str(s) => s.trim().parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Str(s) => f.write_str(s),
            HeaderValue::Bool(b) => f.write_str(if *b { "T" } else { "F" }),
            HeaderValue::Int(i) => write!(f, "{}", i),
            HeaderValue::Float(v) => f.write_str(&format_float(*v)),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Str(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Str(s)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

fn format_float(v: f64) -> String {
    let plain = format!("{}", v);
    if plain.len() > 20 {
        format!("{:E}", v)
    } else if plain.contains('.') {
        plain
    } else {
        format!("{}.0", plain)
    }
}

/// One header card.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub keyword: String,
    /// `None` for commentary cards and undefined values.
    pub value: Option<HeaderValue>,
    /// Text after `/`, or the whole text of a commentary card.
    pub comment: String,
    commentary: bool,
}

impl Card {
    pub fn new(keyword: &str, value: HeaderValue, comment: &str) -> Self {
        Self {
            keyword: keyword.to_uppercase(),
            value: Some(value),
            comment: comment.to_string(),
            commentary: false,
        }
    }

    /// Split a card record as returned by cfitsio.
    fn parse(raw: &str) -> Card {
        let keyword = raw.get(..8).unwrap_or(raw).trim_end().to_string();
        let rest = raw.get(8..).unwrap_or("");
        match rest.strip_prefix("= ") {
            Some(field) => {
                let (value, comment) = parse_value_field(field);
                Card {
                    keyword,
                    value,
                    comment,
                    commentary: false,
                }
            }
            None => Card {
                keyword,
                value: None,
                comment: rest.trim_end().to_string(),
                commentary: true,
            },
        }
    }
}

fn parse_value_field(field: &str) -> (Option<HeaderValue>, String) {
    let trimmed = field.trim_start();
    if let Some(body) = trimmed.strip_prefix('\'') {
        // Quoted string; '' is an escaped quote.
        let mut value = String::new();
        let mut chars = body.char_indices().peekable();
        let mut end = body.len();
        while let Some((idx, c)) = chars.next() {
            if c == '\'' {
                if matches!(chars.peek(), Some((_, '\''))) {
                    value.push('\'');
                    chars.next();
                    continue;
                }
                end = idx + 1;
                break;
            }
            value.push(c);
        }
        let comment = body[end..]
            .trim_start()
            .strip_prefix('/')
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        return (Some(HeaderValue::Str(value.trim_end().to_string())), comment);
    }

    let (token, comment) = match trimmed.split_once('/') {
        Some((t, c)) => (t.trim(), c.trim().to_string()),
        None => (trimmed.trim(), String::new()),
    };
    let value = match token {
        "" => None,
        "T" => Some(HeaderValue::Bool(true)),
        "F" => Some(HeaderValue::Bool(false)),
        _ => token
            .parse::<i64>()
            .map(HeaderValue::Int)
            .ok()
            .or_else(|| {
                token
                    .replace(['D', 'd'], "E")
                    .parse::<f64>()
                    .map(HeaderValue::Float)
                    .ok()
            })
            .or_else(|| Some(HeaderValue::Str(token.to_string()))),
    };
    (value, comment)
}

fn valid_keyword(keyword: &str) -> bool {
    !keyword.is_empty()
        && keyword.len() <= 8
        && keyword
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

fn is_structural(keyword: &str) -> bool {
    STRUCTURAL.contains(&keyword) || keyword.starts_with("NAXIS")
}

/// Printable ASCII only; cfitsio rejects anything else in a string value.
fn c_text(text: &str) -> CString {
    let clean: String = text
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '?' })
        .collect();
    // No NUL survives the filter above.
    CString::new(clean).unwrap_or_default()
}

/// Primary header of a file on disk, with pending edits.
#[derive(Debug, Clone, PartialEq)]
pub struct FitsFile {
    cards: Vec<Card>,
    /// File the cards were read from; `None` for a header built in memory.
    source: Option<PathBuf>,
    /// Keywords set since the header was read.
    dirty: Vec<String>,
    removed: Vec<String>,
}

impl FitsFile {
    /// A header-only primary HDU (`SIMPLE = T`, `BITPIX = 8`, `NAXIS = 0`).
    pub fn new_primary() -> Self {
        Self {
            cards: vec![
                Card::new("SIMPLE", HeaderValue::Bool(true), "conforms to FITS standard"),
                Card::new("BITPIX", HeaderValue::Int(8), "array data type"),
                Card::new("NAXIS", HeaderValue::Int(0), "number of array dimensions"),
            ],
            source: None,
            dirty: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn open(path: &Path) -> Result<Self, FitsError> {
        let mut fptr = fitsio::FitsFile::open(path)?;
        let mut status = 0;
        let mut nexist: c_int = 0;
        let mut nmore: c_int = 0;

        // The handle stays on the primary HDU after opening.
        let raw = unsafe { fptr.as_raw() };
        try_cfitsio!(unsafe { sys::ffghsp(raw, &mut nexist, &mut nmore, &mut status) });

        let mut cards = Vec::with_capacity(nexist.max(0) as usize);
        let mut buf = [0 as c_char; CARD_BUF];
        for nrec in 1..=nexist {
            try_cfitsio!(unsafe { sys::ffgrec(raw, nrec, buf.as_mut_ptr(), &mut status) });
            let record = unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy();
            cards.push(Card::parse(&record));
        }

        Ok(Self {
            cards,
            source: Some(path.to_path_buf()),
            dirty: Vec::new(),
            removed: Vec::new(),
        })
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.card(keyword).is_some()
    }

    fn card(&self, keyword: &str) -> Option<&Card> {
        let keyword = keyword.to_uppercase();
        self.cards
            .iter()
            .find(|c| !c.commentary && c.keyword == keyword)
    }

    pub fn get(&self, keyword: &str) -> Option<&HeaderValue> {
        self.card(keyword).and_then(|c| c.value.as_ref())
    }

    /// First defined value among `aliases`, in order.
    pub fn get_any(&self, aliases: &[&str]) -> Option<&HeaderValue> {
        aliases.iter().find_map(|k| self.get(k))
    }

    /// Value rendered as text, trimmed.
    pub fn get_string(&self, keyword: &str) -> Option<String> {
        self.get(keyword).map(|v| v.to_string().trim().to_string())
    }

    /// Overwrite or append a keyword. An existing comment is kept when
    /// `comment` is empty.
    pub fn set(
        &mut self,
        keyword: &str,
        value: impl Into<HeaderValue>,
        comment: &str,
    ) -> Result<(), FitsError> {
        let keyword = keyword.to_uppercase();
        if !valid_keyword(&keyword) {
            return Err(FitsError::InvalidKeyword(keyword));
        }
        let value = value.into();
        if let HeaderValue::Float(f) = value {
            if !f.is_finite() {
                return Err(FitsError::NonFinite(keyword));
            }
        }

        match self
            .cards
            .iter_mut()
            .find(|c| !c.commentary && c.keyword == keyword)
        {
            Some(card) => {
                card.value = Some(value);
                if !comment.is_empty() {
                    card.comment = comment.to_string();
                }
            }
            None => self.cards.push(Card::new(&keyword, value, comment)),
        }
        self.removed.retain(|k| *k != keyword);
        if !self.dirty.contains(&keyword) {
            self.dirty.push(keyword);
        }
        Ok(())
    }

    pub fn remove(&mut self, keyword: &str) -> bool {
        let keyword = keyword.to_uppercase();
        let before = self.cards.len();
        self.cards.retain(|c| c.commentary || c.keyword != keyword);
        let found = before != self.cards.len();
        self.dirty.retain(|k| *k != keyword);
        if found && !self.removed.contains(&keyword) {
            self.removed.push(keyword);
        }
        found
    }

    /// Write the header to `path`.
    ///
    /// A header read from disk is written as a copy of its source file with
    /// the pending edits applied; a header built in memory becomes a new
    /// header-only file.
    pub fn write_to(&self, path: &Path) -> Result<(), FitsError> {
        let mut fptr = match &self.source {
            Some(source) if source.as_path() == path => fitsio::FitsFile::edit(path)?,
            Some(source) => {
                std::fs::copy(source, path)?;
                fitsio::FitsFile::edit(path)?
            }
            None => fitsio::FitsFile::create(path).overwrite().open()?,
        };
        let raw = unsafe { fptr.as_raw() };

        for keyword in &self.removed {
            delete_key(raw, keyword)?;
        }
        for card in &self.cards {
            if card.commentary || is_structural(&card.keyword) {
                continue;
            }
            if self.source.is_some() && !self.dirty.contains(&card.keyword) {
                continue;
            }
            if let Some(value) = &card.value {
                update_key(raw, &card.keyword, value, &card.comment)?;
            }
        }
        Ok(())
    }
}

fn delete_key(raw: *mut sys::fitsfile, keyword: &str) -> Result<(), FitsError> {
    let key = c_text(keyword);
    let mut status = 0;
    unsafe { sys::ffdkey(raw, key.as_ptr(), &mut status) };
    match status {
        0 | KEY_NO_EXIST => Ok(()),
        s => Err(FitsError::Cfitsio(s)),
    }
}

/// Modify the card in place, or append it when missing.
fn update_key(
    raw: *mut sys::fitsfile,
    keyword: &str,
    value: &HeaderValue,
    comment: &str,
) -> Result<(), FitsError> {
    let key = c_text(keyword);
    let comm = (!comment.is_empty()).then(|| c_text(comment));
    let comm_ptr = comm.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());
    let mut status = 0;

    try_cfitsio!(unsafe {
        match value {
            HeaderValue::Str(s) => {
                let text = c_text(s);
                sys::ffukys(raw, key.as_ptr(), text.as_ptr(), comm_ptr, &mut status)
            }
            HeaderValue::Bool(b) => {
                sys::ffukyl(raw, key.as_ptr(), c_int::from(*b), comm_ptr, &mut status)
            }
            HeaderValue::Int(i) => sys::ffukyj(raw, key.as_ptr(), *i, comm_ptr, &mut status),
            HeaderValue::Float(f) => {
                sys::ffukyd(raw, key.as_ptr(), *f, -15, comm_ptr, &mut status)
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FitsFile {
        let mut fits = FitsFile::new_primary();
        fits.set("DATE-OBS", "2021-03-04", "UT date").unwrap();
        fits.set("UTC", "10:21:07.257", "").unwrap();
        fits.set("OBSERVER", "O'Brien, Smith", "").unwrap();
        fits.set("EXPTIME", 300.0, "seconds").unwrap();
        fits.set("FRAMENO", 12_i64, "").unwrap();
        fits
    }

    #[test]
    fn test_header_survives_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.fits");
        sample().write_to(&path).unwrap();

        let back = FitsFile::open(&path).unwrap();
        assert_eq!(back.get_string("DATE-OBS").as_deref(), Some("2021-03-04"));
        assert_eq!(back.get_string("OBSERVER").as_deref(), Some("O'Brien, Smith"));
        assert_eq!(back.get("EXPTIME").and_then(HeaderValue::as_f64), Some(300.0));
        assert_eq!(back.get("FRAMENO"), Some(&HeaderValue::Int(12)));
        assert_eq!(back.get("SIMPLE"), Some(&HeaderValue::Bool(true)));
        let card = back.cards().iter().find(|c| c.keyword == "DATE-OBS").unwrap();
        assert_eq!(card.comment, "UT date");
    }

    #[test]
    fn test_copy_applies_only_edits() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw.fits");
        sample().write_to(&raw).unwrap();

        let mut fits = FitsFile::open(&raw).unwrap();
        fits.set("KOAID", "HI.20210304.37267.25.fits", "KOA: Data file name")
            .unwrap();
        fits.set("EXPTIME", 10.5, "").unwrap();
        assert!(fits.remove("UTC"));
        assert!(!fits.remove("NOTHERE"));

        let copy = dir.path().join("copy.fits");
        fits.write_to(&copy).unwrap();

        let back = FitsFile::open(&copy).unwrap();
        assert_eq!(
            back.get_string("KOAID").as_deref(),
            Some("HI.20210304.37267.25.fits")
        );
        assert_eq!(back.get("EXPTIME").and_then(HeaderValue::as_f64), Some(10.5));
        assert!(!back.contains("UTC"));
        let card = back.cards().iter().find(|c| c.keyword == "EXPTIME").unwrap();
        assert_eq!(card.comment, "seconds");

        let source = FitsFile::open(&raw).unwrap();
        assert!(source.contains("UTC"));
        assert!(!source.contains("KOAID"));
    }

    #[test]
    fn test_alias_lookup_order() {
        let fits = sample();
        let v = fits.get_any(&["DATE", "DATE-OBS", "UTC"]).unwrap();
        assert_eq!(v.as_str(), Some("2021-03-04"));
        assert!(fits.get_any(&["MJD", "MJD-OBS"]).is_none());
    }

    #[test]
    fn test_set_rejects_non_finite() {
        let mut fits = sample();
        assert!(matches!(
            fits.set("AIRMASS", f64::NAN, ""),
            Err(FitsError::NonFinite(_))
        ));
        assert!(fits.set("bad key!", 1_i64, "").is_err());
    }

    #[test]
    fn test_overwrite_keeps_comment() {
        let mut fits = sample();
        fits.set("EXPTIME", 10.5, "").unwrap();
        let card = fits.cards().iter().find(|c| c.keyword == "EXPTIME").unwrap();
        assert_eq!(card.comment, "seconds");
        assert_eq!(card.value, Some(HeaderValue::Float(10.5)));
    }

    #[test]
    fn test_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("notes.fits");
        std::fs::write(&text, b"not a fits file").unwrap();
        assert!(FitsFile::open(&text).is_err());
        assert!(FitsFile::open(&dir.path().join("missing.fits")).is_err());
    }

    #[test]
    fn test_parse_card_forms() {
        let card = Card::parse("EXPTIME =                 1.5D3 / exp");
        assert_eq!(card.value, Some(HeaderValue::Float(1500.0)));
        assert_eq!(card.comment, "exp");
        let card = Card::parse("OBSERVER= 'it''s    '");
        assert_eq!(card.value, Some(HeaderValue::Str("it's".to_string())));
        let card = Card::parse("BLANK   =                      / undefined");
        assert_eq!(card.value, None);
        assert_eq!(card.comment, "undefined");
        let card = Card::parse("HISTORY copied by the archive");
        assert!(card.commentary);
        assert_eq!(card.comment, "copied by the archive");
    }
}
