//! Archive metadata tables.
//!
//! Column layout comes from the instrument's keyword definition file, a tab
//! separated table with at least the columns `FITSKeyword`,
//! `MetadataDatatype`, `NullsAllowed` and `MetadataWidth`. The output is a
//! fixed-width IPAC style table: four `|` delimited header rows (names,
//! types, units, nulls) followed by one space delimited row per file.

use log::{info, warn};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::fits::{FitsFile, HeaderValue};
use crate::models::Instrument;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Keyword definition file does not exist: {0}")]
    MissingDefinitions(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Keyword definitions missing column {0}")]
    MissingColumn(&'static str),

    #[error("Bad width '{width}' for keyword {keyword}")]
    BadWidth { keyword: String, width: String },

    #[error("Null value for non-null keyword {0}")]
    NullNotAllowed(String),
}

/// One column of the metadata table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordDef {
    pub keyword: String,
    pub datatype: String,
    pub allow_null: bool,
    /// Column width, never narrower than the keyword name.
    pub width: usize,
}

/// `KOA_{INSTR}_Keyword_Table.txt` inside the definition directory.
pub fn keyword_table_path(dir: &Path, instrument: Instrument) -> PathBuf {
    dir.join(format!("KOA_{}_Keyword_Table.txt", instrument.name()))
}

pub fn read_keyword_defs(path: &Path) -> Result<Vec<KeywordDef>, MetadataError> {
    if !path.is_file() {
        return Err(MetadataError::MissingDefinitions(path.to_path_buf()));
    }
    info!("Reading keywords definition file: {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_keyword_defs(&content)
}

/// Parse a definition table. Rows without a keyword and rows whose `Source`
/// is `NExScI` are dropped. KOAID is always the first column.
pub fn parse_keyword_defs(content: &str) -> Result<Vec<KeywordDef>, MetadataError> {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or(MetadataError::MissingColumn("FITSKeyword"))?
        .split('\t')
        .map(str::trim)
        .collect();
    let column = |name: &'static str| {
        header
            .iter()
            .position(|h| *h == name)
            .ok_or(MetadataError::MissingColumn(name))
    };
    let kw_col = column("FITSKeyword")?;
    let type_col = column("MetadataDatatype")?;
    let null_col = column("NullsAllowed")?;
    let width_col = column("MetadataWidth")?;
    let source_col = column("Source").ok();

    let mut defs = Vec::new();
    for line in lines {
        let cols: Vec<&str> = line.split('\t').map(str::trim).collect();
        let field = |idx: usize| cols.get(idx).copied().unwrap_or_default();
        let keyword = field(kw_col);
        if keyword.is_empty() {
            continue;
        }
        if source_col.is_some_and(|c| field(c) == "NExScI") {
            continue;
        }
        let raw_width = field(width_col);
        let width: usize = raw_width
            .parse::<f64>()
            .ok()
            .filter(|w| *w >= 0.0)
            .map(|w| w as usize)
            .ok_or_else(|| MetadataError::BadWidth {
                keyword: keyword.to_string(),
                width: raw_width.to_string(),
            })?;
        defs.push(KeywordDef {
            keyword: keyword.to_string(),
            datatype: field(type_col).to_string(),
            allow_null: field(null_col) != "N",
            width: width.max(keyword.len()),
        });
    }

    if let Some(idx) = defs.iter().position(|d| d.keyword == "KOAID") {
        let koaid = defs.remove(idx);
        defs.insert(0, koaid);
    } else {
        defs.insert(
            0,
            KeywordDef {
                keyword: "KOAID".to_string(),
                datatype: "char".to_string(),
                allow_null: false,
                width: 28,
            },
        );
    }
    Ok(defs)
}

/// Counts of value problems found while writing rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataWarnings {
    pub type_mismatch: usize,
    pub truncated: usize,
}

impl MetadataWarnings {
    pub fn total(&self) -> usize {
        self.type_mismatch + self.truncated
    }
}

/// The four header rows.
pub fn table_header(defs: &[KeywordDef]) -> String {
    let mut out = String::new();
    let row = |out: &mut String, cell: &dyn Fn(&KeywordDef) -> String| {
        for def in defs {
            let _ = write!(out, "|{:<width$}", cell(def), width = def.width);
        }
        out.push_str("|\n");
    };
    row(&mut out, &|d| d.keyword.clone());
    row(&mut out, &|d| d.datatype.clone());
    row(&mut out, &|_| String::new());
    row(&mut out, &|d| if d.allow_null { "null".to_string() } else { String::new() });
    out
}

fn value_text(value: &HeaderValue, datatype: &str) -> String {
    match (value, datatype) {
        (HeaderValue::Bool(b), "char") => (if *b { "T" } else { "F" }).to_string(),
        (HeaderValue::Int(0), "char") => String::new(),
        (HeaderValue::Float(f), _) if f.is_nan() => "null".to_string(),
        _ => value.to_string().trim().to_string(),
    }
}

fn type_matches(text: &str, datatype: &str) -> bool {
    match datatype {
        "integer" => text.parse::<i64>().is_ok(),
        "double" => text.parse::<f64>().is_ok(),
        "date" => chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok(),
        "time" => crate::models::parse_utc(text).is_some(),
        "datetime" => chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").is_ok(),
        _ => true,
    }
}

/// One data row for a header. Values missing from the header are taken
/// from `extra` (PROGTITL, PROPINT and similar) or written as `null`.
pub fn table_row(
    defs: &[KeywordDef],
    header: &FitsFile,
    extra: &BTreeMap<String, String>,
    warnings: &mut MetadataWarnings,
) -> Result<String, MetadataError> {
    let mut out = String::new();
    for def in defs {
        let mut text = match header.get(&def.keyword) {
            Some(value) => value_text(value, &def.datatype),
            None => extra
                .get(&def.keyword)
                .cloned()
                .unwrap_or_else(|| "null".to_string()),
        };
        if matches!(text.as_str(), "NaN" | "-NaN" | "#### Error ###") {
            text = "null".to_string();
        }

        let is_null = text == "null" || text.is_empty();
        if is_null && !def.allow_null {
            return Err(MetadataError::NullNotAllowed(def.keyword.clone()));
        }
        if !is_null && !type_matches(&text, &def.datatype) {
            warn!(
                "metadata check: {} val '{}' is not type {}",
                def.keyword, text, def.datatype
            );
            warnings.type_mismatch += 1;
        }
        if text.chars().count() > def.width {
            warn!(
                "metadata check: char length of {} greater than column size of {} ({}={}). TRUNCATING.",
                text.chars().count(),
                def.width,
                def.keyword,
                text
            );
            warnings.truncated += 1;
            text = text.chars().take(def.width).collect();
        }
        let _ = write!(out, " {:<width$}", text, width = def.width);
    }
    out.push('\n');
    Ok(out)
}

/// Write a one-row metadata table for `header`.
pub fn write_metadata(
    path: &Path,
    defs: &[KeywordDef],
    header: &FitsFile,
    extra: &BTreeMap<String, String>,
) -> Result<MetadataWarnings, MetadataError> {
    let mut warnings = MetadataWarnings::default();
    let mut table = table_header(defs);
    table.push_str(&table_row(defs, header, extra, &mut warnings)?);
    std::fs::write(path, table).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if warnings.type_mismatch > 0 {
        warn!("metadata.table: found {} warnings of type type", warnings.type_mismatch);
    }
    if warnings.truncated > 0 {
        warn!("metadata.table: found {} warnings of type truncate", warnings.truncated);
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFS: &str = "FITSKeyword\tMetadataDatatype\tNullsAllowed\tMetadataWidth\tSource\n\
        PROGID\tchar\tY\t8\tKeck\n\
        KOAID\tchar\tN\t24\tKeck\n\
        EXPTIME\tdouble\tY\t6\tKeck\n\
        PROPINT\tinteger\tY\t3\tKeck\n\
        IPACONLY\tchar\tY\t4\tNExScI\n\
        \tchar\tY\t4\tKeck\n";

    #[test]
    fn test_parse_puts_koaid_first() {
        let defs = parse_keyword_defs(DEFS).unwrap();
        let names: Vec<_> = defs.iter().map(|d| d.keyword.as_str()).collect();
        assert_eq!(names, vec!["KOAID", "PROGID", "EXPTIME", "PROPINT"]);
        assert!(!defs[0].allow_null);
        assert_eq!(defs[2].width, 7, "width widened to the keyword length");
    }

    #[test]
    fn test_missing_column_is_an_error() {
        let err = parse_keyword_defs("FITSKeyword\tNullsAllowed\n").unwrap_err();
        assert!(matches!(err, MetadataError::MissingColumn("MetadataDatatype")));
    }

    #[test]
    fn test_header_rows() {
        let defs = parse_keyword_defs(DEFS).unwrap();
        let header = table_header(&defs);
        let rows: Vec<&str> = header.lines().collect();
        assert_eq!(rows.len(), 4);
        assert!(rows[0].starts_with("|KOAID                   |PROGID  |EXPTIME|PROPINT|"));
        assert!(rows[3].starts_with("|                        |null    |"));
    }

    #[test]
    fn test_row_values_extra_and_truncation() {
        let defs = parse_keyword_defs(DEFS).unwrap();
        let mut fits = FitsFile::new_primary();
        fits.set("KOAID", "HI.20210304.12345.67.fits", "").unwrap();
        fits.set("PROGID", "C123", "").unwrap();
        fits.set("EXPTIME", 1234.56789, "").unwrap();
        let mut extra = BTreeMap::new();
        extra.insert("PROPINT".to_string(), "18".to_string());

        let mut warnings = MetadataWarnings::default();
        let row = table_row(&defs, &fits, &extra, &mut warnings).unwrap();
        assert!(row.starts_with(" HI.20210304.12345.67.fit "));
        assert!(row.contains(" C123     "));
        assert!(row.contains(" 1234.56 "));
        assert!(row.contains(" 18     "));
        assert_eq!(warnings.truncated, 2);
    }

    #[test]
    fn test_null_koaid_rejected() {
        let defs = parse_keyword_defs(DEFS).unwrap();
        let fits = FitsFile::new_primary();
        let mut warnings = MetadataWarnings::default();
        let err = table_row(&defs, &fits, &BTreeMap::new(), &mut warnings).unwrap_err();
        assert!(matches!(err, MetadataError::NullNotAllowed(k) if k == "KOAID"));
    }
}
