//! Instrument-specific header handling.
//!
//! The pipeline only talks to [`HeaderNormalizer`]; each instrument is a row
//! in the tables below rather than its own type.

use std::sync::Arc;

use super::run_log::RunLog;
use super::StepError;
use crate::fits::FitsFile;
use crate::models::Instrument;

/// Header keywords whose name differs between instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMap {
    pub utc: &'static [&'static str],
    pub ofname: &'static [&'static str],
    pub frameno: &'static [&'static str],
}

const DEFAULT_KEYS: KeyMap = KeyMap {
    utc: &["UTC", "UT"],
    ofname: &["OUTFILE"],
    frameno: &["FRAMENO"],
};

const DATAFILE_KEYS: KeyMap = KeyMap {
    utc: &["UTC", "UT"],
    ofname: &["DATAFILE"],
    frameno: &["FRAMENUM"],
};

const KCWI_KEYS: KeyMap = KeyMap {
    utc: &["UT", "UTC"],
    ofname: &["OFNAME"],
    frameno: &["FRAMENO"],
};

/// Header checks and fixes that vary per instrument.
pub trait HeaderNormalizer: Send + Sync {
    fn instrument(&self) -> Instrument;

    fn keys(&self) -> KeyMap;

    /// Does INSTRUME (or a fallback) identify this instrument?
    fn matches_instrument(&self, header: &FitsFile) -> bool;

    /// Two character KOAID prefix, `None` when the configuration is unknown.
    fn prefix(&self, header: &FitsFile) -> Option<String>;

    /// KOA image type, `None` when it cannot be determined.
    fn koaimtyp(&self, header: &FitsFile) -> Option<String>;

    /// Calibration frames that carry no signal and belong to engineering.
    fn is_engineering(&self, _header: &FitsFile) -> bool {
        false
    }

    /// Instrument fixups run during DQA after the common keywords are set.
    fn normalize(&self, _header: &mut FitsFile, _log: &mut RunLog) -> Result<(), StepError> {
        Ok(())
    }
}

/// Table-driven normalizer for the Keck instruments.
#[derive(Debug, Clone, Copy)]
pub struct KeckNormalizer {
    instrument: Instrument,
}

impl KeckNormalizer {
    pub fn new(instrument: Instrument) -> Self {
        Self { instrument }
    }
}

pub fn normalizer_for(instrument: Instrument) -> Arc<dyn HeaderNormalizer> {
    Arc::new(KeckNormalizer::new(instrument))
}

/// First word of INSTRUME, lower case, without a trailing colon.
pub fn instrume_name(header: &FitsFile) -> String {
    header
        .get_string("INSTRUME")
        .unwrap_or_default()
        .to_lowercase()
        .split(' ')
        .next()
        .unwrap_or_default()
        .replace(':', "")
}

fn lower(header: &FitsFile, keyword: &str) -> String {
    header.get_string(keyword).unwrap_or_default().to_lowercase()
}

impl HeaderNormalizer for KeckNormalizer {
    fn instrument(&self) -> Instrument {
        self.instrument
    }

    fn keys(&self) -> KeyMap {
        match self.instrument {
            Instrument::Nires | Instrument::Osiris | Instrument::Nirspec => DATAFILE_KEYS,
            Instrument::Kcwi => KCWI_KEYS,
            _ => DEFAULT_KEYS,
        }
    }

    fn matches_instrument(&self, header: &FitsFile) -> bool {
        let instrume = instrume_name(header);
        let name = self.instrument.name().to_lowercase();
        if instrume.starts_with(&name) {
            return true;
        }
        match self.instrument {
            Instrument::Nirspec => instrume == "nirspao",
            Instrument::Nirc2 => instrume.is_empty() && lower(header, "OUTDIR").contains("nirc"),
            _ => false,
        }
    }

    fn prefix(&self, header: &FitsFile) -> Option<String> {
        let instrume = instrume_name(header);
        let prefix = match self.instrument {
            Instrument::Deimos if instrume.contains("deimos") => "DE",
            Instrument::Esi if instrume == "esi" => "ES",
            Instrument::Hires if instrume.contains("hires") => "HI",
            Instrument::Kcwi if instrume == "kcwi" => match lower(header, "CAMERA").as_str() {
                "blue" => "KB",
                "red" => "KR",
                "fpc" => "KF",
                "svc" => "KS",
                _ => return None,
            },
            Instrument::Lris if instrume == "lrisblue" => "LB",
            Instrument::Lris if instrume == "lris" => "LR",
            Instrument::Mosfire if instrume == "mosfire" => "MF",
            Instrument::Nirc2 if self.matches_instrument(header) => "N2",
            Instrument::Nirspec if instrume == "nirspec" || instrume == "nirspao" => {
                let camera = header
                    .get_string("CAMERA")
                    .or_else(|| header.get_string("OUTDIR"))
                    .unwrap_or_default()
                    .to_lowercase();
                if camera.contains("scam") {
                    "NC"
                } else if camera.contains("spec") {
                    "NS"
                } else {
                    return None;
                }
            }
            Instrument::Osiris => {
                let ftype = lower(header, "INSTR");
                if ftype.contains("imag") {
                    "OI"
                } else if ftype.contains("spec") {
                    "OS"
                } else {
                    return None;
                }
            }
            Instrument::Nires if instrume == "nires" => match lower(header, "INSTR").as_str() {
                "imag" => "NI",
                "spec" => "NR",
                _ => return None,
            },
            _ => return None,
        };
        Some(prefix.to_string())
    }

    fn koaimtyp(&self, header: &FitsFile) -> Option<String> {
        let raw = header
            .get_any(&["KOAIMTYP", "IMAGETYP", "OBSTYPE", "IMTYPE"])
            .map(|v| v.to_string().trim().to_lowercase())?;
        let koaimtyp = match raw.as_str() {
            "object" | "science" | "sci" => "object",
            "flat" | "flatlamp" | "domeflat" | "intflat" | "lampflat" => "flatlamp",
            "twiflat" | "skyflat" => "flatlamp",
            "arc" | "arclamp" | "line" => "arclamp",
            "dark" => "dark",
            "bias" | "zero" => "bias",
            "focus" => "focus",
            "fiducial" => "fiducial",
            _ => return None,
        };
        Some(koaimtyp.to_string())
    }

    /// Lamp frames taken with a zero exposure time.
    fn is_engineering(&self, header: &FitsFile) -> bool {
        let lamp = matches!(
            self.koaimtyp(header).as_deref(),
            Some("flatlamp") | Some("arclamp")
        );
        let exposure = header
            .get_any(&["ELAPTIME", "EXPTIME", "TRUITIME", "ITIME"])
            .and_then(|v| v.as_f64());
        lamp && exposure == Some(0.0)
    }

    fn normalize(&self, header: &mut FitsFile, log: &mut RunLog) -> Result<(), StepError> {
        if self.instrument == Instrument::Nirc2 && !header.contains("INSTRUME") {
            header.set("INSTRUME", "NIRC2", "KOA: Instrument")?;
        }
        set_elaptime(self.instrument, header, log)
    }
}

/// ELAPTIME from ITIME x COADDS for the infrared instruments, else EXPTIME.
fn set_elaptime(
    instrument: Instrument,
    header: &mut FitsFile,
    log: &mut RunLog,
) -> Result<(), StepError> {
    if header.contains("ELAPTIME") {
        return Ok(());
    }
    let elaptime = match instrument {
        Instrument::Mosfire | Instrument::Nires | Instrument::Osiris | Instrument::Nirc2 => {
            let itime = header
                .get_any(&["TRUITIME", "ITIME"])
                .and_then(|v| v.as_f64());
            let coadds = header.get("COADDS").and_then(|v| v.as_f64());
            match (itime, coadds) {
                (Some(itime), Some(coadds)) => Some(itime * coadds),
                _ => None,
            }
        }
        _ => header
            .get_any(&["EXPTIME", "EXPOSURE", "TTIME"])
            .and_then(|v| v.as_f64()),
    };
    match elaptime {
        Some(value) => {
            header.set("ELAPTIME", (value * 100.0).round() / 100.0, "KOA: Total integration time")?;
        }
        None => log.warn_code("SET_ELAPTIME_ERROR", "set_elaptime: Could not set ELAPTIME"),
    }
    Ok(())
}
