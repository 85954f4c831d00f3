//! Instruments known to the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A Keck instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Instrument {
    Deimos,
    Esi,
    Hires,
    Kcwi,
    Lris,
    Mosfire,
    Nirc2,
    Nirspec,
    Osiris,
    Nires,
}

impl Instrument {
    pub const ALL: [Instrument; 10] = [
        Instrument::Deimos,
        Instrument::Esi,
        Instrument::Hires,
        Instrument::Kcwi,
        Instrument::Lris,
        Instrument::Mosfire,
        Instrument::Nirc2,
        Instrument::Nirspec,
        Instrument::Osiris,
        Instrument::Nires,
    ];

    /// Upper-case instrument name as used in directory names and headers.
    pub fn name(&self) -> &'static str {
        match self {
            Instrument::Deimos => "DEIMOS",
            Instrument::Esi => "ESI",
            Instrument::Hires => "HIRES",
            Instrument::Kcwi => "KCWI",
            Instrument::Lris => "LRIS",
            Instrument::Mosfire => "MOSFIRE",
            Instrument::Nirc2 => "NIRC2",
            Instrument::Nirspec => "NIRSPEC",
            Instrument::Osiris => "OSIRIS",
            Instrument::Nires => "NIRES",
        }
    }

    /// Keck telescope the instrument is mounted on.
    pub fn telescope(&self) -> u8 {
        match self {
            Instrument::Hires | Instrument::Lris | Instrument::Mosfire | Instrument::Osiris => 1,
            _ => 2,
        }
    }

    /// PI name used for engineering data, e.g. `hireseng`.
    pub fn engineering_pi(&self) -> String {
        format!("{}eng", self.name().to_lowercase())
    }

    /// Program title used for engineering data, e.g. `HIRES Engineering`.
    pub fn engineering_title(&self) -> String {
        format!("{} Engineering", self.name())
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Instrument {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Instrument::ALL
            .iter()
            .copied()
            .find(|instr| instr.name() == upper)
            .ok_or_else(|| format!("Instrument name not valid: {}", s))
    }
}
