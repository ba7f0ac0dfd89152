use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod electricity;
pub mod battery;
pub mod volume;

pub use electricity::{ElectricityState, ElectricityUsage};
pub use battery::BatteryState;
pub use volume::{GasUsage, WaterUsage};

/// Highest number of phases a source or meter can report
pub const MAX_PHASES: usize = 3;
/// Lowest number of phases a meter can report
pub const MIN_PHASES: usize = 1;

/// Zero based phase identifier, 0 = L1, 1 = L2, 2 = L3
pub type LineIndex = usize;

/// Role of a physical energy source, every meter and every event is tagged with one
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EnergySourceRole {
    Grid,
    Pv,
    Battery,
    EvCharger,
}

impl EnergySourceRole {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Grid" | "grid" => Some(EnergySourceRole::Grid),
            "Pv" | "pv" | "PV" => Some(EnergySourceRole::Pv),
            "Battery" | "battery" => Some(EnergySourceRole::Battery),
            "EvCharger" | "evcharger" => Some(EnergySourceRole::EvCharger),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnergySourceRole::Grid => "grid",
            EnergySourceRole::Pv => "pv",
            EnergySourceRole::Battery => "battery",
            EnergySourceRole::EvCharger => "evcharger",
        }
    }
}

impl fmt::Display for EnergySourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Meter vendors the prober knows about
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MeterBrand {
    #[serde(rename = "ABB")]
    Abb,
    #[serde(rename = "Carlo Gavazzi")]
    CarloGavazzi,
    #[serde(rename = "DSMR")]
    Dsmr,
    #[serde(rename = "Victron")]
    Victron,
}

impl MeterBrand {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ABB" => Some(MeterBrand::Abb),
            "Carlo Gavazzi" => Some(MeterBrand::CarloGavazzi),
            "DSMR" => Some(MeterBrand::Dsmr),
            "Victron" => Some(MeterBrand::Victron),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MeterBrand::Abb => "ABB",
            MeterBrand::CarloGavazzi => "Carlo Gavazzi",
            MeterBrand::Dsmr => "DSMR",
            MeterBrand::Victron => "Victron",
        }
    }
}

impl fmt::Display for MeterBrand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selects what a meter contributes to its source: instant state, cumulative usage or both
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MeterAttribute {
    State,
    Usage,
}

#[derive(Error, Debug, PartialEq)]
pub enum ModelError {
    #[error("line index {0} is out of range, must be below 3")]
    LineIndexOutOfRange(LineIndex),
}

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("{field} must not be negative, got {value}")]
    Negative { field: String, value: f64 },
    #[error("{field} is not a finite number")]
    NotFinite { field: String },
}

pub(crate) fn check_line(line: LineIndex) -> Result<(), ModelError> {
    if line >= MAX_PHASES {
        return Err(ModelError::LineIndexOutOfRange(line));
    }
    return Ok(());
}

pub(crate) fn check_non_negative(field: &str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite { field: field.to_string() });
    }
    if value < 0.0 {
        return Err(ValidationError::Negative { field: field.to_string(), value });
    }
    return Ok(());
}

pub(crate) fn check_finite(field: &str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite { field: field.to_string() });
    }
    return Ok(());
}
