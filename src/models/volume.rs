use serde::{Deserialize, Serialize};
use super::{check_non_negative, ValidationError};

/// Cumulative gas consumption in m³
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GasUsage {
    #[serde(default)]
    pub consumed: f64,
}

impl GasUsage {
    pub fn new(consumed: f64) -> Self {
        return GasUsage { consumed };
    }

    pub fn is_zero(&self) -> bool {
        return self.consumed == 0.0;
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        return check_non_negative("gas_consumed", self.consumed);
    }
}

/// Cumulative water consumption in m³
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WaterUsage {
    #[serde(default)]
    pub consumed: f64,
}

impl WaterUsage {
    pub fn new(consumed: f64) -> Self {
        return WaterUsage { consumed };
    }

    pub fn is_zero(&self) -> bool {
        return self.consumed == 0.0;
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        return check_non_negative("water_consumed", self.consumed);
    }
}
