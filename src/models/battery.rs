use serde::{Deserialize, Serialize};
use super::{check_finite, check_non_negative, ValidationError};

/// Snapshot of a battery, power and current are negative while discharging
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    #[serde(default)]
    pub current: f32,
    #[serde(default)]
    pub power: f32,
    #[serde(default)]
    pub voltage: f32,
    #[serde(default)]
    pub state_of_charge: f32,
    #[serde(default)]
    pub state_of_health: f32,
}

impl BatteryState {
    pub fn new() -> Self {
        return BatteryState::default();
    }

    /// Empty readings are not worth publishing
    pub fn is_zero(&self) -> bool {
        return self.current == 0.0
            && self.power == 0.0
            && self.voltage == 0.0
            && self.state_of_charge == 0.0
            && self.state_of_health == 0.0;
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_finite("power", self.power as f64)?;
        check_finite("current", self.current as f64)?;
        check_non_negative("voltage", self.voltage as f64)?;
        check_non_negative("state_of_charge", self.state_of_charge as f64)?;
        check_non_negative("state_of_health", self.state_of_health as f64)?;
        return Ok(());
    }

    pub fn is_valid(&self) -> bool {
        return self.validate().is_ok();
    }
}
