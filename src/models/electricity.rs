use serde::{Deserialize, Serialize};
use super::{check_finite, check_line, check_non_negative, LineIndex, ModelError, ValidationError, MAX_PHASES};

/// Instant electrical state of up to three phases.
///
/// A snapshot is built fresh on every polling tick and handed out whole,
/// consumers never patch it in place. Power is signed, a negative value
/// means energy is fed back towards the grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ElectricityStateJson", into = "ElectricityStateJson")]
pub struct ElectricityState {
    current: [f32; MAX_PHASES],
    power: [f32; MAX_PHASES],
    voltage: [f32; MAX_PHASES],
}

impl ElectricityState {
    pub fn new() -> Self {
        return ElectricityState::default();
    }

    pub fn current(&self, line: LineIndex) -> f32 {
        return self.current.get(line).copied().unwrap_or(0.0);
    }

    pub fn power(&self, line: LineIndex) -> f32 {
        return self.power.get(line).copied().unwrap_or(0.0);
    }

    pub fn voltage(&self, line: LineIndex) -> f32 {
        return self.voltage.get(line).copied().unwrap_or(0.0);
    }

    pub fn set_current(&mut self, line: LineIndex, value: f32) -> Result<(), ModelError> {
        check_line(line)?;
        self.current[line] = value;
        return Ok(());
    }

    pub fn set_power(&mut self, line: LineIndex, value: f32) -> Result<(), ModelError> {
        check_line(line)?;
        self.power[line] = value;
        return Ok(());
    }

    pub fn set_voltage(&mut self, line: LineIndex, value: f32) -> Result<(), ModelError> {
        check_line(line)?;
        self.voltage[line] = value;
        return Ok(());
    }

    /// Highest line with a voltage present plus one, 0 when no line carries voltage
    pub fn phases(&self) -> usize {
        for line in (0..MAX_PHASES).rev() {
            if self.voltage[line] != 0.0 {
                return line + 1;
            }
        }
        return 0;
    }

    pub fn total_current(&self) -> f32 {
        return self.current.iter().sum();
    }

    pub fn total_power(&self) -> f32 {
        return self.power.iter().sum();
    }

    pub fn is_zero(&self) -> bool {
        return self.current.iter()
            .chain(self.power.iter())
            .chain(self.voltage.iter())
            .all(|v| *v == 0.0);
    }

    /// Checks the physical bounds: voltage must be non-negative, power and
    /// current carry the feed-in sign and only have to be finite.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for line in 0..MAX_PHASES {
            check_non_negative(&format!("l{}_voltage", line + 1), self.voltage[line] as f64)?;
            check_finite(&format!("l{}_current", line + 1), self.current[line] as f64)?;
            check_finite(&format!("l{}_power", line + 1), self.power[line] as f64)?;
        }
        return Ok(());
    }

    pub fn is_valid(&self) -> bool {
        return self.validate().is_ok();
    }
}

#[derive(Serialize, Deserialize)]
struct ElectricityStateJson {
    #[serde(default)]
    l1_current: f32,
    #[serde(default)]
    l2_current: f32,
    #[serde(default)]
    l3_current: f32,
    #[serde(default)]
    total_current: f32,
    #[serde(default)]
    l1_power: f32,
    #[serde(default)]
    l2_power: f32,
    #[serde(default)]
    l3_power: f32,
    #[serde(default)]
    total_power: f32,
    #[serde(default)]
    l1_voltage: f32,
    #[serde(default)]
    l2_voltage: f32,
    #[serde(default)]
    l3_voltage: f32,
    #[serde(default)]
    phases: usize,
}

impl From<ElectricityState> for ElectricityStateJson {
    fn from(s: ElectricityState) -> Self {
        return ElectricityStateJson {
            l1_current: s.current[0],
            l2_current: s.current[1],
            l3_current: s.current[2],
            total_current: s.total_current(),
            l1_power: s.power[0],
            l2_power: s.power[1],
            l3_power: s.power[2],
            total_power: s.total_power(),
            l1_voltage: s.voltage[0],
            l2_voltage: s.voltage[1],
            l3_voltage: s.voltage[2],
            phases: s.phases(),
        };
    }
}

/* totals and phase count are derived, they are ignored when decoding */
impl From<ElectricityStateJson> for ElectricityState {
    fn from(j: ElectricityStateJson) -> Self {
        return ElectricityState {
            current: [j.l1_current, j.l2_current, j.l3_current],
            power: [j.l1_power, j.l2_power, j.l3_power],
            voltage: [j.l1_voltage, j.l2_voltage, j.l3_voltage],
        };
    }
}

/// Cumulative energy in kWh as counted by the meter itself.
///
/// Some meters report a total directly, others only per phase. A total set
/// with [`ElectricityUsage::set_total_energy_consumed`] wins over the sum of
/// the per phase values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ElectricityUsageJson", into = "ElectricityUsageJson")]
pub struct ElectricityUsage {
    energy_consumed: [f64; MAX_PHASES],
    energy_provided: [f64; MAX_PHASES],
    total_energy_consumed: f64,
    total_energy_provided: f64,
}

impl ElectricityUsage {
    pub fn new() -> Self {
        return ElectricityUsage::default();
    }

    pub fn energy_consumed(&self, line: LineIndex) -> f64 {
        return self.energy_consumed.get(line).copied().unwrap_or(0.0);
    }

    pub fn energy_provided(&self, line: LineIndex) -> f64 {
        return self.energy_provided.get(line).copied().unwrap_or(0.0);
    }

    pub fn set_energy_consumed(&mut self, line: LineIndex, value: f64) -> Result<(), ModelError> {
        check_line(line)?;
        self.energy_consumed[line] = value;
        return Ok(());
    }

    pub fn set_energy_provided(&mut self, line: LineIndex, value: f64) -> Result<(), ModelError> {
        check_line(line)?;
        self.energy_provided[line] = value;
        return Ok(());
    }

    pub fn set_total_energy_consumed(&mut self, value: f64) {
        self.total_energy_consumed = value;
    }

    pub fn set_total_energy_provided(&mut self, value: f64) {
        self.total_energy_provided = value;
    }

    pub fn total_energy_consumed(&self) -> f64 {
        if self.total_energy_consumed != 0.0 {
            return self.total_energy_consumed;
        }
        return self.energy_consumed.iter().sum();
    }

    pub fn total_energy_provided(&self) -> f64 {
        if self.total_energy_provided != 0.0 {
            return self.total_energy_provided;
        }
        return self.energy_provided.iter().sum();
    }

    pub fn is_zero(&self) -> bool {
        return self.total_energy_consumed() == 0.0 && self.total_energy_provided() == 0.0;
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for line in 0..MAX_PHASES {
            check_non_negative(&format!("l{}_energy_consumed", line + 1), self.energy_consumed[line])?;
            check_non_negative(&format!("l{}_energy_provided", line + 1), self.energy_provided[line])?;
        }
        check_non_negative("total_energy_consumed", self.total_energy_consumed)?;
        check_non_negative("total_energy_provided", self.total_energy_provided)?;
        return Ok(());
    }

    pub fn is_valid(&self) -> bool {
        return self.validate().is_ok();
    }
}

#[derive(Serialize, Deserialize)]
struct ElectricityUsageJson {
    #[serde(default)]
    l1_energy_consumed: f64,
    #[serde(default)]
    l2_energy_consumed: f64,
    #[serde(default)]
    l3_energy_consumed: f64,
    #[serde(default)]
    total_energy_consumed: f64,
    #[serde(default)]
    l1_energy_provided: f64,
    #[serde(default)]
    l2_energy_provided: f64,
    #[serde(default)]
    l3_energy_provided: f64,
    #[serde(default)]
    total_energy_provided: f64,
}

impl From<ElectricityUsage> for ElectricityUsageJson {
    fn from(u: ElectricityUsage) -> Self {
        return ElectricityUsageJson {
            l1_energy_consumed: u.energy_consumed[0],
            l2_energy_consumed: u.energy_consumed[1],
            l3_energy_consumed: u.energy_consumed[2],
            total_energy_consumed: u.total_energy_consumed(),
            l1_energy_provided: u.energy_provided[0],
            l2_energy_provided: u.energy_provided[1],
            l3_energy_provided: u.energy_provided[2],
            total_energy_provided: u.total_energy_provided(),
        };
    }
}

impl From<ElectricityUsageJson> for ElectricityUsage {
    fn from(j: ElectricityUsageJson) -> Self {
        return ElectricityUsage {
            energy_consumed: [j.l1_energy_consumed, j.l2_energy_consumed, j.l3_energy_consumed],
            energy_provided: [j.l1_energy_provided, j.l2_energy_provided, j.l3_energy_provided],
            total_energy_consumed: j.total_energy_consumed,
            total_energy_provided: j.total_energy_provided,
        };
    }
}
