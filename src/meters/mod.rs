use async_trait::async_trait;
use chrono::{DateTime, Local, Timelike};
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::metering_modbus::{read_block, write_holding, ConnectionRegistry, Encoding, ModbusError, RegisterBlock, RegisterValue, SharedClient};
use crate::models::{BatteryState, ElectricityState, ElectricityUsage, EnergySourceRole, GasUsage, LineIndex, MeterAttribute, MeterBrand, WaterUsage, MAX_PHASES};

pub mod abb;
pub mod carlo_gavazzi;
pub mod dsmr;
pub mod prober;
pub mod victron;
#[cfg(test)]
pub(crate) mod testing;

pub use prober::{MeterProber, ProbeRequest};

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("modbus error: {0}")]
    Modbus(#[from] ModbusError),
    #[error("device is not a {0} meter")]
    NotRecognized(MeterBrand),
    #[error("unsupported {brand} model {model}")]
    UnsupportedModel { brand: MeterBrand, model: String },
    #[error("initialization failed: {0}")]
    Initialization(String),
    #[error("telegram error: {0}")]
    Telegram(#[from] dsmr::TelegramError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no telegram received within {0:?}")]
    NoTelegram(Duration),
}

/// Everything one polling tick collects from the meters of a source.
///
/// A fresh zero-valued instance is handed to every meter of the source in
/// turn, each meter only writes the lines and attributes it is configured for.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeterReadings {
    pub state: ElectricityState,
    pub usage: ElectricityUsage,
    pub battery: BatteryState,
    pub gas: GasUsage,
    pub water: WaterUsage,
}

/// Per-slot settings every meter carries regardless of its brand
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSetup {
    pub role: EnergySourceRole,
    pub line_indices: Vec<LineIndex>,
    pub attributes: Vec<MeterAttribute>,
    pub update_interval: Duration,
}

impl MeterSetup {
    pub fn has(&self, attribute: MeterAttribute) -> bool {
        return self.attributes.contains(&attribute);
    }
}

pub trait BrandInfo {
    fn brand(&self) -> MeterBrand;
    fn model(&self) -> String;
    fn serial(&self) -> String;
}

pub trait AttributeFilter {
    fn attributes(&self) -> &[MeterAttribute];

    fn has_state_attribute(&self) -> bool {
        return self.attributes().contains(&MeterAttribute::State);
    }

    fn has_usage_attribute(&self) -> bool {
        return self.attributes().contains(&MeterAttribute::Usage);
    }
}

/// Meters living on a Modbus bus taken from the [`ConnectionRegistry`]
pub trait ModbusBound {
    fn connect_url(&self) -> &str;
    fn unit_id(&self) -> u8;
    /// Baud rate the bus was detected at, 0 for network transports
    fn baud_rate(&self) -> u32;
}

#[async_trait]
pub trait EnergyMeter: BrandInfo + AttributeFilter + Send + Sync {
    fn update_interval(&self) -> Duration;
    fn line_indices(&self) -> &[LineIndex];

    /// Bus details of meters read over Modbus
    fn modbus(&self) -> Option<&dyn ModbusBound> {
        return None;
    }

    /// Writes the latest values into `readings`, returns whether an instant value changed.
    ///
    /// Read failures are logged and leave the previously decoded values in place.
    async fn update_values(&mut self, readings: &mut MeterReadings) -> bool;

    /// Releases the bus or port, the meter is not polled afterwards
    async fn shutdown(&mut self);
}

/// Allows cumulative totals to be read once per wall-clock minute
#[derive(Debug, Default)]
pub struct TotalsGate {
    last_minute: Option<u32>,
}

impl TotalsGate {
    pub fn new() -> Self {
        return TotalsGate::default();
    }

    pub fn due(&mut self, now: DateTime<Local>) -> bool {
        let minute = now.minute();
        if self.last_minute == Some(minute) {
            return false;
        }
        self.last_minute = Some(minute);
        return true;
    }
}

/// Maps device phases onto configured line indices.
///
/// A three-phase device reports phase `n` for line `n`. A single-phase device
/// reports its only phase for the first configured line.
pub fn phase_pairs(lines: &[LineIndex], single_phase: bool) -> Vec<(usize, LineIndex)> {
    if single_phase {
        return lines.first().map(|l| vec![(0, *l)]).unwrap_or_default();
    }
    return lines.iter().filter(|l| **l < MAX_PHASES).map(|l| (*l, *l)).collect();
}

/// Aggregate totals are only meaningful when the meter covers every line
pub fn covers_all_lines(lines: &[LineIndex]) -> bool {
    return (0..MAX_PHASES).all(|l| lines.contains(&l));
}

/// Share of a total that the device cannot split per phase
pub fn split_evenly(total: f64, lines: &[LineIndex]) -> f64 {
    if lines.is_empty() {
        return 0.0;
    }
    return total / lines.len() as f64;
}

pub fn merge_state(dst: &mut ElectricityState, src: &ElectricityState, pairs: &[(usize, LineIndex)]) {
    for (phase, line) in pairs {
        let _ = dst.set_voltage(*line, src.voltage(*phase));
        let _ = dst.set_current(*line, src.current(*phase));
        let _ = dst.set_power(*line, src.power(*phase));
    }
}

pub fn merge_usage(dst: &mut ElectricityUsage, src: &ElectricityUsage, pairs: &[(usize, LineIndex)], with_totals: bool) {
    for (phase, line) in pairs {
        let _ = dst.set_energy_consumed(*line, src.energy_consumed(*phase));
        let _ = dst.set_energy_provided(*line, src.energy_provided(*phase));
    }
    if with_totals {
        dst.set_total_energy_consumed(src.total_energy_consumed());
        dst.set_total_energy_provided(src.total_energy_provided());
    }
}

/// Bus access of one Modbus meter, bound to its unit id
pub struct ModbusLink {
    registry: Arc<ConnectionRegistry>,
    client: SharedClient,
    url: String,
    unit_id: u8,
    baud_rate: u32,
    encoding: Encoding,
    released: bool,
}

impl ModbusLink {
    pub fn new(registry: Arc<ConnectionRegistry>, client: SharedClient, url: &str, unit_id: u8, baud_rate: u32, encoding: Encoding) -> Self {
        return ModbusLink {
            registry,
            client,
            url: url.to_string(),
            unit_id,
            baud_rate,
            encoding,
            released: false,
        };
    }

    pub fn url(&self) -> &str {
        return &self.url;
    }

    pub fn unit_id(&self) -> u8 {
        return self.unit_id;
    }

    pub fn baud_rate(&self) -> u32 {
        return self.baud_rate;
    }

    pub fn encoding(&self) -> Encoding {
        return self.encoding;
    }

    pub fn log_prefix(&self) -> String {
        return format!("[{}#{}]", self.url, self.unit_id);
    }

    pub async fn read(&self, block: &RegisterBlock) -> Result<Vec<u16>, ModbusError> {
        return read_block(&self.client, self.unit_id, block).await;
    }

    /// Reads from another unit on the same bus
    pub async fn read_unit(&self, unit_id: u8, block: &RegisterBlock) -> Result<Vec<u16>, ModbusError> {
        return read_block(&self.client, unit_id, block).await;
    }

    pub async fn write(&self, address: u16, value: u16) -> Result<(), ModbusError> {
        return write_holding(&self.client, self.unit_id, address, value).await;
    }

    pub fn value(&self, regs: &[u16], value: &RegisterValue) -> f64 {
        return value.read(regs, self.encoding).unwrap_or(0.0);
    }

    /// Gives the bus lease back, only the first call has an effect
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.registry.release(&self.url).await;
    }
}

/// Decoded values of a Modbus meter kept between ticks
#[derive(Debug, Default)]
pub struct ValueCache {
    pub state: ElectricityState,
    pub usage: ElectricityUsage,
    pub battery: BatteryState,
    pub gate: TotalsGate,
}

impl ValueCache {
    /// Stores a fresh instant reading, returns whether it differs from the last one
    pub fn store_state(&mut self, state: ElectricityState) -> bool {
        let changed = self.state != state;
        self.state = state;
        return changed;
    }

    pub fn store_battery(&mut self, battery: BatteryState) -> bool {
        let changed = self.battery != battery;
        self.battery = battery;
        return changed;
    }

    /// Copies the cached values into the tick readings
    pub fn fill(&self, readings: &mut MeterReadings, setup: &MeterSetup, single_phase: bool) {
        let pairs = phase_pairs(&setup.line_indices, single_phase);
        if setup.has(MeterAttribute::State) {
            merge_state(&mut readings.state, &self.state, &pairs);
        }
        if setup.has(MeterAttribute::Usage) {
            let with_totals = covers_all_lines(&setup.line_indices);
            merge_usage(&mut readings.usage, &self.usage, &pairs, with_totals);
        }
    }
}

pub(crate) fn log_read_failure(prefix: &str, what: &str, e: &ModbusError) {
    warn!("{prefix} reading {what} failed, keeping last values: {e}");
}
