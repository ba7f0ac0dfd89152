/*
    ABB B-series meters (B21 single-phase, B23/B24 three-phase)
*/

use async_trait::async_trait;
use chrono::Local;
use log::{debug, info, warn};
use std::time::Duration;

use crate::metering_modbus::{decode_ascii, Decoder, Encoding, RegisterBlock, RegisterValue, Width};
use crate::models::{ElectricityState, ElectricityUsage, LineIndex, MeterAttribute, MeterBrand, MAX_PHASES};
use super::{log_read_failure, AttributeFilter, BrandInfo, EnergyMeter, MeterError, MeterReadings, MeterSetup, ModbusBound, ModbusLink, ValueCache};

pub const ENCODING: Encoding = Encoding::BIG_ENDIAN;

const TYPE_DESIGNATION: RegisterBlock = RegisterBlock::holding(0x8960, 6);
const SERIAL: RegisterBlock = RegisterBlock::holding(0x8900, 2);

const INSTANT: RegisterBlock = RegisterBlock::holding(0x5B00, 0x1C);
const VOLTAGE: [usize; MAX_PHASES] = [0x00, 0x02, 0x04];
const CURRENT: [usize; MAX_PHASES] = [0x0C, 0x0E, 0x10];
const POWER: [usize; MAX_PHASES] = [0x16, 0x18, 0x1A];

const ENERGY_TOTALS: RegisterBlock = RegisterBlock::holding(0x5000, 8);
const IMPORT_TOTAL: usize = 0x00;
const EXPORT_TOTAL: usize = 0x04;

const ENERGY_PHASES: RegisterBlock = RegisterBlock::holding(0x5460, 0x18);
const IMPORT: [usize; MAX_PHASES] = [0x00, 0x04, 0x08];
const EXPORT: [usize; MAX_PHASES] = [0x0C, 0x10, 0x14];

const VOLT: Decoder = Decoder::unsigned(10.0);
const AMP: Decoder = Decoder::unsigned(100.0);
const WATT: Decoder = Decoder::signed(100.0);
const KWH: Decoder = Decoder::unsigned(100.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    B21,
    B23,
    B24,
}

impl Family {
    pub fn from_designation(designation: &str) -> Option<Self> {
        if designation.starts_with("B21") {
            return Some(Family::B21);
        }
        if designation.starts_with("B23") {
            return Some(Family::B23);
        }
        if designation.starts_with("B24") {
            return Some(Family::B24);
        }
        return None;
    }

    pub fn is_single_phase(&self) -> bool {
        return *self == Family::B21;
    }
}

pub struct AbbMeter {
    link: ModbusLink,
    setup: MeterSetup,
    family: Family,
    designation: String,
    serial: String,
    cache: ValueCache,
}

impl AbbMeter {
    pub async fn probe(link: ModbusLink, setup: MeterSetup) -> Result<Self, MeterError> {
        let prefix = link.log_prefix();
        let designation = decode_ascii(&link.read(&TYPE_DESIGNATION).await?);
        if designation.is_empty() {
            return Err(MeterError::NotRecognized(MeterBrand::Abb));
        }

        let family = match Family::from_designation(&designation) {
            Some(f) => f,
            None => {
                info!("{prefix} ABB meter type {designation} is not supported");
                return Err(MeterError::UnsupportedModel { brand: MeterBrand::Abb, model: designation });
            }
        };

        let serial = match link.read(&SERIAL).await {
            Ok(regs) => link.encoding().u32_at(&regs, 0).map(|s| s.to_string()).unwrap_or_default(),
            Err(e) => {
                warn!("{prefix} could not read serial number: {e}");
                String::new()
            }
        };

        info!("{prefix} detected ABB {designation} serial {serial}");
        return Ok(AbbMeter {
            link,
            setup,
            family,
            designation,
            serial,
            cache: ValueCache::default(),
        });
    }

    fn device_phases(&self) -> Vec<usize> {
        if self.family.is_single_phase() {
            return vec![0];
        }
        return self.setup.line_indices.iter().copied().filter(|l| *l < MAX_PHASES).collect();
    }

    async fn read_instant(&self) -> Result<ElectricityState, MeterError> {
        let regs = self.link.read(&INSTANT).await?;
        let mut state = ElectricityState::new();
        for phase in self.device_phases() {
            let v = RegisterValue::new(VOLTAGE[phase], Width::W32, VOLT);
            let a = RegisterValue::new(CURRENT[phase], Width::W32, AMP);
            let w = RegisterValue::new(POWER[phase], Width::W32, WATT);
            state.set_voltage(phase, self.link.value(&regs, &v) as f32).ok();
            state.set_current(phase, self.link.value(&regs, &a) as f32).ok();
            state.set_power(phase, self.link.value(&regs, &w) as f32).ok();
        }
        return Ok(state);
    }

    async fn read_totals(&self) -> Result<ElectricityUsage, MeterError> {
        let totals = self.link.read(&ENERGY_TOTALS).await?;
        let import_total = self.link.value(&totals, &RegisterValue::new(IMPORT_TOTAL, Width::W64, KWH));
        let export_total = self.link.value(&totals, &RegisterValue::new(EXPORT_TOTAL, Width::W64, KWH));

        let mut usage = ElectricityUsage::new();
        if self.family.is_single_phase() {
            usage.set_energy_consumed(0, import_total).ok();
            usage.set_energy_provided(0, export_total).ok();
            return Ok(usage);
        }

        let regs = self.link.read(&ENERGY_PHASES).await?;
        for phase in self.device_phases() {
            let import = RegisterValue::new(IMPORT[phase], Width::W64, KWH);
            let export = RegisterValue::new(EXPORT[phase], Width::W64, KWH);
            usage.set_energy_consumed(phase, self.link.value(&regs, &import)).ok();
            usage.set_energy_provided(phase, self.link.value(&regs, &export)).ok();
        }
        usage.set_total_energy_consumed(import_total);
        usage.set_total_energy_provided(export_total);
        return Ok(usage);
    }
}

impl BrandInfo for AbbMeter {
    fn brand(&self) -> MeterBrand {
        return MeterBrand::Abb;
    }

    fn model(&self) -> String {
        return self.designation.clone();
    }

    fn serial(&self) -> String {
        return self.serial.clone();
    }
}

impl AttributeFilter for AbbMeter {
    fn attributes(&self) -> &[MeterAttribute] {
        return &self.setup.attributes;
    }
}

impl ModbusBound for AbbMeter {
    fn connect_url(&self) -> &str {
        return self.link.url();
    }

    fn unit_id(&self) -> u8 {
        return self.link.unit_id();
    }

    fn baud_rate(&self) -> u32 {
        return self.link.baud_rate();
    }
}

#[async_trait]
impl EnergyMeter for AbbMeter {
    fn update_interval(&self) -> Duration {
        return self.setup.update_interval;
    }

    fn line_indices(&self) -> &[LineIndex] {
        return &self.setup.line_indices;
    }

    fn modbus(&self) -> Option<&dyn ModbusBound> {
        return Some(self);
    }

    async fn update_values(&mut self, readings: &mut MeterReadings) -> bool {
        let prefix = self.link.log_prefix();
        let mut changed = false;

        if self.has_state_attribute() {
            match self.read_instant().await {
                Ok(state) => changed = self.cache.store_state(state),
                Err(MeterError::Modbus(e)) => log_read_failure(&prefix, "instant values", &e),
                Err(e) => warn!("{prefix} reading instant values failed: {e}"),
            }
        }

        if self.has_usage_attribute() && self.cache.gate.due(Local::now()) {
            match self.read_totals().await {
                Ok(usage) => self.cache.usage = usage,
                Err(e) => warn!("{prefix} reading totals failed, keeping last values: {e}"),
            }
        }

        self.cache.fill(readings, &self.setup, self.family.is_single_phase());
        debug!("{prefix} updated, changed={changed}");
        return changed;
    }

    async fn shutdown(&mut self) {
        self.link.release().await;
    }
}
