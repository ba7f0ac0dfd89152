/*
    Carlo Gavazzi energy analyzers (EM24, EM3xx/ET3xx, EM1xx/ET1xx)

    All families answer with 32 bit values low word first. The EM24 only
    exposes the register layout used below in application H, a detected EM24
    in another application is switched over unless its front selector is locked.
*/

use async_trait::async_trait;
use chrono::Local;
use log::{debug, error, info, warn};
use std::time::Duration;

use crate::metering_modbus::{decode_ascii, Decoder, Encoding, RegisterBlock, RegisterValue, Width};
use crate::models::{ElectricityState, ElectricityUsage, LineIndex, MeterAttribute, MeterBrand, MAX_PHASES};
use super::{log_read_failure, split_evenly, AttributeFilter, BrandInfo, EnergyMeter, MeterError, MeterReadings, MeterSetup, ModbusBound, ModbusLink, ValueCache};

pub const ENCODING: Encoding = Encoding::LOW_WORD_FIRST;

const MODEL_ID: RegisterBlock = RegisterBlock::holding(0x000B, 1);
const SERIAL: RegisterBlock = RegisterBlock::holding(0x5000, 7);
const APPLICATION: u16 = 0x1101;
const FRONT_SELECTOR: u16 = 0x0304;

/// Application H, the only one exposing every register we read
pub const APPLICATION_H: u16 = 7;
const SELECTOR_LOCKED: u16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Em24,
    Em3xx,
    Em1xx,
}

impl Family {
    pub fn from_model_id(id: u16) -> Option<Self> {
        match id {
            1648..=1653 => Some(Family::Em24),
            330 | 331 | 332 | 335 | 336 | 340 | 341 | 345 | 346 | 347 => Some(Family::Em3xx),
            100..=105 | 120 | 121 => Some(Family::Em1xx),
            _ => None,
        }
    }

    pub fn is_single_phase(&self) -> bool {
        return *self == Family::Em1xx;
    }

    pub fn name(&self) -> &'static str {
        match self {
            Family::Em24 => "EM24",
            Family::Em3xx => "EM3xx",
            Family::Em1xx => "EM1xx",
        }
    }
}

/// Register positions of one family, relative to the block start
struct Layout {
    instant: RegisterBlock,
    voltage: [RegisterValue; MAX_PHASES],
    current: [RegisterValue; MAX_PHASES],
    power: [RegisterValue; MAX_PHASES],
    totals: RegisterBlock,
    consumed_total: Option<RegisterValue>,
    consumed: [Option<RegisterValue>; MAX_PHASES],
    provided_total: RegisterValue,
}

const fn v32(index: usize, decoder: Decoder) -> RegisterValue {
    return RegisterValue::new(index, Width::W32, decoder);
}

const VOLT: Decoder = Decoder::signed(10.0);
const AMP: Decoder = Decoder::unsigned(1000.0);
const WATT: Decoder = Decoder::signed(10.0);
const KWH: Decoder = Decoder::signed(10.0);

static THREE_PHASE: Layout = Layout {
    instant: RegisterBlock::holding(0x0000, 0x18),
    voltage: [v32(0x00, VOLT), v32(0x02, VOLT), v32(0x04, VOLT)],
    current: [v32(0x0C, AMP), v32(0x0E, AMP), v32(0x10, AMP)],
    power: [v32(0x12, WATT), v32(0x14, WATT), v32(0x16, WATT)],
    /* 0x0034 kWh(+) TOT .. 0x004E kWh(-) TOT */
    totals: RegisterBlock::holding(0x0034, 0x1C),
    consumed_total: Some(v32(0x00, KWH)),
    consumed: [Some(v32(0x0C, KWH)), Some(v32(0x0E, KWH)), Some(v32(0x10, KWH))],
    provided_total: v32(0x1A, KWH),
};

static SINGLE_PHASE: Layout = Layout {
    instant: RegisterBlock::holding(0x0000, 0x06),
    voltage: [v32(0x00, VOLT), v32(0x00, VOLT), v32(0x00, VOLT)],
    current: [v32(0x02, AMP), v32(0x02, AMP), v32(0x02, AMP)],
    power: [v32(0x04, WATT), v32(0x04, WATT), v32(0x04, WATT)],
    /* 0x0010 kWh(+) TOT, 0x0020 kWh(-) TOT */
    totals: RegisterBlock::holding(0x0010, 0x12),
    consumed_total: None,
    consumed: [Some(v32(0x00, KWH)), None, None],
    provided_total: v32(0x10, KWH),
};

/// Keeps the sign of the current in line with the sign of the power.
///
/// Several models only report the current magnitude, a phase feeding back
/// shows negative power with positive current.
pub fn correct_current_sign(power: f32, current: f32) -> f32 {
    if power < 0.0 && current > 0.0 {
        return -current;
    }
    return current;
}

pub struct CarloGavazziMeter {
    link: ModbusLink,
    setup: MeterSetup,
    family: Family,
    model_id: u16,
    serial: String,
    cache: ValueCache,
}

impl CarloGavazziMeter {
    /// Identifies the device by its model register, fails for anything that is no Carlo Gavazzi meter
    pub async fn probe(link: ModbusLink, setup: MeterSetup) -> Result<Self, MeterError> {
        let prefix = link.log_prefix();
        let regs = link.read(&MODEL_ID).await?;
        let model_id = regs[0];
        let family = match Family::from_model_id(model_id) {
            Some(f) => f,
            None => {
                info!("{prefix} model id {model_id} is no known Carlo Gavazzi meter");
                return Err(MeterError::NotRecognized(MeterBrand::CarloGavazzi));
            }
        };

        let serial = match link.read(&SERIAL).await {
            Ok(regs) => decode_ascii(&regs),
            Err(e) => {
                warn!("{prefix} could not read serial number: {e}");
                String::new()
            }
        };

        let meter = CarloGavazziMeter {
            link,
            setup,
            family,
            model_id,
            serial,
            cache: ValueCache::default(),
        };

        if family == Family::Em24 {
            meter.ensure_application_h().await?;
        }

        info!("{prefix} detected Carlo Gavazzi {} (model {model_id}) serial {}", family.name(), meter.serial);
        return Ok(meter);
    }

    async fn ensure_application_h(&self) -> Result<(), MeterError> {
        let prefix = self.link.log_prefix();
        let app = self.link.read(&RegisterBlock::holding(APPLICATION, 1)).await?[0];
        if app == APPLICATION_H {
            return Ok(());
        }

        let selector = self.link.read(&RegisterBlock::holding(FRONT_SELECTOR, 1)).await?[0];
        if selector == SELECTOR_LOCKED {
            warn!("{prefix} EM24 runs application {app} and the front selector is locked, values may be incomplete");
            return Ok(());
        }

        info!("{prefix} switching EM24 from application {app} to application H");
        if let Err(e) = self.link.write(APPLICATION, APPLICATION_H).await {
            error!("{prefix} switching to application H failed: {e}");
            return Err(MeterError::Initialization(format!("could not set application H: {e}")));
        }
        return Ok(());
    }

    fn layout(&self) -> &'static Layout {
        if self.family.is_single_phase() {
            return &SINGLE_PHASE;
        }
        return &THREE_PHASE;
    }

    fn device_phases(&self) -> Vec<usize> {
        if self.family.is_single_phase() {
            return vec![0];
        }
        return self.setup.line_indices.iter().copied().filter(|l| *l < MAX_PHASES).collect();
    }

    async fn read_instant(&self) -> Result<ElectricityState, MeterError> {
        let layout = self.layout();
        let regs = self.link.read(&layout.instant).await?;
        let mut state = ElectricityState::new();
        for phase in self.device_phases() {
            let power = self.link.value(&regs, &layout.power[phase]) as f32;
            let current = self.link.value(&regs, &layout.current[phase]) as f32;
            state.set_voltage(phase, self.link.value(&regs, &layout.voltage[phase]) as f32).ok();
            state.set_power(phase, power).ok();
            state.set_current(phase, correct_current_sign(power, current)).ok();
        }
        return Ok(state);
    }

    async fn read_totals(&self) -> Result<ElectricityUsage, MeterError> {
        let layout = self.layout();
        let regs = self.link.read(&layout.totals).await?;
        let mut usage = ElectricityUsage::new();

        let phases = self.device_phases();
        let provided = self.link.value(&regs, &layout.provided_total);
        for phase in &phases {
            if let Some(v) = &layout.consumed[*phase] {
                usage.set_energy_consumed(*phase, self.link.value(&regs, v)).ok();
            }
            /* no per phase export counter on these meters */
            usage.set_energy_provided(*phase, split_evenly(provided, &phases)).ok();
        }
        if let Some(v) = &layout.consumed_total {
            usage.set_total_energy_consumed(self.link.value(&regs, v));
            usage.set_total_energy_provided(provided);
        }
        return Ok(usage);
    }
}

impl BrandInfo for CarloGavazziMeter {
    fn brand(&self) -> MeterBrand {
        return MeterBrand::CarloGavazzi;
    }

    fn model(&self) -> String {
        return format!("{} ({})", self.family.name(), self.model_id);
    }

    fn serial(&self) -> String {
        return self.serial.clone();
    }
}

impl AttributeFilter for CarloGavazziMeter {
    fn attributes(&self) -> &[MeterAttribute] {
        return &self.setup.attributes;
    }
}

impl ModbusBound for CarloGavazziMeter {
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
impl EnergyMeter for CarloGavazziMeter {
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
