/*
    Victron GX devices exposing their services via Modbus TCP

    The GX itself answers on unit 100, every service (grid meter, pv inverter,
    battery) on the unit id of its device instance. Grid and pv inverter
    services keep serial and phase count at different registers, so these are
    read on the first poll once the role of the meter is known.
*/

use async_trait::async_trait;
use chrono::Local;
use log::{debug, info, warn};
use std::time::Duration;

use crate::metering_modbus::{decode_ascii, Decoder, Encoding, RegisterBlock, RegisterValue, Width};
use crate::models::{BatteryState, ElectricityState, ElectricityUsage, EnergySourceRole, LineIndex, MeterAttribute, MeterBrand, MAX_PHASES};
use super::{log_read_failure, split_evenly, AttributeFilter, BrandInfo, EnergyMeter, MeterError, MeterReadings, MeterSetup, ModbusBound, ModbusLink, ValueCache};

pub const ENCODING: Encoding = Encoding::BIG_ENDIAN;

/// Unit id of the GX system service
pub const SYSTEM_UNIT: u8 = 100;
const SYSTEM_SERIAL: RegisterBlock = RegisterBlock::holding(800, 6);

const fn v16(index: usize, decoder: Decoder) -> RegisterValue {
    return RegisterValue::new(index, Width::W16, decoder);
}

const fn v32(index: usize, decoder: Decoder) -> RegisterValue {
    return RegisterValue::new(index, Width::W32, decoder);
}

/// Register map of one service
struct ServiceMap {
    serial: RegisterBlock,
    phase_count: RegisterBlock,
    instant: RegisterBlock,
    voltage: [RegisterValue; MAX_PHASES],
    current: [RegisterValue; MAX_PHASES],
    power: [RegisterValue; MAX_PHASES],
    totals: RegisterBlock,
    energy: [RegisterValue; MAX_PHASES],
    /// export counter without per phase split
    export_total: Option<RegisterValue>,
    import_total: Option<RegisterValue>,
}

/* com.victronenergy.grid */
static GRID: ServiceMap = ServiceMap {
    serial: RegisterBlock::holding(2609, 7),
    phase_count: RegisterBlock::holding(2641, 1),
    instant: RegisterBlock::holding(2600, 22),
    voltage: [v16(16, Decoder::unsigned(10.0)), v16(18, Decoder::unsigned(10.0)), v16(20, Decoder::unsigned(10.0))],
    current: [v16(17, Decoder::signed(10.0)), v16(19, Decoder::signed(10.0)), v16(21, Decoder::signed(10.0))],
    power: [v16(0, Decoder::signed(1.0)), v16(1, Decoder::signed(1.0)), v16(2, Decoder::signed(1.0))],
    totals: RegisterBlock::holding(2622, 16),
    energy: [v32(0, Decoder::unsigned(100.0)), v32(2, Decoder::unsigned(100.0)), v32(4, Decoder::unsigned(100.0))],
    export_total: Some(v32(14, Decoder::unsigned(100.0))),
    import_total: Some(v32(12, Decoder::unsigned(100.0))),
};

/* com.victronenergy.pvinverter */
static PV_INVERTER: ServiceMap = ServiceMap {
    serial: RegisterBlock::holding(1039, 7),
    phase_count: RegisterBlock::holding(1056, 1),
    instant: RegisterBlock::holding(1027, 12),
    voltage: [v16(0, Decoder::unsigned(10.0)), v16(4, Decoder::unsigned(10.0)), v16(8, Decoder::unsigned(10.0))],
    current: [v16(1, Decoder::signed(10.0)), v16(5, Decoder::signed(10.0)), v16(9, Decoder::signed(10.0))],
    power: [v16(2, Decoder::unsigned(1.0)), v16(6, Decoder::unsigned(1.0)), v16(10, Decoder::unsigned(1.0))],
    totals: RegisterBlock::holding(1046, 6),
    energy: [v32(0, Decoder::unsigned(100.0)), v32(2, Decoder::unsigned(100.0)), v32(4, Decoder::unsigned(100.0))],
    export_total: None,
    import_total: None,
};

/* com.victronenergy.battery */
const BATTERY: RegisterBlock = RegisterBlock::holding(258, 9);
const BATTERY_POWER: RegisterValue = v16(0, Decoder::signed(1.0));
const BATTERY_VOLTAGE: RegisterValue = v16(1, Decoder::unsigned(100.0));
const BATTERY_CURRENT: RegisterValue = v16(3, Decoder::signed(10.0));
const BATTERY_SOC: RegisterValue = v16(8, Decoder::unsigned(10.0));
const BATTERY_SOH: RegisterBlock = RegisterBlock::holding(304, 1);

pub struct VictronMeter {
    link: ModbusLink,
    setup: MeterSetup,
    system_serial: String,
    serial: String,
    identity_read: bool,
    phases: Option<u16>,
    cache: ValueCache,
}

impl VictronMeter {
    /// Confirms a GX device answers on the system unit
    pub async fn probe(link: ModbusLink, setup: MeterSetup) -> Result<Self, MeterError> {
        let prefix = link.log_prefix();
        if setup.role == EnergySourceRole::EvCharger {
            info!("{prefix} Victron meters are not supported as EV charger");
            return Err(MeterError::NotRecognized(MeterBrand::Victron));
        }

        let system_serial = decode_ascii(&link.read_unit(SYSTEM_UNIT, &SYSTEM_SERIAL).await?);
        if system_serial.is_empty() {
            info!("{prefix} no Victron GX answered on unit {SYSTEM_UNIT}");
            return Err(MeterError::NotRecognized(MeterBrand::Victron));
        }

        info!("{prefix} detected Victron GX {system_serial} for the {} service", setup.role);
        return Ok(VictronMeter {
            link,
            setup,
            system_serial,
            serial: String::new(),
            identity_read: false,
            phases: None,
            cache: ValueCache::default(),
        });
    }

    fn service(&self) -> &'static ServiceMap {
        if self.setup.role == EnergySourceRole::Pv {
            return &PV_INVERTER;
        }
        return &GRID;
    }

    fn single_phase(&self) -> bool {
        return self.phases == Some(1);
    }

    fn device_phases(&self) -> Vec<usize> {
        if self.single_phase() {
            return vec![0];
        }
        return self.setup.line_indices.iter().copied().filter(|l| *l < MAX_PHASES).collect();
    }

    /// Serial and phase count of the grid or pv inverter service, the serial may be blank
    async fn read_identity(&mut self) {
        let prefix = self.link.log_prefix();
        let service = self.service();
        match self.link.read(&service.serial).await {
            Ok(regs) => self.serial = decode_ascii(&regs),
            Err(e) => {
                warn!("{prefix} could not read service serial: {e}");
                return;
            }
        }
        match self.link.read(&service.phase_count).await {
            Ok(regs) => self.phases = Some(regs[0]),
            Err(e) => debug!("{prefix} no phase count available: {e}"),
        }
        self.identity_read = true;
        info!("{prefix} Victron {} service serial {} with {:?} phases", self.setup.role, self.serial, self.phases);
    }

    async fn read_instant(&self) -> Result<ElectricityState, MeterError> {
        let service = self.service();
        let regs = self.link.read(&service.instant).await?;
        let mut state = ElectricityState::new();
        for phase in self.device_phases() {
            state.set_voltage(phase, self.link.value(&regs, &service.voltage[phase]) as f32).ok();
            state.set_current(phase, self.link.value(&regs, &service.current[phase]) as f32).ok();
            state.set_power(phase, self.link.value(&regs, &service.power[phase]) as f32).ok();
        }
        return Ok(state);
    }

    async fn read_totals(&self) -> Result<ElectricityUsage, MeterError> {
        let service = self.service();
        let regs = self.link.read(&service.totals).await?;
        let phases = self.device_phases();
        let mut usage = ElectricityUsage::new();

        if self.setup.role == EnergySourceRole::Pv {
            /* pv yield is energy the source provides */
            for phase in &phases {
                usage.set_energy_provided(*phase, self.link.value(&regs, &service.energy[*phase])).ok();
            }
            return Ok(usage);
        }

        let export = service.export_total.map(|v| self.link.value(&regs, &v)).unwrap_or(0.0);
        for phase in &phases {
            usage.set_energy_consumed(*phase, self.link.value(&regs, &service.energy[*phase])).ok();
            usage.set_energy_provided(*phase, split_evenly(export, &phases)).ok();
        }
        if let Some(v) = &service.import_total {
            usage.set_total_energy_consumed(self.link.value(&regs, v));
            usage.set_total_energy_provided(export);
        }
        return Ok(usage);
    }

    async fn read_battery(&self) -> Result<BatteryState, MeterError> {
        let regs = self.link.read(&BATTERY).await?;
        let mut battery = BatteryState {
            power: self.link.value(&regs, &BATTERY_POWER) as f32,
            voltage: self.link.value(&regs, &BATTERY_VOLTAGE) as f32,
            current: self.link.value(&regs, &BATTERY_CURRENT) as f32,
            state_of_charge: self.link.value(&regs, &BATTERY_SOC) as f32,
            state_of_health: 0.0,
        };
        /* not every BMS reports its health */
        if let Ok(soh) = self.link.read(&BATTERY_SOH).await {
            battery.state_of_health = self.link.value(&soh, &v16(0, Decoder::unsigned(10.0))) as f32;
        }
        return Ok(battery);
    }

    async fn update_battery(&mut self, readings: &mut MeterReadings) -> bool {
        let prefix = self.link.log_prefix();
        let mut changed = false;
        match self.read_battery().await {
            Ok(battery) => changed = self.cache.store_battery(battery),
            Err(MeterError::Modbus(e)) => log_read_failure(&prefix, "battery values", &e),
            Err(e) => warn!("{prefix} reading battery values failed: {e}"),
        }
        readings.battery = self.cache.battery;
        return changed;
    }
}

impl BrandInfo for VictronMeter {
    fn brand(&self) -> MeterBrand {
        return MeterBrand::Victron;
    }

    fn model(&self) -> String {
        return format!("GX {} ({})", self.setup.role, self.system_serial);
    }

    fn serial(&self) -> String {
        if self.serial.is_empty() {
            return self.system_serial.clone();
        }
        return self.serial.clone();
    }
}

impl AttributeFilter for VictronMeter {
    fn attributes(&self) -> &[MeterAttribute] {
        return &self.setup.attributes;
    }
}

impl ModbusBound for VictronMeter {
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
impl EnergyMeter for VictronMeter {
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
        if self.setup.role == EnergySourceRole::Battery {
            return self.update_battery(readings).await;
        }

        let prefix = self.link.log_prefix();
        let mut changed = false;

        if self.has_state_attribute() {
            if !self.identity_read {
                self.read_identity().await;
            }
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

        self.cache.fill(readings, &self.setup, self.single_phase());
        return changed;
    }

    async fn shutdown(&mut self) {
        self.link.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_modbus::testing::{FakeBus, FakeDevice, FakeFactory};
    use crate::metering_modbus::{ConnectionConfig, ConnectionRegistry};
    use std::sync::Arc;

    const GX_SERIAL: [u16; 6] = [0x6332, 0x6437, 0x3265, 0x3139, 0x6100, 0];

    async fn link(factory: &Arc<FakeFactory>, unit: u8) -> ModbusLink {
        let registry = ConnectionRegistry::new(factory.clone());
        let url = "tcp://venus.local";
        let (client, _) = registry.get_or_create(&ConnectionConfig::new(url, 0, Duration::from_millis(50))).await.unwrap();
        return ModbusLink::new(registry, client, url, unit, 0, ENCODING);
    }

    fn setup(role: EnergySourceRole, lines: Vec<LineIndex>) -> MeterSetup {
        return MeterSetup {
            role,
            line_indices: lines,
            attributes: vec![MeterAttribute::State, MeterAttribute::Usage],
            update_interval: Duration::from_secs(1),
        };
    }

    fn grid_meter() -> FakeDevice {
        let mut instant = vec![0u16; 22];
        instant[0] = (-1200i16) as u16;
        instant[1] = 300;
        instant[16] = 2305;
        instant[17] = (-52i16) as u16;
        instant[18] = 2311;
        instant[19] = 13;

        let mut totals = vec![0u16; 16];
        totals[1] = 10_000;
        totals[3] = 20_000;
        totals[5] = 30_000;
        totals[13] = 60_000;
        totals[15] = 3_000;

        return FakeDevice::new()
            .with_holding(2600, &instant)
            .with_holding(2609, &[0x4854, 0x3132, 0x3300, 0, 0, 0, 0])
            .with_holding(2622, &totals)
            .with_holding(2641, &[3]);
    }

    #[tokio::test]
    async fn test_probe_needs_gx() {
        let bus = FakeBus::new();
        bus.add_device(30, grid_meter());
        let factory = FakeFactory::new(bus.clone());
        let r = VictronMeter::probe(link(&factory, 30).await, setup(EnergySourceRole::Grid, vec![0])).await;
        assert!(r.is_err());

        bus.add_device(SYSTEM_UNIT, FakeDevice::new().with_holding(800, &GX_SERIAL));
        let meter = VictronMeter::probe(link(&factory, 30).await, setup(EnergySourceRole::Grid, vec![0])).await.unwrap();
        assert_eq!(meter.serial(), "c2d72e19a");
    }

    #[tokio::test]
    async fn test_grid_serial_read_lazily() {
        let bus = FakeBus::new();
        bus.add_device(SYSTEM_UNIT, FakeDevice::new().with_holding(800, &GX_SERIAL));
        bus.add_device(30, grid_meter());
        let factory = FakeFactory::new(bus.clone());

        let mut meter = VictronMeter::probe(link(&factory, 30).await, setup(EnergySourceRole::Grid, vec![0, 1, 2])).await.unwrap();
        let mut readings = MeterReadings::default();
        assert!(meter.update_values(&mut readings).await);
        assert_eq!(meter.serial(), "HT123");

        assert_eq!(readings.state.voltage(0), 230.5);
        assert_eq!(readings.state.current(0), -5.2);
        assert_eq!(readings.state.power(0), -1200.0);
        assert_eq!(readings.state.current(1), 1.3);

        assert_eq!(readings.usage.energy_consumed(0), 100.0);
        assert_eq!(readings.usage.total_energy_consumed(), 600.0);
        /* export only exists as a total */
        assert_eq!(readings.usage.energy_provided(2), 10.0);
        assert_eq!(readings.usage.total_energy_provided(), 30.0);

        let reads = bus.read_count();
        meter.update_values(&mut MeterReadings::default()).await;
        /* serial is known, only the instant block is read */
        assert_eq!(bus.read_count(), reads + 1);
    }

    #[tokio::test]
    async fn test_blank_service_serial_read_once() {
        let bus = FakeBus::new();
        bus.add_device(SYSTEM_UNIT, FakeDevice::new().with_holding(800, &GX_SERIAL));
        bus.add_device(30, grid_meter().with_zeros(2609, 7));
        let factory = FakeFactory::new(bus.clone());

        let mut meter = VictronMeter::probe(link(&factory, 30).await, setup(EnergySourceRole::Grid, vec![0])).await.unwrap();
        meter.update_values(&mut MeterReadings::default()).await;
        /* falls back to the GX serial */
        assert_eq!(meter.serial(), "c2d72e19a");

        let reads = bus.read_count();
        meter.update_values(&mut MeterReadings::default()).await;
        meter.update_values(&mut MeterReadings::default()).await;
        assert_eq!(bus.read_count(), reads + 2);
    }

    #[tokio::test]
    async fn test_battery() {
        let bus = FakeBus::new();
        bus.add_device(SYSTEM_UNIT, FakeDevice::new().with_holding(800, &GX_SERIAL));
        let mut block = vec![0u16; 9];
        block[0] = (-850i16) as u16;
        block[1] = 5230;
        block[3] = (-163i16) as u16;
        block[8] = 765;
        bus.add_device(225, FakeDevice::new().with_holding(258, &block).with_holding(304, &[990]));
        let factory = FakeFactory::new(bus);

        let mut meter = VictronMeter::probe(link(&factory, 225).await, setup(EnergySourceRole::Battery, vec![])).await.unwrap();
        let mut readings = MeterReadings::default();
        assert!(meter.update_values(&mut readings).await);
        assert_eq!(readings.battery.power, -850.0);
        assert_eq!(readings.battery.voltage, 52.3);
        assert_eq!(readings.battery.current, -16.3);
        assert_eq!(readings.battery.state_of_charge, 76.5);
        assert_eq!(readings.battery.state_of_health, 99.0);
        assert!(readings.state.is_zero());
    }
}
