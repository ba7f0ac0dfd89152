use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::metering_modbus::{ConnectUrl, ConnectionConfig, ConnectionRegistry, Encoding};
use crate::models::MeterBrand;
use crate::serial::CANDIDATE_BAUD_RATES;
use super::abb::{self, AbbMeter};
use super::carlo_gavazzi::{self, CarloGavazziMeter};
use super::dsmr::{DsmrMeter, TelegramPortOpener};
use super::victron::{self, VictronMeter};
use super::{EnergyMeter, MeterError, MeterSetup, ModbusLink};

/// Brands tried on a Modbus bus when none is configured, first match wins
pub const MODBUS_PRIORITY: [MeterBrand; 3] = [MeterBrand::CarloGavazzi, MeterBrand::Abb, MeterBrand::Victron];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Modbus,
    Serial,
}

/// One configured meter slot
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    pub connect: String,
    pub transport: Transport,
    pub brand: Option<MeterBrand>,
    pub unit_id: u8,
    /// 0 sweeps the candidate rates on serial buses
    pub baud_rate: u32,
    pub setup: MeterSetup,
}

/// Finds out which meter sits behind a configured slot
pub struct MeterProber {
    registry: Arc<ConnectionRegistry>,
    ports: Arc<dyn TelegramPortOpener>,
    timeout: Duration,
    telegram_timeout: Duration,
}

impl MeterProber {
    pub fn new(registry: Arc<ConnectionRegistry>, ports: Arc<dyn TelegramPortOpener>, timeout: Duration, telegram_timeout: Duration) -> Self {
        return MeterProber { registry, ports, timeout, telegram_timeout };
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        return &self.registry;
    }

    /// Returns the first meter that identifies itself, None leaves the slot empty
    pub async fn probe(&self, req: &ProbeRequest) -> Option<Box<dyn EnergyMeter>> {
        let meter = match req.transport {
            Transport::Modbus => self.probe_modbus(req).await,
            Transport::Serial => self.probe_serial(req).await,
        };
        if meter.is_none() {
            warn!("No meter detected at {} unit {}, slot stays empty", req.connect, req.unit_id);
        }
        return meter;
    }

    async fn candidate_rates(&self, req: &ProbeRequest, url: &ConnectUrl) -> Vec<u32> {
        if !url.is_serial() {
            return vec![req.baud_rate];
        }
        /* one bus runs at one rate, an open bus is not swept or reopened */
        if let Some(client) = self.registry.cached(&req.connect) {
            let open_rate = client.lock().await.baud_rate();
            if req.baud_rate != 0 && req.baud_rate != open_rate {
                warn!("{} unit {} is configured for {} baud, but the bus is already open at {open_rate} baud",
                    req.connect, req.unit_id, req.baud_rate);
            }
            return vec![open_rate];
        }
        if req.baud_rate != 0 {
            return vec![req.baud_rate];
        }
        return CANDIDATE_BAUD_RATES.to_vec();
    }

    async fn probe_modbus(&self, req: &ProbeRequest) -> Option<Box<dyn EnergyMeter>> {
        let url = match ConnectUrl::parse(&req.connect) {
            Ok(u) => u,
            Err(e) => {
                warn!("Cannot probe {}: {e}", req.connect);
                return None;
            }
        };

        let brands: Vec<MeterBrand> = match req.brand {
            Some(MeterBrand::Dsmr) => {
                warn!("{} is configured as DSMR but uses the modbus transport", req.connect);
                return None;
            }
            Some(b) => vec![b],
            None => MODBUS_PRIORITY.to_vec(),
        };

        for baud in self.candidate_rates(req, &url).await {
            let config = ConnectionConfig::new(&req.connect, baud, self.timeout);
            let (client, cached) = match self.registry.get_or_create(&config).await {
                Ok(c) => c,
                Err(e) => {
                    info!("Cannot open {} at {baud} baud: {e}", req.connect);
                    continue;
                }
            };
            let baud = if url.is_serial() { baud } else { 0 };

            for brand in &brands {
                let link = ModbusLink::new(self.registry.clone(), client.clone(), &req.connect, req.unit_id, baud, encoding_of(*brand));
                match probe_brand(*brand, link, req.setup.clone()).await {
                    Ok(meter) => {
                        self.registry.acquire(&req.connect);
                        return Some(meter);
                    }
                    Err(e) => info!("[{}#{}] no {brand} meter at {baud} baud: {e}", req.connect, req.unit_id),
                }
            }

            /* a client other meters already use stays open */
            if !cached {
                self.registry.remove_cached(&req.connect).await;
            }
        }
        return None;
    }

    async fn probe_serial(&self, req: &ProbeRequest) -> Option<Box<dyn EnergyMeter>> {
        if req.brand.is_some_and(|b| b != MeterBrand::Dsmr) {
            warn!("{} uses the serial transport, only DSMR meters are supported there", req.connect);
            return None;
        }
        let device = match ConnectUrl::parse(&req.connect) {
            Ok(ConnectUrl::Rtu(device)) => device,
            _ => {
                warn!("Serial transport needs an rtu:// url, got {}", req.connect);
                return None;
            }
        };

        let rates = if req.baud_rate == 0 { CANDIDATE_BAUD_RATES.to_vec() } else { vec![req.baud_rate] };
        for baud in rates {
            match DsmrMeter::probe(self.ports.as_ref(), &device, baud, req.setup.clone(), self.telegram_timeout).await {
                Ok(meter) => return Some(Box::new(meter)),
                Err(e) => info!("[{device}] no DSMR telegram at {baud} baud: {e}"),
            }
        }
        return None;
    }
}

fn encoding_of(brand: MeterBrand) -> Encoding {
    match brand {
        MeterBrand::CarloGavazzi => carlo_gavazzi::ENCODING,
        MeterBrand::Abb => abb::ENCODING,
        _ => victron::ENCODING,
    }
}

async fn probe_brand(brand: MeterBrand, link: ModbusLink, setup: MeterSetup) -> Result<Box<dyn EnergyMeter>, MeterError> {
    debug!("{} probing {brand}", link.log_prefix());
    let meter: Box<dyn EnergyMeter> = match brand {
        MeterBrand::CarloGavazzi => Box::new(CarloGavazziMeter::probe(link, setup).await?),
        MeterBrand::Abb => Box::new(AbbMeter::probe(link, setup).await?),
        MeterBrand::Victron => Box::new(VictronMeter::probe(link, setup).await?),
        MeterBrand::Dsmr => return Err(MeterError::NotRecognized(MeterBrand::Dsmr)),
    };
    return Ok(meter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_modbus::testing::{FakeBus, FakeDevice, FakeFactory};
    use crate::meters::dsmr::telegram::samples::{with_crc, DSMR5_BODY};
    use crate::meters::BrandInfo;
    use crate::meters::dsmr::testing::FakePort;
    use crate::models::{EnergySourceRole, MeterAttribute};

    fn request(connect: &str, brand: Option<MeterBrand>, unit_id: u8) -> ProbeRequest {
        return ProbeRequest {
            connect: connect.to_string(),
            transport: Transport::Modbus,
            brand,
            unit_id,
            baud_rate: 0,
            setup: MeterSetup {
                role: EnergySourceRole::Grid,
                line_indices: vec![0, 1, 2],
                attributes: vec![MeterAttribute::State],
                update_interval: Duration::from_secs(1),
            },
        };
    }

    fn prober(factory: &Arc<FakeFactory>, port: FakePort) -> MeterProber {
        let registry = ConnectionRegistry::new(factory.clone());
        return MeterProber::new(registry, Arc::new(port), Duration::from_millis(20), Duration::from_millis(20));
    }

    fn em340() -> FakeDevice {
        return FakeDevice::new().with_holding(0x000B, &[341]).with_zeros(0x5000, 7);
    }

    #[tokio::test]
    async fn test_pinned_brand_sweeps_to_9600() {
        let bus = FakeBus::new();
        bus.add_device(1, em340().answering_at(9600));
        let factory = FakeFactory::new(bus);
        let prober = prober(&factory, FakePort::new(0, ""));

        let meter = prober.probe(&request("rtu:///dev/ttyUSB0", Some(MeterBrand::CarloGavazzi), 1)).await.unwrap();
        assert_eq!(meter.brand(), MeterBrand::CarloGavazzi);
        let bus_info = meter.modbus().unwrap();
        assert_eq!(bus_info.connect_url(), "rtu:///dev/ttyUSB0");
        assert_eq!(bus_info.unit_id(), 1);
        assert_eq!(bus_info.baud_rate(), 9600);

        assert_eq!(factory.opened_bauds(), vec![115200, 57600, 38400, 19200, 9600]);
        assert_eq!(factory.close_counts(), vec![1, 1, 1, 1, 0]);
        let client = prober.registry().cached("rtu:///dev/ttyUSB0").unwrap();
        assert_eq!(client.lock().await.baud_rate(), 9600);
    }

    #[tokio::test]
    async fn test_brand_priority() {
        let bus = FakeBus::new();
        /* answers both the Carlo Gavazzi and the ABB identification */
        bus.add_device(1, em340().with_holding(0x8960, &[0x4232, 0x3320, 0, 0, 0, 0]));
        bus.add_device(2, FakeDevice::new().with_holding(0x8960, &[0x4232, 0x3120, 0, 0, 0, 0]));
        let factory = FakeFactory::new(bus);
        let prober = prober(&factory, FakePort::new(0, ""));

        let first = prober.probe(&request("tcp://10.0.0.9", None, 1)).await.unwrap();
        assert_eq!(first.brand(), MeterBrand::CarloGavazzi);
        let second = prober.probe(&request("tcp://10.0.0.9", None, 2)).await.unwrap();
        assert_eq!(second.brand(), MeterBrand::Abb);
        assert_eq!(second.model(), "B21");
        assert_eq!(factory.opened_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_probe_keeps_shared_client() {
        let bus = FakeBus::new();
        bus.add_device(1, em340());
        let factory = FakeFactory::new(bus);
        let prober = prober(&factory, FakePort::new(0, ""));

        assert!(prober.probe(&request("rtu:///dev/ttyUSB0", None, 1)).await.is_some());
        assert!(prober.probe(&request("rtu:///dev/ttyUSB0", None, 9)).await.is_none());

        /* the second slot neither reopened nor swept the bus */
        assert_eq!(factory.opened_count(), 1);
        assert_eq!(factory.close_counts(), vec![0]);
        assert!(prober.registry().cached("rtu:///dev/ttyUSB0").is_some());
    }

    #[tokio::test]
    async fn test_open_bus_keeps_its_rate() {
        let bus = FakeBus::new();
        bus.add_device(1, em340());
        bus.add_device(2, em340());
        let factory = FakeFactory::new(bus);
        let prober = prober(&factory, FakePort::new(0, ""));

        let mut first = request("rtu:///dev/ttyUSB0", None, 1);
        first.baud_rate = 9600;
        assert!(prober.probe(&first).await.is_some());

        /* a different configured rate does not reopen the bus */
        let mut second = request("rtu:///dev/ttyUSB0", None, 2);
        second.baud_rate = 19200;
        assert!(prober.probe(&second).await.is_some());
        assert_eq!(factory.opened_bauds(), vec![9600]);
        assert_eq!(factory.close_counts(), vec![0]);
    }

    #[tokio::test]
    async fn test_nothing_found_closes_everything() {
        let factory = FakeFactory::new(FakeBus::new());
        let prober = prober(&factory, FakePort::new(0, ""));

        let mut req = request("rtu:///dev/ttyUSB3", Some(MeterBrand::Abb), 4);
        req.baud_rate = 19200;
        assert!(prober.probe(&req).await.is_none());
        assert_eq!(factory.close_counts(), vec![1]);
        assert!(prober.registry().is_empty());
    }

    #[tokio::test]
    async fn test_meter_shutdown_closes_bus() {
        let bus = FakeBus::new();
        bus.add_device(1, em340());
        bus.add_device(2, em340());
        let factory = FakeFactory::new(bus);
        let prober = prober(&factory, FakePort::new(0, ""));

        let mut a = prober.probe(&request("tcp://gw", None, 1)).await.unwrap();
        let mut b = prober.probe(&request("tcp://gw", None, 2)).await.unwrap();
        a.shutdown().await;
        assert_eq!(factory.close_counts(), vec![0]);
        b.shutdown().await;
        assert_eq!(factory.close_counts(), vec![1]);
    }

    #[tokio::test]
    async fn test_dsmr_serial_sweep() {
        let factory = FakeFactory::new(FakeBus::new());
        let port = FakePort::new(9600, &with_crc(DSMR5_BODY));
        let prober = prober(&factory, port);

        let mut req = request("rtu:///dev/ttyUSB1", None, 0);
        req.transport = Transport::Serial;
        let mut meter = prober.probe(&req).await.unwrap();
        assert_eq!(meter.brand(), MeterBrand::Dsmr);
        assert_eq!(factory.opened_count(), 0);
        meter.shutdown().await;

        req.brand = Some(MeterBrand::Abb);
        assert!(prober.probe(&req).await.is_none());
    }
}
