/*
    DSMR smart meters, read through their P1 port

    The meter pushes a telegram every second (DSMR 5) or every ten seconds
    (older versions). A background task keeps reading and stores the latest
    telegram, polling only decodes whatever arrived last.
*/

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::{ElectricityState, ElectricityUsage, GasUsage, LineIndex, MeterAttribute, MeterBrand, WaterUsage, MAX_PHASES};
use crate::serial::{open_port, SerialSettings};
use super::{split_evenly, AttributeFilter, BrandInfo, EnergyMeter, MeterError, MeterReadings, MeterSetup, ValueCache};

pub mod telegram;

pub use telegram::{MbusDevice, MbusKind, Telegram, TelegramError};
use telegram::{CONSUMED_TARIFF_1, CONSUMED_TARIFF_2, CURRENT, POWER_DELIVERED, POWER_RECEIVED, PROVIDED_TARIFF_1, PROVIDED_TARIFF_2, VOLTAGE};

/// Telegrams are at most ten seconds apart
pub const DEFAULT_TELEGRAM_TIMEOUT: Duration = Duration::from_secs(11);

/// Longest telegram accepted before the stream is considered garbage
const MAX_TELEGRAM_LEN: usize = 8192;
/// Longest single line, OBIS lines are well below
const MAX_LINE_LEN: usize = 1024;
/// Pause after a failed read before trying again
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

pub type TelegramReader = Box<dyn AsyncBufRead + Unpin + Send>;

/// Opens the byte stream a DSMR meter writes its telegrams to
#[async_trait]
pub trait TelegramPortOpener: Send + Sync {
    async fn open(&self, device: &str, baud_rate: u32) -> Result<TelegramReader, MeterError>;
}

pub struct SerialPortOpener {
    pub timeout: Duration,
}

#[async_trait]
impl TelegramPortOpener for SerialPortOpener {
    async fn open(&self, device: &str, baud_rate: u32) -> Result<TelegramReader, MeterError> {
        let settings = SerialSettings::dsmr(device, baud_rate, self.timeout);
        let port = open_port(&settings).map_err(|e| MeterError::Io(e.into()))?;
        return Ok(Box::new(BufReader::new(port)));
    }
}

/// Reads lines until one complete telegram was received.
///
/// Line noise (bytes that are not UTF-8, overlong lines) drops the telegram
/// being collected and reading resyncs on the next header. Only I/O errors and
/// the end of the stream are returned.
pub async fn read_telegram(reader: &mut TelegramReader) -> Result<Telegram, MeterError> {
    let mut text = String::new();
    let mut raw: Vec<u8> = Vec::new();
    loop {
        raw.clear();
        let n = (&mut *reader).take(MAX_LINE_LEN as u64).read_until(b'\n', &mut raw).await?;
        if n == 0 {
            return Err(MeterError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        if raw.last() != Some(&b'\n') && n as u64 == MAX_LINE_LEN as u64 {
            debug!("Dropping line longer than {MAX_LINE_LEN} bytes");
            text.clear();
            continue;
        }
        let line = match std::str::from_utf8(&raw) {
            Ok(l) => l,
            Err(_) => {
                debug!("Dropping {n} bytes of line noise");
                text.clear();
                continue;
            }
        };

        if line.starts_with('/') {
            text.clear();
        }
        if text.is_empty() && !line.starts_with('/') {
            /* in the middle of a telegram, wait for the next header */
            continue;
        }
        text.push_str(line);

        if line.starts_with('!') {
            return Ok(Telegram::parse(&text)?);
        }
        if text.len() > MAX_TELEGRAM_LEN {
            debug!("Dropping {} bytes without trailer", text.len());
            text.clear();
        }
    }
}

/// Everything a telegram contributes to one tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelegramValues {
    pub state: ElectricityState,
    pub usage: ElectricityUsage,
    pub gas: GasUsage,
    pub water: WaterUsage,
}

impl TelegramValues {
    /// Decodes the lines a meter is configured for
    pub fn decode(telegram: &Telegram, lines: &[LineIndex]) -> Self {
        let mut values = TelegramValues::default();

        for line in lines.iter().copied().filter(|l| *l < MAX_PHASES) {
            let delivered = telegram.number(POWER_DELIVERED[line]).unwrap_or(0.0);
            let received = telegram.number(POWER_RECEIVED[line]).unwrap_or(0.0);
            values.state.set_power(line, ((delivered - received) * 1000.0) as f32).ok();
            values.state.set_voltage(line, telegram.number(VOLTAGE[line]).unwrap_or(0.0) as f32).ok();
            values.state.set_current(line, telegram.number(CURRENT[line]).unwrap_or(0.0) as f32).ok();
        }

        /* DSMR only reports totals, spread them over the configured lines */
        let consumed = telegram.sum(&[CONSUMED_TARIFF_1, CONSUMED_TARIFF_2]).unwrap_or(0.0);
        let provided = telegram.sum(&[PROVIDED_TARIFF_1, PROVIDED_TARIFF_2]).unwrap_or(0.0);
        for line in lines.iter().copied().filter(|l| *l < MAX_PHASES) {
            values.usage.set_energy_consumed(line, split_evenly(consumed, lines)).ok();
            values.usage.set_energy_provided(line, split_evenly(provided, lines)).ok();
        }
        values.usage.set_total_energy_consumed(consumed);
        values.usage.set_total_energy_provided(provided);

        for device in telegram.mbus_devices() {
            match (device.kind, device.reading) {
                (MbusKind::Gas, Some(r)) => values.gas = GasUsage::new(r),
                (MbusKind::Water, Some(r)) => values.water = WaterUsage::new(r),
                _ => {}
            }
        }
        return values;
    }
}

#[derive(Default)]
struct Latest {
    sequence: u64,
    telegram: Option<Telegram>,
}

pub struct DsmrMeter {
    device: String,
    baud_rate: u32,
    setup: MeterSetup,
    model: String,
    serial: String,
    latest: Arc<Mutex<Latest>>,
    last_sequence: u64,
    gas: GasUsage,
    water: WaterUsage,
    cache: ValueCache,
    cancel: CancellationToken,
    reader_task: Option<JoinHandle<()>>,
}

impl DsmrMeter {
    /// Waits for one valid telegram, then keeps reading in the background
    pub async fn probe(opener: &dyn TelegramPortOpener, device: &str, baud_rate: u32, setup: MeterSetup, timeout: Duration) -> Result<Self, MeterError> {
        let prefix = format!("[{device}@{baud_rate}]");
        let mut reader = opener.open(device, baud_rate).await?;

        let first = match tokio::time::timeout(timeout, read_telegram(&mut reader)).await {
            Ok(r) => r?,
            Err(_) => {
                info!("{prefix} no DSMR telegram within {timeout:?}");
                return Err(MeterError::NoTelegram(timeout));
            }
        };

        let model = first.model();
        let serial = first.equipment_id().unwrap_or_default();
        info!("{prefix} detected DSMR meter {} {model} serial {serial}", first.manufacturer());

        let latest = Arc::new(Mutex::new(Latest { sequence: 1, telegram: Some(first) }));
        let cancel = CancellationToken::new();
        let reader_task = tokio::spawn(read_loop(reader, latest.clone(), cancel.clone(), prefix));

        return Ok(DsmrMeter {
            device: device.to_string(),
            baud_rate,
            setup,
            model,
            serial,
            latest,
            last_sequence: 0,
            gas: GasUsage::default(),
            water: WaterUsage::default(),
            cache: ValueCache::default(),
            cancel,
            reader_task: Some(reader_task),
        });
    }

    pub fn device(&self) -> &str {
        return &self.device;
    }

    pub fn baud_rate(&self) -> u32 {
        return self.baud_rate;
    }
}

async fn read_loop(mut reader: TelegramReader, latest: Arc<Mutex<Latest>>, cancel: CancellationToken, prefix: String) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = read_telegram(&mut reader) => r,
        };

        match result {
            Ok(telegram) => {
                let mut l = latest.lock().unwrap_or_else(|e| e.into_inner());
                l.sequence += 1;
                l.telegram = Some(telegram);
            }
            Err(MeterError::Telegram(e)) => warn!("{prefix} dropping telegram: {e}"),
            Err(MeterError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                error!("{prefix} telegram stream ended");
                break;
            }
            Err(e) => {
                warn!("{prefix} reading telegram failed, retrying: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                }
            }
        }
    }
    debug!("{prefix} telegram reader stopped");
}

impl BrandInfo for DsmrMeter {
    fn brand(&self) -> MeterBrand {
        return MeterBrand::Dsmr;
    }

    fn model(&self) -> String {
        return self.model.clone();
    }

    fn serial(&self) -> String {
        return self.serial.clone();
    }
}

impl AttributeFilter for DsmrMeter {
    fn attributes(&self) -> &[MeterAttribute] {
        return &self.setup.attributes;
    }
}

#[async_trait]
impl EnergyMeter for DsmrMeter {
    fn update_interval(&self) -> Duration {
        return self.setup.update_interval;
    }

    fn line_indices(&self) -> &[LineIndex] {
        return &self.setup.line_indices;
    }

    async fn update_values(&mut self, readings: &mut MeterReadings) -> bool {
        let fresh = {
            let l = self.latest.lock().unwrap_or_else(|e| e.into_inner());
            if l.sequence != self.last_sequence {
                self.last_sequence = l.sequence;
                l.telegram.as_ref().map(|t| TelegramValues::decode(t, &self.setup.line_indices))
            } else {
                None
            }
        };

        let mut changed = false;
        if let Some(values) = fresh {
            changed = self.cache.store_state(values.state);
            self.cache.usage = values.usage;
            self.gas = values.gas;
            self.water = values.water;
        }

        /* lines map one to one, DSMR reports per line */
        self.cache.fill(readings, &self.setup, false);
        if self.has_usage_attribute() {
            if !self.gas.is_zero() {
                readings.gas = self.gas;
            }
            if !self.water.is_zero() {
                readings.water = self.water;
            }
        }
        return changed;
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.reader_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DsmrMeter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}


#[cfg(test)]
mod tests {
    use super::telegram::samples::{with_crc, DSMR5_BODY};
    use super::testing::FakePort;
    use super::*;
    use crate::models::EnergySourceRole;

    fn setup(lines: Vec<LineIndex>) -> MeterSetup {
        return MeterSetup {
            role: EnergySourceRole::Grid,
            line_indices: lines,
            attributes: vec![MeterAttribute::State, MeterAttribute::Usage],
            update_interval: Duration::from_secs(1),
        };
    }

    #[test]
    fn test_decode_values() {
        let t = Telegram::parse(&with_crc(DSMR5_BODY)).unwrap();
        let v = TelegramValues::decode(&t, &[0, 1, 2]);
        assert_eq!(v.state.power(0), 1111.0);
        assert_eq!(v.state.power(1), -500.0);
        assert_eq!(v.state.voltage(2), 231.0);
        assert_eq!(v.state.current(0), 5.0);
        assert_eq!(v.usage.total_energy_consumed(), 246913.578);
        assert_eq!(v.usage.energy_provided(0), 100.25);
        assert_eq!(v.gas.consumed, 12785.123);
        assert_eq!(v.water.consumed, 42.001);
    }

    #[tokio::test]
    async fn test_probe_and_poll() {
        let stream = format!("garbage line\r\n{}{}", with_crc(DSMR5_BODY), with_crc(&DSMR5_BODY.replace("230.1*V", "233.3*V")));
        let port = FakePort::new(115200, &stream);

        let mut meter = DsmrMeter::probe(&port, "/dev/ttyUSB1", 115200, setup(vec![0, 1, 2]), Duration::from_secs(1)).await.unwrap();
        assert_eq!(meter.model(), "MT382-1000");
        assert_eq!(meter.serial(), "K8EG004046395507");

        /* let the background reader pick up the second telegram */
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut readings = MeterReadings::default();
        assert!(meter.update_values(&mut readings).await);
        assert_eq!(readings.state.voltage(0), 233.3);
        assert_eq!(readings.gas.consumed, 12785.123);

        /* nothing new arrived */
        let mut again = MeterReadings::default();
        assert!(!meter.update_values(&mut again).await);
        assert_eq!(again.state, readings.state);

        meter.shutdown().await;
    }

    #[tokio::test]
    async fn test_reader_survives_line_noise() {
        let mut stream = with_crc(DSMR5_BODY).into_bytes();
        stream.extend_from_slice(b"\xff\xfe noise\r\n");
        stream.extend_from_slice(with_crc(&DSMR5_BODY.replace("230.1*V", "233.3*V")).as_bytes());
        let port = FakePort::with_bytes(115200, stream);

        let mut meter = DsmrMeter::probe(&port, "/dev/ttyUSB1", 115200, setup(vec![0, 1, 2]), Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut readings = MeterReadings::default();
        meter.update_values(&mut readings).await;
        assert_eq!(readings.state.voltage(0), 233.3);
        meter.shutdown().await;
    }

    #[tokio::test]
    async fn test_noise_inside_telegram_resyncs() {
        /* a broken byte in the middle spoils that telegram only */
        let mut stream = b"/ISk5\\2MT382-1000\r\n\r\n1-0:32.7.0(2\xff0.0*V)\r\n".to_vec();
        stream.extend(std::iter::repeat(b'x').take(5000));
        stream.extend_from_slice(b"\r\n");
        stream.extend_from_slice(with_crc(DSMR5_BODY).as_bytes());
        let mut reader: TelegramReader = Box::new(BufReader::new(std::io::Cursor::new(stream)));

        let telegram = read_telegram(&mut reader).await.unwrap();
        assert_eq!(telegram.number(VOLTAGE[0]), Some(230.1));
        assert!(matches!(read_telegram(&mut reader).await, Err(MeterError::Io(_))));
    }

    #[tokio::test]
    async fn test_silent_port_times_out() {
        let port = FakePort::new(9600, "");
        let r = DsmrMeter::probe(&port, "/dev/ttyUSB1", 115200, setup(vec![0]), Duration::from_millis(50)).await;
        assert!(matches!(r, Err(MeterError::NoTelegram(_))));
    }
}
