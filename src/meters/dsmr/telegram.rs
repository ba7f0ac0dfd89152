use crc16::{State, ARC};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TelegramError {
    #[error("telegram has no header line")]
    MissingHeader,
    #[error("telegram has no trailer line")]
    MissingTrailer,
    #[error("invalid checksum field {0}")]
    InvalidChecksum(String),
    #[error("checksum mismatch, telegram says {expected:04X}, computed {computed:04X}")]
    ChecksumMismatch { expected: u16, computed: u16 },
}

lazy_static! {
    static ref OBIS_LINE: Regex = Regex::new(r"^(\d+-\d+:\d+\.\d+\.\d+)((?:\([^)]*\))+)\s*$").unwrap();
    static ref OBIS_VALUE: Regex = Regex::new(r"\(([^)]*)\)").unwrap();
    static ref MBUS_CHANNEL: Regex = Regex::new(r"^0-(\d+):24\.1\.0$").unwrap();
}

pub const CONSUMED_TARIFF_1: &str = "1-0:1.8.1";
pub const CONSUMED_TARIFF_2: &str = "1-0:1.8.2";
pub const PROVIDED_TARIFF_1: &str = "1-0:2.8.1";
pub const PROVIDED_TARIFF_2: &str = "1-0:2.8.2";
pub const EQUIPMENT_ID: &str = "0-0:96.1.1";

/// Power delivered to the client per line, kW
pub const POWER_DELIVERED: [&str; 3] = ["1-0:21.7.0", "1-0:41.7.0", "1-0:61.7.0"];
/// Power received from the client per line, kW
pub const POWER_RECEIVED: [&str; 3] = ["1-0:22.7.0", "1-0:42.7.0", "1-0:62.7.0"];
pub const VOLTAGE: [&str; 3] = ["1-0:32.7.0", "1-0:52.7.0", "1-0:72.7.0"];
pub const CURRENT: [&str; 3] = ["1-0:31.7.0", "1-0:51.7.0", "1-0:71.7.0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbusKind {
    Gas,
    Water,
    Other(u8),
}

impl MbusKind {
    pub fn from_device_type(t: u8) -> Self {
        match t {
            3 => MbusKind::Gas,
            7 => MbusKind::Water,
            other => MbusKind::Other(other),
        }
    }
}

/// A device attached to the meter's M-Bus, reading in m³
#[derive(Debug, Clone, PartialEq)]
pub struct MbusDevice {
    pub channel: u8,
    pub kind: MbusKind,
    pub reading: Option<f64>,
}

/// One P1 telegram: `/XXX5<model>`, a blank line, OBIS lines and `!<crc>`
#[derive(Debug, Clone, PartialEq)]
pub struct Telegram {
    pub header: String,
    pub objects: HashMap<String, Vec<String>>,
}

impl Telegram {
    pub fn parse(text: &str) -> Result<Self, TelegramError> {
        let start = text.find('/').ok_or(TelegramError::MissingHeader)?;
        let end = text[start..].find('!').map(|i| start + i).ok_or(TelegramError::MissingTrailer)?;

        let trailer = text[end + 1..].lines().next().unwrap_or("").trim();
        /* DSMR 2 and 3 telegrams carry no checksum */
        if !trailer.is_empty() {
            let expected = u16::from_str_radix(trailer, 16)
                .map_err(|_| TelegramError::InvalidChecksum(trailer.to_string()))?;
            let computed = State::<ARC>::calculate(text[start..=end].as_bytes());
            if expected != computed {
                return Err(TelegramError::ChecksumMismatch { expected, computed });
            }
        }

        let mut lines = text[start..end].lines();
        let header = lines.next().unwrap_or("").trim().to_string();
        let mut objects = HashMap::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match OBIS_LINE.captures(line) {
                Some(caps) => {
                    let values = OBIS_VALUE.captures_iter(&caps[2]).map(|v| v[1].to_string()).collect();
                    objects.insert(caps[1].to_string(), values);
                }
                None => debug!("Skipping telegram line {line}"),
            }
        }

        return Ok(Telegram { header, objects });
    }

    /// Three letter manufacturer code from the header
    pub fn manufacturer(&self) -> &str {
        return self.header.get(1..4).unwrap_or("");
    }

    /// Model identification following the baud rate digit of the header
    pub fn model(&self) -> String {
        let ident = self.header.get(5..).unwrap_or("");
        /* DSMR 4 and later put a mark like \2 in front of the model */
        let ident = match ident.strip_prefix('\\') {
            Some(rest) => rest.get(1..).unwrap_or(""),
            None => ident,
        };
        return ident.trim().to_string();
    }

    pub fn values(&self, obis: &str) -> Option<&[String]> {
        return self.objects.get(obis).map(|v| v.as_slice());
    }

    /// Numeric value of an object, the last one when it carries several
    pub fn number(&self, obis: &str) -> Option<f64> {
        let raw = self.values(obis)?.last()?;
        return parse_number(raw).map(|(v, _)| v);
    }

    /// Sum of the objects that are present, None when none is
    pub fn sum(&self, codes: &[&str]) -> Option<f64> {
        let found: Vec<f64> = codes.iter().filter_map(|c| self.number(c)).collect();
        if found.is_empty() {
            return None;
        }
        return Some(found.iter().sum());
    }

    /// Equipment identifier, sent hex encoded
    pub fn equipment_id(&self) -> Option<String> {
        let raw = self.values(EQUIPMENT_ID)?.first()?;
        match hex::decode(raw) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).to_string()),
            Err(_) => Some(raw.clone()),
        }
    }

    pub fn mbus_devices(&self) -> Vec<MbusDevice> {
        let mut devices = Vec::new();
        for (code, values) in &self.objects {
            let channel = match MBUS_CHANNEL.captures(code).and_then(|c| c[1].parse::<u8>().ok()) {
                Some(c) => c,
                None => continue,
            };
            let device_type = values.first().and_then(|v| v.parse::<u8>().ok()).unwrap_or(0);
            devices.push(MbusDevice {
                channel,
                kind: MbusKind::from_device_type(device_type),
                reading: self.number(&format!("0-{channel}:24.2.1")),
            });
        }
        devices.sort_by_key(|d| d.channel);
        return devices;
    }
}

/// Splits `000123.456*kWh` into value and unit
pub fn parse_number(raw: &str) -> Option<(f64, Option<String>)> {
    let mut parts = raw.splitn(2, '*');
    let value = parts.next()?.trim().parse::<f64>().ok()?;
    let unit = parts.next().map(|u| u.to_string());
    return Some((value, unit));
}
