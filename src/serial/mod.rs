use log::debug;
use std::time::Duration;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// Baud rates tried in this order when a serial bus has no configured rate
pub const CANDIDATE_BAUD_RATES: [u32; 5] = [115200, 57600, 38400, 19200, 9600];

#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub timeout: Duration,
}

impl SerialSettings {
    /// 8N1, the framing used by Modbus RTU meters
    pub fn new(port_name: &str, baud_rate: u32, timeout: Duration) -> Self {
        return SerialSettings {
            port_name: port_name.to_string(),
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            timeout,
        };
    }

    /// DSMR 2.x and 3.x ports talk 9600 baud 7E1, later versions 115200 baud 8N1
    pub fn dsmr(port_name: &str, baud_rate: u32, timeout: Duration) -> Self {
        let mut s = SerialSettings::new(port_name, baud_rate, timeout);
        if baud_rate == 9600 {
            s.data_bits = DataBits::Seven;
            s.parity = Parity::Even;
        }
        return s;
    }
}

pub fn open_port(settings: &SerialSettings) -> Result<SerialStream, tokio_serial::Error> {
    debug!("Opening serial port {} at {} baud", settings.port_name, settings.baud_rate);
    let port = tokio_serial::new(&settings.port_name, settings.baud_rate)
        .data_bits(settings.data_bits)
        .stop_bits(settings.stop_bits)
        .parity(settings.parity)
        .flow_control(FlowControl::None)
        .timeout(settings.timeout)
        .open_native_async()?;
    return Ok(port);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dsmr_framing() {
        let old = SerialSettings::dsmr("/dev/ttyUSB1", 9600, Duration::from_secs(1));
        assert_eq!(old.data_bits, DataBits::Seven);
        assert_eq!(old.parity, Parity::Even);

        let new = SerialSettings::dsmr("/dev/ttyUSB1", 115200, Duration::from_secs(1));
        assert_eq!(new.data_bits, DataBits::Eight);
        assert_eq!(new.parity, Parity::None);
    }

    #[test]
    fn test_candidate_order() {
        assert_eq!(CANDIDATE_BAUD_RATES.first(), Some(&115200));
        assert_eq!(CANDIDATE_BAUD_RATES.last(), Some(&9600));
    }
}
