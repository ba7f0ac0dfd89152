use async_trait::async_trait;
use log::{debug, warn};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::serial::{open_port, SerialSettings};

pub mod registers;
pub mod connection;
#[cfg(test)]
pub mod testing;

pub use registers::{decode_ascii, ByteOrder, Decoder, Encoding, RegisterBlock, RegisterType, RegisterValue, Width, WordOrder};
pub use connection::{ClientFactory, ConnectionConfig, ConnectionRegistry, RmodbusFactory};

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("invalid connect url {0}")]
    InvalidUrl(String),
    #[error("client is not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
    #[error("modbus protocol error: {0}")]
    Protocol(String),
    #[error("device answered with {got} registers, expected {expected}")]
    ShortResponse { expected: usize, got: usize },
}

/// Where a bus lives, parsed from the configured connect url
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectUrl {
    /// `tcp://host[:port]`
    Tcp(String),
    /// `rtuovertcp://host[:port]`, RTU frames through a TCP gateway
    RtuOverTcp(String),
    /// `rtu://<device path>`
    Rtu(String),
}

impl ConnectUrl {
    pub fn parse(url: &str) -> Result<Self, ModbusError> {
        let with_port = |host: &str| -> String {
            if host.contains(':') { host.to_string() } else { format!("{host}:502") }
        };

        if let Some(host) = url.strip_prefix("tcp://") {
            if host.is_empty() {
                return Err(ModbusError::InvalidUrl(url.to_string()));
            }
            return Ok(ConnectUrl::Tcp(with_port(host)));
        }
        if let Some(host) = url.strip_prefix("rtuovertcp://") {
            if host.is_empty() {
                return Err(ModbusError::InvalidUrl(url.to_string()));
            }
            return Ok(ConnectUrl::RtuOverTcp(with_port(host)));
        }
        if let Some(device) = url.strip_prefix("rtu://") {
            if device.is_empty() {
                return Err(ModbusError::InvalidUrl(url.to_string()));
            }
            return Ok(ConnectUrl::Rtu(device.to_string()));
        }
        return Err(ModbusError::InvalidUrl(url.to_string()));
    }

    pub fn is_serial(&self) -> bool {
        return matches!(self, ConnectUrl::Rtu(_));
    }
}

/// The Modbus wire primitive used by all vendor modules.
///
/// `set_unit_id` changes state for every following request, so one client
/// must only be driven by one task at a time. [`SharedClient`] enforces that
/// with a mutex held across unit selection and the request.
#[async_trait]
pub trait ModbusClient: Send {
    async fn open(&mut self) -> Result<(), ModbusError>;
    async fn close(&mut self) -> Result<(), ModbusError>;
    fn set_unit_id(&mut self, unit_id: u8);
    /// 0 for network transports
    fn baud_rate(&self) -> u32;
    async fn read_registers(&mut self, address: u16, quantity: u16, kind: RegisterType) -> Result<Vec<u16>, ModbusError>;
    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError>;
    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), ModbusError>;
}

pub type SharedClient = Arc<tokio::sync::Mutex<Box<dyn ModbusClient>>>;

/// Selects the unit and reads one block while holding the bus
pub async fn read_block(client: &SharedClient, unit_id: u8, block: &RegisterBlock) -> Result<Vec<u16>, ModbusError> {
    let mut c = client.lock().await;
    c.set_unit_id(unit_id);
    let regs = c.read_registers(block.address, block.quantity, block.kind).await?;
    if regs.len() < block.quantity as usize {
        return Err(ModbusError::ShortResponse { expected: block.quantity as usize, got: regs.len() });
    }
    return Ok(regs);
}

pub async fn write_holding(client: &SharedClient, unit_id: u8, address: u16, value: u16) -> Result<(), ModbusError> {
    let mut c = client.lock().await;
    c.set_unit_id(unit_id);
    return c.write_register(address, value).await;
}

trait ModbusStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ModbusStream for T {}

/// Modbus client building and parsing frames with rmodbus
pub struct RmodbusClient {
    url: ConnectUrl,
    baud_rate: u32,
    timeout: Duration,
    unit_id: u8,
    opened: bool,
    stream: Option<Box<dyn ModbusStream>>,
}

impl RmodbusClient {
    pub fn new(url: ConnectUrl, baud_rate: u32, timeout: Duration) -> Self {
        return RmodbusClient {
            url,
            baud_rate,
            timeout,
            unit_id: 1,
            opened: false,
            stream: None,
        };
    }

    fn proto(&self) -> ModbusProto {
        match self.url {
            ConnectUrl::Tcp(_) => ModbusProto::TcpUdp,
            ConnectUrl::RtuOverTcp(_) | ConnectUrl::Rtu(_) => ModbusProto::Rtu,
        }
    }

    async fn connect(&mut self) -> Result<(), ModbusError> {
        let stream: Box<dyn ModbusStream> = match &self.url {
            ConnectUrl::Tcp(addr) | ConnectUrl::RtuOverTcp(addr) => {
                let s = tokio::time::timeout(self.timeout, TcpStream::connect(addr.as_str())).await
                    .map_err(|_| ModbusError::Timeout)??;
                let _ = s.set_nodelay(true);
                Box::new(s)
            },
            ConnectUrl::Rtu(device) => {
                let settings = SerialSettings::new(device, self.baud_rate, self.timeout);
                Box::new(open_port(&settings)?)
            },
        };
        self.stream = Some(stream);
        return Ok(());
    }

    /// Sends one request frame and returns the complete response frame
    async fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>, ModbusError> {
        if !self.opened {
            return Err(ModbusError::NotConnected);
        }
        /* reconnect lazily after a broken exchange */
        if self.stream.is_none() {
            self.connect().await?;
        }

        let proto = self.proto();
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(ModbusError::NotConnected)?;

        let exchange = async {
            stream.write_all(request).await?;

            /* RTU frames tell their length after 3 bytes, TCP ones in the 6 byte header */
            let head_len = if matches!(proto, ModbusProto::Rtu) { 3 } else { 6 };
            let mut response = vec![0u8; head_len];
            stream.read_exact(&mut response).await?;

            let len = guess_response_frame_len(&response, proto)
                .map_err(|e| ModbusError::Protocol(format!("{e:?}")))? as usize;
            if len > head_len {
                let mut rest = vec![0u8; len - head_len];
                stream.read_exact(&mut rest).await?;
                response.extend_from_slice(&rest);
            }
            Ok::<Vec<u8>, ModbusError>(response)
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(r) => r,
            Err(_) => Err(ModbusError::Timeout),
        };

        if let Err(e) = &result {
            if matches!(e, ModbusError::Io(_) | ModbusError::Timeout) {
                debug!("Dropping stream of {:?} after {e}", self.url);
                self.stream = None;
            }
        }
        return result;
    }
}

fn protocol_error(e: rmodbus::ErrorKind) -> ModbusError {
    return ModbusError::Protocol(format!("{e:?}"));
}

#[async_trait]
impl ModbusClient for RmodbusClient {
    async fn open(&mut self) -> Result<(), ModbusError> {
        self.connect().await?;
        self.opened = true;
        return Ok(());
    }

    async fn close(&mut self) -> Result<(), ModbusError> {
        self.opened = false;
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                warn!("Closing {:?} failed: {e}", self.url);
            }
        }
        return Ok(());
    }

    fn set_unit_id(&mut self, unit_id: u8) {
        self.unit_id = unit_id;
    }

    fn baud_rate(&self) -> u32 {
        if self.url.is_serial() {
            return self.baud_rate;
        }
        return 0;
    }

    async fn read_registers(&mut self, address: u16, quantity: u16, kind: RegisterType) -> Result<Vec<u16>, ModbusError> {
        let mut mreq = ModbusRequest::new(self.unit_id, self.proto());
        let mut request = Vec::new();
        match kind {
            RegisterType::Holding => mreq.generate_get_holdings(address, quantity, &mut request),
            RegisterType::Input => mreq.generate_get_inputs(address, quantity, &mut request),
        }.map_err(protocol_error)?;

        let response = self.transact(&request).await?;
        let mut data: Vec<u16> = Vec::new();
        mreq.parse_u16(&response, &mut data).map_err(protocol_error)?;
        return Ok(data);
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError> {
        let mut mreq = ModbusRequest::new(self.unit_id, self.proto());
        let mut request = Vec::new();
        mreq.generate_set_holding(address, value, &mut request).map_err(protocol_error)?;

        let response = self.transact(&request).await?;
        mreq.parse_ok(&response).map_err(protocol_error)?;
        return Ok(());
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), ModbusError> {
        let mut mreq = ModbusRequest::new(self.unit_id, self.proto());
        let mut request = Vec::new();
        mreq.generate_set_holdings_bulk(address, values, &mut request).map_err(protocol_error)?;

        let response = self.transact(&request).await?;
        mreq.parse_ok(&response).map_err(protocol_error)?;
        return Ok(());
    }
}
