//! Scripted in-memory Modbus bus for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{ClientFactory, ConnectionConfig, ModbusClient, ModbusError, RegisterType};

#[derive(Default, Clone)]
pub struct FakeDevice {
    pub holding: HashMap<u16, u16>,
    pub input: HashMap<u16, u16>,
    /// device only answers on this baud rate
    pub only_baud: Option<u32>,
    pub read_only: Vec<u16>,
}

impl FakeDevice {
    pub fn new() -> Self {
        return FakeDevice::default();
    }

    pub fn with_holding(mut self, address: u16, values: &[u16]) -> Self {
        for (i, v) in values.iter().enumerate() {
            self.holding.insert(address + i as u16, *v);
        }
        return self;
    }

    pub fn with_input(mut self, address: u16, values: &[u16]) -> Self {
        for (i, v) in values.iter().enumerate() {
            self.input.insert(address + i as u16, *v);
        }
        return self;
    }

    /// Fills `count` holding registers with zero
    pub fn with_zeros(self, address: u16, count: u16) -> Self {
        return self.with_holding(address, &vec![0; count as usize]);
    }

    pub fn answering_at(mut self, baud: u32) -> Self {
        self.only_baud = Some(baud);
        return self;
    }

    pub fn read_only(mut self, address: u16) -> Self {
        self.read_only.push(address);
        return self;
    }
}

pub struct FakeBus {
    devices: Mutex<HashMap<u8, FakeDevice>>,
    writes: Mutex<Vec<(u8, u16, u16)>>,
    failing: AtomicBool,
    reads: AtomicUsize,
}

impl FakeBus {
    pub fn new() -> Arc<Self> {
        return Arc::new(FakeBus {
            devices: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        });
    }

    pub fn add_device(&self, unit: u8, device: FakeDevice) {
        self.devices.lock().unwrap().insert(unit, device);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<(u8, u16, u16)> {
        return self.writes.lock().unwrap().clone();
    }

    pub fn read_count(&self) -> usize {
        return self.reads.load(Ordering::SeqCst);
    }
}

pub struct FakeClient {
    bus: Arc<FakeBus>,
    unit: u8,
    baud: u32,
    open: bool,
    closes: Arc<AtomicUsize>,
}

impl FakeClient {
    fn check(&self) -> Result<(), ModbusError> {
        if !self.open {
            return Err(ModbusError::NotConnected);
        }
        if self.bus.failing.load(Ordering::SeqCst) {
            return Err(ModbusError::Timeout);
        }
        let devices = self.bus.devices.lock().unwrap();
        match devices.get(&self.unit) {
            None => return Err(ModbusError::Timeout),
            Some(d) => {
                if let Some(b) = d.only_baud {
                    if b != self.baud {
                        return Err(ModbusError::Timeout);
                    }
                }
            }
        }
        return Ok(());
    }
}

#[async_trait]
impl ModbusClient for FakeClient {
    async fn open(&mut self) -> Result<(), ModbusError> {
        self.open = true;
        return Ok(());
    }

    async fn close(&mut self) -> Result<(), ModbusError> {
        self.open = false;
        self.closes.fetch_add(1, Ordering::SeqCst);
        return Ok(());
    }

    fn set_unit_id(&mut self, unit_id: u8) {
        self.unit = unit_id;
    }

    fn baud_rate(&self) -> u32 {
        return self.baud;
    }

    async fn read_registers(&mut self, address: u16, quantity: u16, kind: RegisterType) -> Result<Vec<u16>, ModbusError> {
        self.check()?;
        self.bus.reads.fetch_add(1, Ordering::SeqCst);
        let devices = self.bus.devices.lock().unwrap();
        let dev = devices.get(&self.unit).ok_or(ModbusError::Timeout)?;
        let map = match kind {
            RegisterType::Holding => &dev.holding,
            RegisterType::Input => &dev.input,
        };
        let mut out = Vec::new();
        for a in address..address + quantity {
            match map.get(&a) {
                Some(v) => out.push(*v),
                None => return Err(ModbusError::Protocol("IllegalDataAddress".to_string())),
            }
        }
        return Ok(out);
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), ModbusError> {
        return self.write_registers(address, &[value]).await;
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), ModbusError> {
        self.check()?;
        let mut devices = self.bus.devices.lock().unwrap();
        let dev = devices.get_mut(&self.unit).ok_or(ModbusError::Timeout)?;
        for (i, v) in values.iter().enumerate() {
            let a = address + i as u16;
            if dev.read_only.contains(&a) {
                return Err(ModbusError::Protocol("IllegalDataAddress".to_string()));
            }
            dev.holding.insert(a, *v);
            self.bus.writes.lock().unwrap().push((self.unit, a, *v));
        }
        return Ok(());
    }
}

/// Hands out [`FakeClient`]s on one [`FakeBus`] and remembers every client it opened
pub struct FakeFactory {
    pub bus: Arc<FakeBus>,
    opened: Mutex<Vec<(u32, Arc<AtomicUsize>)>>,
}

impl FakeFactory {
    pub fn new(bus: Arc<FakeBus>) -> Arc<Self> {
        return Arc::new(FakeFactory { bus, opened: Mutex::new(Vec::new()) });
    }

    pub fn opened_count(&self) -> usize {
        return self.opened.lock().unwrap().len();
    }

    pub fn opened_bauds(&self) -> Vec<u32> {
        return self.opened.lock().unwrap().iter().map(|(b, _)| *b).collect();
    }

    /// How often each opened client was closed, in opening order
    pub fn close_counts(&self) -> Vec<usize> {
        return self.opened.lock().unwrap().iter().map(|(_, c)| c.load(Ordering::SeqCst)).collect();
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn ModbusClient>, ModbusError> {
        let closes = Arc::new(AtomicUsize::new(0));
        self.opened.lock().unwrap().push((config.baud_rate, closes.clone()));
        return Ok(Box::new(FakeClient {
            bus: self.bus.clone(),
            unit: 1,
            baud: config.baud_rate,
            open: true,
            closes,
        }));
    }
}
