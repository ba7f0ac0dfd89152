//! Meters with scripted readings for aggregator tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::models::{LineIndex, MeterAttribute, MeterBrand};
use super::{AttributeFilter, BrandInfo, EnergyMeter, MeterReadings};

#[derive(Default)]
pub struct Counters {
    pub updates: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl Counters {
    pub fn updates(&self) -> usize {
        return self.updates.load(Ordering::SeqCst);
    }

    pub fn shutdowns(&self) -> usize {
        return self.shutdowns.load(Ordering::SeqCst);
    }
}

/// Writes whatever the test put into `script` on every update
pub struct ScriptedMeter {
    pub interval: Duration,
    pub lines: Vec<LineIndex>,
    pub attributes: Vec<MeterAttribute>,
    pub script: Arc<Mutex<MeterReadings>>,
    pub changed: bool,
    pub counters: Arc<Counters>,
}

impl ScriptedMeter {
    pub fn new(interval_ms: u64) -> Self {
        return ScriptedMeter {
            interval: Duration::from_millis(interval_ms),
            lines: vec![0, 1, 2],
            attributes: vec![MeterAttribute::State, MeterAttribute::Usage],
            script: Arc::new(Mutex::new(MeterReadings::default())),
            changed: true,
            counters: Arc::new(Counters::default()),
        };
    }
}

impl BrandInfo for ScriptedMeter {
    fn brand(&self) -> MeterBrand {
        return MeterBrand::Abb;
    }

    fn model(&self) -> String {
        return "scripted".to_string();
    }

    fn serial(&self) -> String {
        return "0001".to_string();
    }
}

impl AttributeFilter for ScriptedMeter {
    fn attributes(&self) -> &[MeterAttribute] {
        return &self.attributes;
    }
}

#[async_trait]
impl EnergyMeter for ScriptedMeter {
    fn update_interval(&self) -> Duration {
        return self.interval;
    }

    fn line_indices(&self) -> &[LineIndex] {
        return &self.lines;
    }

    async fn update_values(&mut self, readings: &mut MeterReadings) -> bool {
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        let script = *self.script.lock().unwrap();
        for line in &self.lines {
            if self.has_state_attribute() {
                readings.state.set_voltage(*line, script.state.voltage(*line)).unwrap();
                readings.state.set_current(*line, script.state.current(*line)).unwrap();
                readings.state.set_power(*line, script.state.power(*line)).unwrap();
            }
            if self.has_usage_attribute() {
                readings.usage.set_energy_consumed(*line, script.usage.energy_consumed(*line)).unwrap();
                readings.usage.set_energy_provided(*line, script.usage.energy_provided(*line)).unwrap();
            }
        }
        if !script.battery.is_zero() {
            readings.battery = script.battery;
        }
        if !script.gas.is_zero() {
            readings.gas = script.gas;
        }
        return self.changed;
    }

    async fn shutdown(&mut self) {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
