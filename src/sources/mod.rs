use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::events::{ElectricityValues, EventBuses, MeterValues};
use crate::meters::{AttributeFilter, BrandInfo, EnergyMeter, MeterReadings};
use crate::models::{EnergySourceRole, LineIndex, MeterAttribute, MeterBrand};

/// Used when a source has no meters at all
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// When a tick hands its readings to the event buses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
pub enum PublishPolicy {
    /// every tick with non-zero readings
    #[default]
    Always,
    /// only ticks where some meter reported a changed instant value
    OnChange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterInfo {
    pub brand: MeterBrand,
    pub model: String,
    pub serial: String,
    pub line_indices: Vec<LineIndex>,
    pub attributes: Vec<MeterAttribute>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
}

impl MeterInfo {
    fn of(meter: &dyn EnergyMeter) -> Self {
        return MeterInfo {
            brand: meter.brand(),
            model: meter.model(),
            serial: meter.serial(),
            line_indices: meter.line_indices().to_vec(),
            attributes: meter.attributes().to_vec(),
            connect_url: meter.modbus().map(|m| m.connect_url().to_string()),
            unit_id: meter.modbus().map(|m| m.unit_id()),
            baud_rate: meter.modbus().map(|m| m.baud_rate()).filter(|b| *b != 0),
        };
    }
}

/// Latest merged measurement of a source, replaced as a whole every tick
#[derive(Debug, Clone, Default)]
pub struct SourceSnapshot {
    pub readings: MeterReadings,
    pub meters: Vec<MeterInfo>,
    pub tick: u64,
    pub updated: Option<DateTime<Utc>>,
}

/// One physical source (grid connection, pv system, battery) made of one or more meters.
///
/// The meters are polled together, the slowest meter sets the pace. Every
/// tick the readings of all meters are merged into a fresh [`MeterReadings`]
/// and published on the event buses.
pub struct EnergySource {
    name: String,
    role: EnergySourceRole,
    policy: PublishPolicy,
    buses: Arc<EventBuses>,
    meters: Mutex<Vec<Box<dyn EnergyMeter>>>,
    tick_interval: Duration,
    snapshot: RwLock<SourceSnapshot>,
    running: AtomicBool,
    updates: watch::Sender<u64>,
}

impl EnergySource {
    pub fn new(name: &str, role: EnergySourceRole, policy: PublishPolicy, meters: Vec<Box<dyn EnergyMeter>>, buses: Arc<EventBuses>) -> Arc<Self> {
        let tick_interval = meters.iter().map(|m| m.update_interval()).max().unwrap_or(DEFAULT_TICK);
        let infos = meters.iter().map(|m| MeterInfo::of(m.as_ref())).collect();
        let (updates, _) = watch::channel(0);

        return Arc::new(EnergySource {
            name: name.to_string(),
            role,
            policy,
            buses,
            meters: Mutex::new(meters),
            tick_interval,
            snapshot: RwLock::new(SourceSnapshot { meters: infos, ..Default::default() }),
            running: AtomicBool::new(false),
            updates,
        });
    }

    pub fn name(&self) -> &str {
        return &self.name;
    }

    pub fn role(&self) -> EnergySourceRole {
        return self.role;
    }

    pub fn tick_interval(&self) -> Duration {
        return self.tick_interval;
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        return self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone();
    }

    /// Receives the number of every finished tick, slow receivers only see the latest
    pub fn subscribe_updates(&self) -> watch::Receiver<u64> {
        return self.updates.subscribe();
    }

    /// Starts the polling task, a source that was started before is left alone
    pub fn start_measuring(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("{} is already measuring", self.name);
            return None;
        }

        let source = self.clone();
        return Some(tokio::spawn(async move {
            source.run(cancel).await;
        }));
    }

    async fn run(&self, cancel: CancellationToken) {
        let period = self.tick_interval;
        info!("Starting measurement of {} ({}) every {:?}", self.name, self.role, period);

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Stopping measurement of {}", self.name);
        let mut meters = self.meters.lock().await;
        join_all(meters.iter_mut().map(|m| m.shutdown())).await;
    }

    /// Polls every meter once and publishes the merged readings, returns whether anything was published
    pub async fn tick(&self) -> bool {
        let started = Instant::now();
        let mut readings = MeterReadings::default();
        let mut changed = false;

        let infos = {
            let mut meters = self.meters.lock().await;
            for meter in meters.iter_mut() {
                if meter.update_values(&mut readings).await {
                    changed = true;
                }
            }
            meters.iter().map(|m| MeterInfo::of(m.as_ref())).collect()
        };

        let tick = {
            let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            *snapshot = SourceSnapshot {
                readings,
                meters: infos,
                tick: snapshot.tick + 1,
                updated: Some(Utc::now()),
            };
            snapshot.tick
        };
        self.updates.send_replace(tick);
        debug!("{} tick {tick} took {:?}, changed={changed}", self.name, started.elapsed());

        if self.policy == PublishPolicy::OnChange && !changed {
            return false;
        }
        return self.publish(&readings);
    }

    fn publish(&self, readings: &MeterReadings) -> bool {
        let mut published = false;

        if !readings.state.is_zero() || !readings.usage.is_zero() {
            if let Err(e) = readings.state.validate() {
                warn!("{}: implausible electricity state: {e}", self.name);
            }
            if let Err(e) = readings.usage.validate() {
                warn!("{}: implausible electricity usage: {e}", self.name);
            }
            let values = ElectricityValues { state: readings.state, usage: readings.usage };
            self.buses.electricity_meter.trigger(MeterValues::new(&self.name, self.role, values));
            published = true;
        }

        if !readings.battery.is_zero() {
            if let Err(e) = readings.battery.validate() {
                warn!("{}: implausible battery state: {e}", self.name);
            }
            self.buses.battery_meter.trigger(MeterValues::new(&self.name, self.role, readings.battery));
            published = true;
        }

        if !readings.gas.is_zero() {
            if let Err(e) = readings.gas.validate() {
                warn!("{}: implausible gas reading: {e}", self.name);
            }
            self.buses.gas_meter.trigger(MeterValues::new(&self.name, self.role, readings.gas));
            published = true;
        }

        if !readings.water.is_zero() {
            if let Err(e) = readings.water.validate() {
                warn!("{}: implausible water reading: {e}", self.name);
            }
            self.buses.water_meter.trigger(MeterValues::new(&self.name, self.role, readings.water));
            published = true;
        }

        return published;
    }

    /// JSON view of the source for status output
    pub fn to_map(&self) -> Map<String, Value> {
        let snapshot = self.snapshot();
        let mut map = Map::new();
        map.insert("name".to_string(), json!(self.name));
        map.insert("role".to_string(), json!(self.role.as_str()));
        map.insert("tick".to_string(), json!(snapshot.tick));
        map.insert("updated".to_string(), json!(snapshot.updated.map(|t| t.to_rfc3339())));
        map.insert("meters".to_string(), serde_json::to_value(&snapshot.meters).unwrap_or(Value::Null));
        map.insert("state".to_string(), serde_json::to_value(snapshot.readings.state).unwrap_or(Value::Null));
        map.insert("usage".to_string(), serde_json::to_value(snapshot.readings.usage).unwrap_or(Value::Null));
        if self.role == EnergySourceRole::Battery || !snapshot.readings.battery.is_zero() {
            map.insert("battery".to_string(), serde_json::to_value(snapshot.readings.battery).unwrap_or(Value::Null));
        }
        if !snapshot.readings.gas.is_zero() {
            map.insert("gas".to_string(), serde_json::to_value(snapshot.readings.gas).unwrap_or(Value::Null));
        }
        if !snapshot.readings.water.is_zero() {
            map.insert("water".to_string(), serde_json::to_value(snapshot.readings.water).unwrap_or(Value::Null));
        }
        return map;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::{settle, Recorder};
    use crate::events::{match_role, ElectricityMeterValues, GasMeterValues, Listener};
    use crate::meters::testing::ScriptedMeter;
    use crate::models::GasUsage;

    fn grid_reading(meter: &ScriptedMeter, power: f32) {
        let mut script = meter.script.lock().unwrap();
        script.state.set_voltage(0, 230.0).unwrap();
        script.state.set_power(0, power).unwrap();
        script.usage.set_energy_consumed(0, 1000.0).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slowest_meter_sets_the_pace() {
        let fast = ScriptedMeter::new(200);
        let slow = ScriptedMeter::new(500);
        let (fast_c, slow_c) = (fast.counters.clone(), slow.counters.clone());

        let source = EnergySource::new("grid", EnergySourceRole::Grid, PublishPolicy::Always, vec![Box::new(fast), Box::new(slow)], EventBuses::new());
        assert_eq!(source.tick_interval(), Duration::from_millis(500));

        let cancel = CancellationToken::new();
        let handle = source.start_measuring(cancel.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(1600)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(fast_c.updates(), 3);
        assert_eq!(slow_c.updates(), 3);
        assert_eq!(fast_c.shutdowns(), 1);
        assert_eq!(slow_c.shutdowns(), 1);
        assert_eq!(source.snapshot().tick, 3);
    }

    #[tokio::test]
    async fn test_second_start_is_ignored() {
        let source = EnergySource::new("pv", EnergySourceRole::Pv, PublishPolicy::Always, vec![Box::new(ScriptedMeter::new(100))], EventBuses::new());
        let cancel = CancellationToken::new();
        let first = source.start_measuring(cancel.clone());
        assert!(first.is_some());
        assert!(source.start_measuring(cancel.clone()).is_none());
        cancel.cancel();
        first.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_readings_are_not_published() {
        let buses = EventBuses::new();
        let recorder = Recorder::<ElectricityMeterValues>::new();
        let listener: Arc<dyn Listener<ElectricityMeterValues>> = recorder.clone();
        buses.electricity_meter.register(listener, None).unwrap();

        let meter = ScriptedMeter::new(100);
        let script = meter.script.clone();
        let source = EnergySource::new("grid", EnergySourceRole::Grid, PublishPolicy::Always, vec![Box::new(meter)], buses);

        assert!(!source.tick().await);
        script.lock().unwrap().state.set_voltage(1, 231.0).unwrap();
        assert!(source.tick().await);
        settle().await;

        let received = recorder.received.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].source_name, "grid");
        assert_eq!(received[0].values.state.voltage(1), 231.0);
    }

    #[tokio::test]
    async fn test_on_change_policy() {
        let buses = EventBuses::new();
        let mut meter = ScriptedMeter::new(100);
        grid_reading(&meter, 500.0);
        meter.changed = false;
        let source = EnergySource::new("grid", EnergySourceRole::Grid, PublishPolicy::OnChange, vec![Box::new(meter)], buses);

        assert!(!source.tick().await);
        /* the snapshot is replaced even when nothing is published */
        assert_eq!(source.snapshot().readings.state.power(0), 500.0);
    }

    #[tokio::test]
    async fn test_lines_of_several_meters_merge() {
        let mut l1 = ScriptedMeter::new(100);
        l1.lines = vec![0];
        let mut l23 = ScriptedMeter::new(100);
        l23.lines = vec![1, 2];
        grid_reading(&l1, 100.0);
        {
            let mut s = l23.script.lock().unwrap();
            s.state.set_power(0, 999.0).unwrap();
            s.state.set_power(1, -50.0).unwrap();
            s.state.set_power(2, 0.0).unwrap();
        }

        let source = EnergySource::new("grid", EnergySourceRole::Grid, PublishPolicy::Always, vec![Box::new(l1), Box::new(l23)], EventBuses::new());
        source.tick().await;
        let state = source.snapshot().readings.state;
        assert_eq!(state.power(0), 100.0);
        assert_eq!(state.total_power(), 50.0);
    }

    #[tokio::test]
    async fn test_gas_goes_to_gas_bus() {
        let buses = EventBuses::new();
        let recorder = Recorder::<GasMeterValues>::new();
        let listener: Arc<dyn Listener<GasMeterValues>> = recorder.clone();
        buses.gas_meter.register(listener, Some(match_role(EnergySourceRole::Grid))).unwrap();

        let meter = ScriptedMeter::new(100);
        meter.script.lock().unwrap().gas = GasUsage::new(1234.5);
        let source = EnergySource::new("grid", EnergySourceRole::Grid, PublishPolicy::Always, vec![Box::new(meter)], buses);
        source.tick().await;
        settle().await;
        assert_eq!(recorder.count().await, 1);
    }

    #[tokio::test]
    async fn test_update_signal_and_map() {
        let meter = ScriptedMeter::new(100);
        grid_reading(&meter, 20.0);
        let source = EnergySource::new("grid", EnergySourceRole::Grid, PublishPolicy::Always, vec![Box::new(meter)], EventBuses::new());
        let mut rx = source.subscribe_updates();

        source.tick().await;
        source.tick().await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2);

        let map = source.to_map();
        assert_eq!(map["role"], "grid");
        assert_eq!(map["meters"][0]["serial"], "0001");
        assert!(map["meters"][0].get("connect_url").is_none());
        assert_eq!(map["state"]["l1_voltage"], 230.0);
        assert!(map.get("battery").is_none());
    }

    #[test]
    fn test_meter_info_shows_bus() {
        let info = MeterInfo {
            brand: MeterBrand::Abb,
            model: "B23".to_string(),
            serial: "1234".to_string(),
            line_indices: vec![0, 1, 2],
            attributes: vec![MeterAttribute::State],
            connect_url: Some("rtu:///dev/ttyUSB0".to_string()),
            unit_id: Some(3),
            baud_rate: Some(19200),
        };
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["connect_url"], "rtu:///dev/ttyUSB0");
        assert_eq!(v["unit_id"], 3);
        assert_eq!(v["baud_rate"], 19200);
    }
}
