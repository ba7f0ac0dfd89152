//! In-memory mirror of the latest event of every source.

use async_trait::async_trait;
use log::warn;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::events::{
    BatteryMeterValues, ElectricityCostValues, ElectricityMeterValues, EventBuses, GasMeterValues, Listener,
    MeterValues, WaterMeterValues,
};

#[derive(Default)]
struct Latest {
    electricity: BTreeMap<String, Arc<ElectricityMeterValues>>,
    costs: BTreeMap<String, Arc<ElectricityCostValues>>,
    gas: BTreeMap<String, Arc<GasMeterValues>>,
    water: BTreeMap<String, Arc<WaterMeterValues>>,
    battery: BTreeMap<String, Arc<BatteryMeterValues>>,
}

pub struct SystemState {
    latest: RwLock<Latest>,
}

impl SystemState {
    pub fn new() -> Arc<Self> {
        return Arc::new(SystemState { latest: RwLock::new(Latest::default()) });
    }

    /// Registers the mirror on every event family
    pub fn attach(self: &Arc<Self>, buses: &EventBuses) {
        let results = [
            buses.electricity_meter.register(self.clone(), None).err(),
            buses.electricity_costs.register(self.clone(), None).err(),
            buses.gas_meter.register(self.clone(), None).err(),
            buses.water_meter.register(self.clone(), None).err(),
            buses.battery_meter.register(self.clone(), None).err(),
        ];
        for e in results.into_iter().flatten() {
            warn!("System state: {e}");
        }
    }

    pub async fn electricity(&self, source: &str) -> Option<Arc<ElectricityMeterValues>> {
        return self.latest.read().await.electricity.get(source).cloned();
    }

    pub async fn costs(&self, source: &str) -> Option<Arc<ElectricityCostValues>> {
        return self.latest.read().await.costs.get(source).cloned();
    }

    pub async fn gas(&self, source: &str) -> Option<Arc<GasMeterValues>> {
        return self.latest.read().await.gas.get(source).cloned();
    }

    pub async fn water(&self, source: &str) -> Option<Arc<WaterMeterValues>> {
        return self.latest.read().await.water.get(source).cloned();
    }

    pub async fn battery(&self, source: &str) -> Option<Arc<BatteryMeterValues>> {
        return self.latest.read().await.battery.get(source).cloned();
    }

    /// Sum of the current power of all electricity sources, in W
    pub async fn total_power(&self) -> f32 {
        let latest = self.latest.read().await;
        return latest.electricity.values().map(|e| e.values.state.total_power()).sum();
    }

    /// One line per source for the periodic status log
    pub async fn summary(&self) -> Vec<String> {
        let latest = self.latest.read().await;
        let mut lines = Vec::new();
        for (name, e) in &latest.electricity {
            let mut line = format!(
                "{name} ({}): {:.0} W, {:.3} kWh consumed, {:.3} kWh provided",
                e.role,
                e.values.state.total_power(),
                e.values.usage.total_energy_consumed(),
                e.values.usage.total_energy_provided()
            );
            if let Some(c) = latest.costs.get(name) {
                line.push_str(&format!(", last cost {:.4} / revenue {:.4}", c.values.import_cost, c.values.export_revenue));
            }
            lines.push(line);
        }
        for (name, b) in &latest.battery {
            lines.push(format!("{name} (battery): {:.0} W, {:.1} % charged", b.values.power, b.values.state_of_charge));
        }
        for (name, g) in &latest.gas {
            lines.push(format!("{name} (gas): {:.3} m³", g.values.consumed));
        }
        for (name, w) in &latest.water {
            lines.push(format!("{name} (water): {:.3} m³", w.values.consumed));
        }
        return lines;
    }

    pub async fn to_map(&self) -> Map<String, Value> {
        let latest = self.latest.read().await;
        let mut map = Map::new();
        map.insert("electricity".to_string(), serde_json::to_value(&latest.electricity).unwrap_or(Value::Null));
        map.insert("costs".to_string(), serde_json::to_value(&latest.costs).unwrap_or(Value::Null));
        map.insert("gas".to_string(), serde_json::to_value(&latest.gas).unwrap_or(Value::Null));
        map.insert("water".to_string(), serde_json::to_value(&latest.water).unwrap_or(Value::Null));
        map.insert("battery".to_string(), serde_json::to_value(&latest.battery).unwrap_or(Value::Null));
        return map;
    }
}

/* deliveries are not ordered, a late older event must not replace a newer one */
fn keep_newer<T>(entries: &mut BTreeMap<String, Arc<MeterValues<T>>>, event: Arc<MeterValues<T>>) {
    if let Some(existing) = entries.get(&event.source_name) {
        if event.event_time < existing.event_time {
            return;
        }
    }
    entries.insert(event.source_name.clone(), event);
}

#[async_trait]
impl Listener<ElectricityMeterValues> for SystemState {
    async fn on_event(&self, event: Arc<ElectricityMeterValues>) {
        keep_newer(&mut self.latest.write().await.electricity, event);
    }
}

#[async_trait]
impl Listener<ElectricityCostValues> for SystemState {
    async fn on_event(&self, event: Arc<ElectricityCostValues>) {
        keep_newer(&mut self.latest.write().await.costs, event);
    }
}

#[async_trait]
impl Listener<GasMeterValues> for SystemState {
    async fn on_event(&self, event: Arc<GasMeterValues>) {
        keep_newer(&mut self.latest.write().await.gas, event);
    }
}

#[async_trait]
impl Listener<WaterMeterValues> for SystemState {
    async fn on_event(&self, event: Arc<WaterMeterValues>) {
        keep_newer(&mut self.latest.write().await.water, event);
    }
}

#[async_trait]
impl Listener<BatteryMeterValues> for SystemState {
    async fn on_event(&self, event: Arc<BatteryMeterValues>) {
        keep_newer(&mut self.latest.write().await.battery, event);
    }
}
