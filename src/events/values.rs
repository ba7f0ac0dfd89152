use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{BatteryState, ElectricityState, ElectricityUsage, EnergySourceRole, GasUsage, WaterUsage};
use super::{EventBus, Filter};

/// Envelope of every published event, never changed after creation
#[derive(Debug, Clone, Serialize)]
pub struct MeterValues<T> {
    pub id: String,
    pub event_time: DateTime<Utc>,
    pub source_name: String,
    pub role: EnergySourceRole,
    pub values: T,
}

impl<T> MeterValues<T> {
    pub fn new(source_name: &str, role: EnergySourceRole, values: T) -> Self {
        return MeterValues {
            id: Uuid::new_v4().to_string(),
            event_time: Utc::now(),
            source_name: source_name.to_string(),
            role,
            values,
        };
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ElectricityValues {
    pub state: ElectricityState,
    pub usage: ElectricityUsage,
}

/// Money flows between two consecutive usage readings of one source
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ElectricityCosts {
    /// kWh drawn since the previous reading
    pub energy_consumed: f64,
    /// kWh fed in since the previous reading
    pub energy_provided: f64,
    pub import_cost: f64,
    pub export_revenue: f64,
}

pub type ElectricityMeterValues = MeterValues<ElectricityValues>;
pub type ElectricityCostValues = MeterValues<ElectricityCosts>;
pub type GasMeterValues = MeterValues<GasUsage>;
pub type WaterMeterValues = MeterValues<WaterUsage>;
pub type BatteryMeterValues = MeterValues<BatteryState>;

/// Gives filters access to the envelope of any event family
pub trait SourceEvent {
    fn source_name(&self) -> &str;
    fn role(&self) -> EnergySourceRole;
}

impl<T> SourceEvent for MeterValues<T> {
    fn source_name(&self) -> &str {
        return &self.source_name;
    }

    fn role(&self) -> EnergySourceRole {
        return self.role;
    }
}

/// Accepts events of one named source with the given role
pub fn match_source<E: SourceEvent + 'static>(name: &str, role: EnergySourceRole) -> Filter<E> {
    let name = name.to_string();
    return Arc::new(move |e: &E| e.source_name() == name && e.role() == role);
}

pub fn match_role<E: SourceEvent + 'static>(role: EnergySourceRole) -> Filter<E> {
    return Arc::new(move |e: &E| e.role() == role);
}

/// The event families a process publishes on, shared between producers and consumers
pub struct EventBuses {
    pub electricity_meter: EventBus<ElectricityMeterValues>,
    pub electricity_costs: EventBus<ElectricityCostValues>,
    pub gas_meter: EventBus<GasMeterValues>,
    pub water_meter: EventBus<WaterMeterValues>,
    pub battery_meter: EventBus<BatteryMeterValues>,
}

impl EventBuses {
    pub fn new() -> Arc<Self> {
        return Arc::new(EventBuses {
            electricity_meter: EventBus::new("electricity-meter"),
            electricity_costs: EventBus::new("electricity-costs"),
            gas_meter: EventBus::new("gas-meter"),
            water_meter: EventBus::new("water-meter"),
            battery_meter: EventBus::new("battery-meter"),
        });
    }
}
