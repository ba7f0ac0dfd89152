use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::events::{ElectricityCosts, ElectricityMeterValues, EventBuses, Listener, MeterValues};

/// Fixed prices per kWh
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Tariff {
    pub import_price_per_kwh: f64,
    pub export_price_per_kwh: f64,
}

#[derive(Debug, Clone, Copy)]
struct Totals {
    consumed: f64,
    provided: f64,
    at: DateTime<Utc>,
}

/// Turns the energy counters of grid sources into cost events.
///
/// The first reading of a source only sets the baseline. A counter that goes
/// backwards (meter replaced or reset) starts a new baseline as well.
/// Deliveries are not ordered, a reading older than the stored one is ignored.
pub struct CostCalculator {
    tariff: Tariff,
    buses: Arc<EventBuses>,
    previous: Mutex<HashMap<String, Totals>>,
}

impl CostCalculator {
    pub fn new(tariff: Tariff, buses: Arc<EventBuses>) -> Arc<Self> {
        return Arc::new(CostCalculator { tariff, buses, previous: Mutex::new(HashMap::new()) });
    }

    fn costs_for(&self, consumed: f64, provided: f64) -> ElectricityCosts {
        return ElectricityCosts {
            energy_consumed: consumed,
            energy_provided: provided,
            import_cost: consumed * self.tariff.import_price_per_kwh,
            export_revenue: provided * self.tariff.export_price_per_kwh,
        };
    }
}

#[async_trait]
impl Listener<ElectricityMeterValues> for CostCalculator {
    async fn on_event(&self, event: Arc<ElectricityMeterValues>) {
        let usage = &event.values.usage;
        if usage.is_zero() {
            return;
        }
        let now = Totals {
            consumed: usage.total_energy_consumed(),
            provided: usage.total_energy_provided(),
            at: event.event_time,
        };

        let delta = {
            let mut previous = self.previous.lock().await;
            if let Some(last) = previous.get(&event.source_name) {
                if now.at < last.at {
                    debug!("{}: ignoring reading from {}, already at {}", event.source_name, now.at, last.at);
                    return;
                }
            }
            let last = previous.insert(event.source_name.clone(), now);
            match last {
                None => {
                    info!("{}: cost baseline at {:.3} kWh consumed, {:.3} kWh provided", event.source_name, now.consumed, now.provided);
                    None
                }
                Some(last) if now.consumed < last.consumed || now.provided < last.provided => {
                    info!("{}: energy counter went backwards, new cost baseline", event.source_name);
                    None
                }
                Some(last) => Some((now.consumed - last.consumed, now.provided - last.provided)),
            }
        };

        let (consumed, provided) = match delta {
            Some(d) => d,
            None => return,
        };
        if consumed == 0.0 && provided == 0.0 {
            return;
        }

        let costs = self.costs_for(consumed, provided);
        debug!("{}: import {:.4} export {:.4}", event.source_name, costs.import_cost, costs.export_revenue);
        self.buses.electricity_costs.trigger(MeterValues::new(&event.source_name, event.role, costs));
    }
}
