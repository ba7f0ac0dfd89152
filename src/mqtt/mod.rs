use async_trait::async_trait;
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::events::{
    BatteryMeterValues, ElectricityCostValues, ElectricityMeterValues, EventBuses, GasMeterValues, Listener,
    MeterValues, WaterMeterValues,
};

/// Sub topic of each event family below `<prefix>/<source>/`
pub mod kind {
    pub const ELECTRICITY: &str = "electricity";
    pub const COSTS: &str = "costs";
    pub const GAS: &str = "gas";
    pub const WATER: &str = "water";
    pub const BATTERY: &str = "battery";
}

pub fn topic_for(prefix: &str, source: &str, kind: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    /* topic levels must not contain wildcards or separators */
    let source: String = source
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' => '_',
            c => c,
        })
        .collect();
    return format!("{prefix}/{source}/{kind}");
}

/// Publishes every event it receives as JSON on the broker
pub struct MqttPublisher {
    client: AsyncClient,
    prefix: String,
}

impl MqttPublisher {
    /// Connects to the broker, the event loop runs until `cancel` fires
    pub fn new(config: &MqttConfig, cancel: CancellationToken) -> (Arc<Self>, JoinHandle<()>) {
        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut options = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            options.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        let handle = tokio::spawn(async move {
            info!("MQTT eventloop started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    polled = eventloop.poll() => match polled {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => info!("MQTT connected"),
                        Ok(_) => {}
                        Err(e) => {
                            error!("Error in MQTT {e:?}, reconnecting");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            info!("MQTT eventloop stopped");
        });

        let publisher = Arc::new(MqttPublisher { client, prefix: config.topic_prefix.clone() });
        return (publisher, handle);
    }

    /// Registers the publisher on every event family
    pub fn attach(self: &Arc<Self>, buses: &EventBuses) {
        let results = [
            buses.electricity_meter.register(self.clone(), None).err(),
            buses.electricity_costs.register(self.clone(), None).err(),
            buses.gas_meter.register(self.clone(), None).err(),
            buses.water_meter.register(self.clone(), None).err(),
            buses.battery_meter.register(self.clone(), None).err(),
        ];
        for e in results.into_iter().flatten() {
            error!("MQTT publisher: {e}");
        }
    }

    async fn publish<T: Serialize>(&self, kind: &str, event: &MeterValues<T>) {
        let topic = topic_for(&self.prefix, &event.source_name, kind);
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                error!("Cannot encode {kind} event of {}: {e}", event.source_name);
                return;
            }
        };

        match self.client.publish(topic.clone(), QoS::AtLeastOnce, false, payload).await {
            Err(e) => error!("Error publishing to {topic}: {e}"),
            Ok(_) => debug!("Published {topic}"),
        }
    }
}

#[async_trait]
impl Listener<ElectricityMeterValues> for MqttPublisher {
    async fn on_event(&self, event: Arc<ElectricityMeterValues>) {
        self.publish(kind::ELECTRICITY, &event).await;
    }
}

#[async_trait]
impl Listener<ElectricityCostValues> for MqttPublisher {
    async fn on_event(&self, event: Arc<ElectricityCostValues>) {
        self.publish(kind::COSTS, &event).await;
    }
}

#[async_trait]
impl Listener<GasMeterValues> for MqttPublisher {
    async fn on_event(&self, event: Arc<GasMeterValues>) {
        self.publish(kind::GAS, &event).await;
    }
}

#[async_trait]
impl Listener<WaterMeterValues> for MqttPublisher {
    async fn on_event(&self, event: Arc<WaterMeterValues>) {
        self.publish(kind::WATER, &event).await;
    }
}

#[async_trait]
impl Listener<BatteryMeterValues> for MqttPublisher {
    async fn on_event(&self, event: Arc<BatteryMeterValues>) {
        self.publish(kind::BATTERY, &event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics() {
        assert_eq!(topic_for("meterhub", "grid", kind::ELECTRICITY), "meterhub/grid/electricity");
        assert_eq!(topic_for("home/energy/", "pv roof", kind::COSTS), "home/energy/pv roof/costs");
        assert_eq!(topic_for("meterhub", "a/b#", kind::GAS), "meterhub/a_b_/gas");
    }

    #[tokio::test]
    async fn test_attach_registers_everywhere() {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: String::new(),
            pass: String::new(),
            client_name: "meterhub-test".to_string(),
            topic_prefix: "meterhub".to_string(),
        };
        let cancel = CancellationToken::new();
        let (publisher, handle) = MqttPublisher::new(&config, cancel.clone());
        let buses = EventBuses::new();
        publisher.attach(&buses);

        assert_eq!(buses.electricity_meter.listener_count(), 1);
        assert_eq!(buses.electricity_costs.listener_count(), 1);
        assert_eq!(buses.battery_meter.listener_count(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
