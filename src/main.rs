use log::{error, info, warn};
use meterhub::costs::CostCalculator;
use meterhub::events::match_role;
use meterhub::meters::BrandInfo;
use meterhub::meters::dsmr::{SerialPortOpener, DEFAULT_TELEGRAM_TIMEOUT};
use meterhub::metering_modbus::RmodbusFactory;
use meterhub::models::EnergySourceRole;
use meterhub::{Config, ConnectionRegistry, EnergyMeter, EnergySource, EventBuses, MeterProber, SystemState};
use std::{env, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = env::var("METERHUB_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config_arg = env::args().nth(1);
    let config = match Config::find_and_load(config_arg.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let registry = ConnectionRegistry::new(Arc::new(RmodbusFactory));
    let ports = Arc::new(SerialPortOpener { timeout: config.probe_timeout() });
    let prober = MeterProber::new(registry.clone(), ports, config.probe_timeout(), DEFAULT_TELEGRAM_TIMEOUT);

    let buses = EventBuses::new();
    let cancel = CancellationToken::new();
    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    /* Probe every configured slot, sources are built from what answered */
    let mut sources: Vec<Arc<EnergySource>> = Vec::new();
    for source in &config.sources {
        let mut meters: Vec<Box<dyn EnergyMeter>> = Vec::new();
        for meter in &source.meters {
            if let Some(m) = prober.probe(&meter.probe_request(source.role)).await {
                info!("{}: found {} {} serial {} at {}", source.name, m.brand(), m.model(), m.serial(), meter.connect);
                meters.push(m);
            }
        }

        if meters.is_empty() {
            if source.mandatory {
                error!("No meter of mandatory source {} was detected, giving up", source.name);
                std::process::exit(1);
            }
            warn!("No meter of source {} was detected, skipping it", source.name);
            continue;
        }
        sources.push(EnergySource::new(&source.name, source.role, source.publish, meters, buses.clone()));
    }
    info!("{} sources with {} open buses", sources.len(), registry.len());

    let state = SystemState::new();
    state.attach(&buses);

    if let Some(tariff) = config.costs {
        let costs = CostCalculator::new(tariff, buses.clone());
        if let Err(e) = buses.electricity_meter.register(costs, Some(match_role(EnergySourceRole::Grid))) {
            error!("Cost calculator: {e}");
        }
    }

    #[cfg(feature = "mqtt")]
    if let Some(mqtt_config) = &config.mqtt {
        let (publisher, handle) = meterhub::mqtt::MqttPublisher::new(mqtt_config, cancel.clone());
        publisher.attach(&buses);
        threads.push(handle);
    }

    for source in &sources {
        if let Some(handle) = source.start_measuring(cancel.clone()) {
            threads.push(handle);
        }
    }

    /* Periodic status summary */
    let summary_state = state.clone();
    let summary_cancel = cancel.clone();
    threads.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(SUMMARY_INTERVAL);
        interval.tick().await; // nothing measured yet
        loop {
            tokio::select! {
                _ = summary_cancel.cancelled() => break,
                _ = interval.tick() => {
                    for line in summary_state.summary().await {
                        info!("{line}");
                    }
                }
            }
        }
    }));

    info!("All sources started, now waiting for a signal to exit");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();

    for task in threads {
        if let Err(e) = task.await {
            error!("Task ended abnormally: {e}");
        }
    }
    Ok(())
}
