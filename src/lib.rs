//! Energy meter detection, polling and publishing.
//!
//! Meters on Modbus buses and DSMR P1 ports are detected at startup, grouped
//! into energy sources (grid, pv, battery) and polled on a schedule. Every
//! tick's readings are published on typed event buses.

pub mod models;
pub mod events;
pub mod metering_modbus;
pub mod serial;
pub mod meters;
pub mod sources;
pub mod costs;
pub mod state;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod config;

// Re-export common types for easier access
pub use config::{Config, ConfigError};
pub use events::EventBuses;
pub use meters::{EnergyMeter, MeterProber, ProbeRequest};
pub use metering_modbus::ConnectionRegistry;
pub use sources::{EnergySource, PublishPolicy};
pub use state::SystemState;
