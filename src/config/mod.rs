use log::{debug, info};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::costs::Tariff;
use crate::metering_modbus::ConnectUrl;
use crate::meters::prober::Transport;
use crate::meters::{MeterSetup, ProbeRequest};
use crate::models::{EnergySourceRole, LineIndex, MeterAttribute, MeterBrand, MAX_PHASES};
use crate::sources::PublishPolicy;

/// Searched in this order when no path is given on the command line
pub const DEFAULT_PATHS: [&str; 2] = ["config/meterhub.yaml", "meterhub.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no configuration found, tried {0:?}")]
    NotFound(Vec<PathBuf>),
    #[error("unable to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("unable to parse configuration: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("source {source_name}: {reason}")]
    Invalid { source_name: String, reason: String },
    #[error("source name {0} is used more than once")]
    DuplicateSource(String),
}

fn probe_timeout_ms_default() -> u64 { return 1000 }
fn sources_default() -> Vec<SourceConfig> { return Vec::new() }

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default="probe_timeout_ms_default")]
    pub probe_timeout_ms: u64,
    #[serde(default="sources_default")]
    pub sources: Vec<SourceConfig>,
    pub costs: Option<Tariff>,
    pub mqtt: Option<MqttConfig>,
}

fn mandatory_default() -> bool { return false }

#[derive(Deserialize, Clone, Debug)]
pub struct SourceConfig {
    pub name: String,
    pub role: EnergySourceRole,
    #[serde(default)]
    pub publish: PublishPolicy,
    #[serde(default="mandatory_default")]
    pub mandatory: bool,
    pub meters: Vec<MeterConfig>,
}

fn unit_id_default() -> u8 { return 1 }
fn line_indices_default() -> Vec<LineIndex> { return vec![0, 1, 2] }
fn attributes_default() -> Vec<MeterAttribute> { return vec![MeterAttribute::State, MeterAttribute::Usage] }
fn update_interval_ms_default() -> u64 { return 1000 }

#[derive(Deserialize, Clone, Debug)]
pub struct MeterConfig {
    pub connect: String,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub brand: Option<MeterBrand>,
    #[serde(default="unit_id_default")]
    pub unit_id: u8,
    /// 0 probes the candidate rates
    #[serde(default)]
    pub baud_rate: u32,
    #[serde(default="line_indices_default")]
    pub line_indices: Vec<LineIndex>,
    #[serde(default="attributes_default")]
    pub attributes: Vec<MeterAttribute>,
    #[serde(default="update_interval_ms_default")]
    pub update_interval_ms: u64,
}

fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_client_name_default() -> String { return "meterhub".to_string() }
fn mqtt_topic_prefix_default() -> String { return "meterhub".to_string() }

#[derive(Deserialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_topic_prefix_default")]
    pub topic_prefix: String,
}

impl Config {
    /// Loads the given file or the first of [`DEFAULT_PATHS`] that exists
    pub fn find_and_load(path: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            return Config::load(Path::new(p));
        }

        for candidate in DEFAULT_PATHS {
            let p = Path::new(candidate);
            if p.exists() {
                return Config::load(p);
            }
            debug!("No configuration at {candidate}");
        }
        return Err(ConfigError::NotFound(DEFAULT_PATHS.iter().map(PathBuf::from).collect()));
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io { path: path.to_path_buf(), source: e })?;
        let config = Config::parse(&contents)?;
        info!("Configuration loaded from {}, {} sources", path.display(), config.sources.len());
        return Ok(config);
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(contents)?;
        config.validate()?;
        return Ok(config);
    }

    pub fn probe_timeout(&self) -> Duration {
        return Duration::from_millis(self.probe_timeout_ms);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
            source.validate()?;
        }
        return Ok(());
    }
}

impl SourceConfig {
    fn invalid(&self, reason: String) -> ConfigError {
        return ConfigError::Invalid { source_name: self.name.clone(), reason };
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut claimed: HashSet<(MeterAttribute, LineIndex)> = HashSet::new();

        for meter in &self.meters {
            meter.validate(self.role).map_err(|reason| self.invalid(reason))?;

            /* battery meters do not map onto lines */
            if self.role == EnergySourceRole::Battery {
                continue;
            }
            for attribute in &meter.attributes {
                for line in &meter.line_indices {
                    if !claimed.insert((*attribute, *line)) {
                        return Err(self.invalid(format!("line {line} is claimed twice for {attribute:?}")));
                    }
                }
            }
        }
        return Ok(());
    }
}

impl MeterConfig {
    fn validate(&self, role: EnergySourceRole) -> Result<(), String> {
        let mut seen = HashSet::new();
        for line in &self.line_indices {
            if *line >= MAX_PHASES {
                return Err(format!("{}: line index {line} is out of range", self.connect));
            }
            if !seen.insert(*line) {
                return Err(format!("{}: line index {line} is listed twice", self.connect));
            }
        }
        if self.line_indices.is_empty() && role != EnergySourceRole::Battery {
            return Err(format!("{}: at least one line index is needed", self.connect));
        }
        if self.attributes.is_empty() {
            return Err(format!("{}: no attributes selected", self.connect));
        }
        if self.update_interval_ms == 0 {
            return Err(format!("{}: update interval must not be 0", self.connect));
        }

        let url = ConnectUrl::parse(&self.connect).map_err(|e| e.to_string())?;
        match self.transport {
            Transport::Modbus => {
                if !(1..=247).contains(&self.unit_id) {
                    return Err(format!("{}: unit id {} is outside 1..=247", self.connect, self.unit_id));
                }
                if self.brand == Some(MeterBrand::Dsmr) {
                    return Err(format!("{}: DSMR meters need the serial transport", self.connect));
                }
            }
            Transport::Serial => {
                if !url.is_serial() {
                    return Err(format!("{}: the serial transport needs an rtu:// url", self.connect));
                }
                if self.brand.is_some_and(|b| b != MeterBrand::Dsmr) {
                    return Err(format!("{}: only DSMR meters use the serial transport", self.connect));
                }
            }
        }
        return Ok(());
    }

    pub fn probe_request(&self, role: EnergySourceRole) -> ProbeRequest {
        return ProbeRequest {
            connect: self.connect.clone(),
            transport: self.transport,
            brand: self.brand,
            unit_id: self.unit_id,
            baud_rate: self.baud_rate,
            setup: MeterSetup {
                role,
                line_indices: self.line_indices.clone(),
                attributes: self.attributes.clone(),
                update_interval: Duration::from_millis(self.update_interval_ms),
            },
        };
    }
}
