use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ConnectUrl, ModbusClient, ModbusError, RmodbusClient, SharedClient};

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub url: String,
    /// ignored for network transports
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(url: &str, baud_rate: u32, timeout: Duration) -> Self {
        return ConnectionConfig { url: url.to_string(), baud_rate, timeout };
    }
}

/// Opens new wire clients for the registry
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn ModbusClient>, ModbusError>;
}

pub struct RmodbusFactory;

#[async_trait]
impl ClientFactory for RmodbusFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn ModbusClient>, ModbusError> {
        let url = ConnectUrl::parse(&config.url)?;
        let mut client = RmodbusClient::new(url, config.baud_rate, config.timeout);
        client.open().await?;
        return Ok(Box::new(client));
    }
}

struct CacheEntry {
    client: SharedClient,
    /// meters currently owning a lease on this bus
    users: usize,
}

/// Holds at most one open client per connect url, shared by every meter on that bus.
///
/// Created once per process and handed to the prober. A client is closed
/// when a failed probe removes it while nobody holds a lease, or when the
/// last meter owning a lease releases it.
pub struct ConnectionRegistry {
    factory: Arc<dyn ClientFactory>,
    clients: Mutex<HashMap<String, CacheEntry>>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Arc<Self> {
        return Arc::new(ConnectionRegistry { factory, clients: Mutex::new(HashMap::new()) });
    }

    pub fn cached(&self, url: &str) -> Option<SharedClient> {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        return clients.get(url).map(|e| e.client.clone());
    }

    /// Returns the client for the url and whether it was already cached
    pub async fn get_or_create(&self, config: &ConnectionConfig) -> Result<(SharedClient, bool), ModbusError> {
        if let Some(client) = self.cached(&config.url) {
            return Ok((client, true));
        }

        /* no lock held while opening, a concurrent probe may open the same bus */
        let client = self.factory.connect(config).await?;
        let shared: SharedClient = Arc::new(tokio::sync::Mutex::new(client));

        let existing = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            match clients.get(&config.url) {
                Some(entry) => Some(entry.client.clone()),
                None => {
                    clients.insert(config.url.clone(), CacheEntry { client: shared.clone(), users: 0 });
                    None
                }
            }
        };

        if let Some(winner) = existing {
            /* the other prober was faster, both clients talk to the same bus */
            debug!("{} was opened concurrently, dropping the duplicate client", config.url);
            let _ = shared.lock().await.close().await;
            return Ok((winner, true));
        }

        info!("Opened connection to {}", config.url);
        return Ok((shared, false));
    }

    /// Closes and forgets a cached client, unless some meter holds a lease on it
    pub async fn remove_cached(&self, url: &str) {
        let removed = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            match clients.get(url) {
                Some(entry) if entry.users == 0 => clients.remove(url),
                Some(_) => {
                    warn!("Not removing {url}, it is still in use");
                    None
                }
                None => None,
            }
        };

        if let Some(entry) = removed {
            debug!("Closing connection to {url}");
            if let Err(e) = entry.client.lock().await.close().await {
                warn!("Closing {url} failed: {e}");
            }
        }
    }

    /// Marks the bus as used by one more meter
    pub fn acquire(&self, url: &str) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = clients.get_mut(url) {
            entry.users += 1;
        }
    }

    /// Gives back a lease taken with [`ConnectionRegistry::acquire`], the last one closes the client
    pub async fn release(&self, url: &str) {
        let removed = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            let last = match clients.get_mut(url) {
                Some(entry) => {
                    entry.users = entry.users.saturating_sub(1);
                    entry.users == 0
                }
                None => false,
            };
            if last { clients.remove(url) } else { None }
        };

        if let Some(entry) = removed {
            info!("Last meter on {url} released, closing connection");
            if let Err(e) = entry.client.lock().await.close().await {
                warn!("Closing {url} failed: {e}");
            }
        }
    }

    pub fn len(&self) -> usize {
        return self.clients.lock().unwrap_or_else(|e| e.into_inner()).len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }
}
