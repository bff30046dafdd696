use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use serde::Serialize;

use crate::config::Config;

/// One upstream endpoint plus its health and load counters.
///
/// Identity is the endpoint string; two backends configured with the same
/// `host:port` compare equal even though their counters are independent.
#[derive(Debug)]
pub struct Backend {
    endpoint: String,
    healthy: AtomicBool,
    open_connections: AtomicUsize,
}

impl Backend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            healthy: AtomicBool::new(true),
            open_connections: AtomicUsize::new(0),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Stores the new health flag and returns the previous one.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::Relaxed)
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn set_open_connections(&self, count: usize) {
        self.open_connections.store(count, Ordering::Relaxed);
    }

    fn acquire(&self) {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) {
        // saturating: never wraps below zero
        let _ = self
            .open_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Eq for Backend {}

/// Counts one open connection on a backend for as long as it is alive.
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    pub fn new(backend: Arc<Backend>) -> Self {
        backend.acquire();
        Self { backend }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.release();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub key: String,
    pub endpoint: String,
    pub healthy: bool,
    pub open_connections: usize,
}

/// Routing key → ordered backends, in configuration order (hosts, then paths).
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<(String, Vec<Arc<Backend>>)>,
}

impl Registry {
    pub fn build(config: &Config) -> Self {
        let mut registry = Self::default();

        let hosts = config
            .hosts
            .iter()
            .map(|entry| (entry.host.as_str(), &entry.servers));
        let paths = config
            .paths
            .iter()
            .map(|entry| (entry.path.as_str(), &entry.servers));

        for (key, servers) in hosts.chain(paths) {
            log::info!("Registering {} backend(s) for '{key}'", servers.len());
            registry.insert(key, servers.iter().map(|s| Backend::new(s.as_str())));
        }

        registry
    }

    /// Inserts a key, replacing the backends of an existing key in place.
    pub fn insert<I>(&mut self, key: &str, backends: I)
    where
        I: IntoIterator<Item = Backend>,
    {
        let backends: Vec<Arc<Backend>> = backends.into_iter().map(Arc::new).collect();

        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => {
                log::warn!("Routing key '{key}' configured more than once, keeping the last one");
                *existing = backends;
            }
            None => self.entries.push((key.to_string(), backends)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[Arc<Backend>]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, backends)| backends.as_slice())
    }

    /// The healthy sublist of `key`, preserving configuration order.
    pub fn healthy(&self, key: &str) -> Vec<Arc<Backend>> {
        self.get(key)
            .map(|backends| {
                backends
                    .iter()
                    .filter(|b| b.is_healthy())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Every backend reachable from every key.
    pub fn backends(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.entries.iter().flat_map(|(_, backends)| backends.iter())
    }

    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        self.entries
            .iter()
            .flat_map(|(key, backends)| {
                backends.iter().map(move |b| BackendSnapshot {
                    key: key.clone(),
                    endpoint: b.endpoint().to_string(),
                    healthy: b.is_healthy(),
                    open_connections: b.open_connections(),
                })
            })
            .collect()
    }
}
