use std::{
    fs, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use rand::{
    distributions::{Distribution, WeightedIndex},
    seq::SliceRandom,
};
use serde::{Deserialize, Serialize};

use crate::config::Algorithm;

use super::{
    backend::{Backend, Registry},
    metrics,
};

/// Persistence for the round-robin cursor.
pub trait CursorStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn save(&self, endpoint: &str);
}

#[derive(Serialize, Deserialize)]
struct CursorRecord {
    server: String,
}

/// Keeps the cursor in a small JSON file: `{"server": "<endpoint>"}`.
pub struct FileCursorStore {
    path: PathBuf,
    writes: AtomicUsize,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writes: AtomicUsize::new(0),
        }
    }

    /// Writes a sibling file and renames it over the cursor, so a reader or
    /// a crash never leaves a half-written record behind.
    fn write_atomic(&self, data: &[u8]) -> io::Result<()> {
        let seq = self.writes.fetch_add(1, Ordering::Relaxed);
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".{}.{seq}.tmp", std::process::id()));
        let tmp = PathBuf::from(tmp);

        let result = fs::write(&tmp, data).and_then(|()| fs::rename(&tmp, &self.path));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> Option<String> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("No round-robin cursor at {}", self.path.display());
                return None;
            }
            Err(e) => {
                log::warn!("Failed to read round-robin cursor {}: {e}", self.path.display());
                return None;
            }
        };

        match serde_json::from_slice::<CursorRecord>(&data) {
            Ok(record) => Some(record.server),
            Err(e) => {
                log::warn!("Ignoring malformed round-robin cursor {}: {e}", self.path.display());
                None
            }
        }
    }

    fn save(&self, endpoint: &str) {
        let record = CursorRecord {
            server: endpoint.to_string(),
        };
        let result = serde_json::to_vec(&record)
            .map_err(io::Error::from)
            .and_then(|data| self.write_atomic(&data));

        if let Err(e) = result {
            log::warn!("Failed to persist round-robin cursor {}: {e}", self.path.display());
        }
    }
}

/// The single "last selected endpoint" shared by every round-robin host.
///
/// Reads and writes are separate critical sections, so two concurrent
/// selections can observe the same cursor and pick the same backend.
#[derive(Default)]
pub struct RoundRobinState {
    cursor: Mutex<Option<String>>,
    store: Option<Box<dyn CursorStore>>,
}

impl RoundRobinState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resumes from the cursor found in `store` and writes through to it.
    pub fn with_store(store: Box<dyn CursorStore>) -> Self {
        let cursor = store.load();
        if let Some(endpoint) = &cursor {
            log::info!("Resuming round-robin after '{endpoint}'");
        }
        Self {
            cursor: Mutex::new(cursor),
            store: Some(store),
        }
    }

    pub fn load_cursor(&self) -> Option<String> {
        self.cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store_cursor(&self, endpoint: &str) {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = Some(endpoint.to_string());
        if let Some(store) = &self.store {
            store.save(endpoint);
        }
    }
}

/// Selects a healthy backend for `key`. Never falls back to unhealthy backends.
pub fn select_backend(
    registry: &Registry,
    key: &str,
    algo: Algorithm,
    weights: &[f64],
    round_robin: &RoundRobinState,
) -> Option<Arc<Backend>> {
    let healthy = registry.healthy(key);

    let selected = match algo {
        Algorithm::Random => random(&healthy),
        Algorithm::Least => least_connections(&healthy),
        Algorithm::Weight => weighted(&healthy, weights),
        Algorithm::Round => round_robin_select(&healthy, round_robin),
    };

    if let Some(backend) = &selected {
        log::debug!("{} selected {} for '{key}'", algo.as_str(), backend.endpoint());
        metrics::BACKEND_SELECTIONS
            .with_label_values(&[algo.as_str()])
            .inc();
    }

    selected
}

pub fn random(backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
    backends.choose(&mut rand::thread_rng()).cloned()
}

/// Fewest open connections; ties go to the earliest backend.
pub fn least_connections(backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
    backends
        .iter()
        .fold(None::<&Arc<Backend>>, |best, b| match best {
            Some(best) if best.open_connections() <= b.open_connections() => Some(best),
            _ => Some(b),
        })
        .cloned()
}

/// One weighted draw. Extra trailing weights are ignored; too few weights,
/// or weights that do not form a distribution, select nothing.
pub fn weighted(backends: &[Arc<Backend>], weights: &[f64]) -> Option<Arc<Backend>> {
    if backends.is_empty() || weights.len() < backends.len() {
        return None;
    }

    let dist = WeightedIndex::new(&weights[..backends.len()])
        .map_err(|e| log::debug!("Unusable weights {weights:?}: {e}"))
        .ok()?;

    backends.get(dist.sample(&mut rand::thread_rng())).cloned()
}

pub fn round_robin_select(
    backends: &[Arc<Backend>],
    state: &RoundRobinState,
) -> Option<Arc<Backend>> {
    if backends.is_empty() {
        return None;
    }

    let last = state
        .load_cursor()
        .and_then(|cursor| backends.iter().rposition(|b| b.endpoint() == cursor));

    let next = match last {
        Some(index) if index + 1 < backends.len() => index + 1,
        _ => 0,
    };

    let selected = backends[next].clone();
    state.store_cursor(selected.endpoint());
    Some(selected)
}
