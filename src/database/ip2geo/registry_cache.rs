//! In-memory registry of datasources
//!
//! Mirrors, per datasource, the serving index, the state and the expiration
//! instant. Entries are kept current by [`WriteEvent`]s from the datasource
//! repository; a lookup for an unknown name reloads every datasource from the
//! store before giving up.
//!
//! A reload never overwrites an entry written or evicted by an event that
//! arrived after the reload started reading the store.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::datasource::{Datasource, DatasourceState, DatasourceStore};
use super::events::{WriteEvent, WriteListener, WriteOutcome};

/// Cached view of one datasource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub index_name: Option<String>,
    pub state: DatasourceState,
    /// `None` when the datasource has no validity window
    pub expiration: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn from_datasource(datasource: &Datasource) -> Self {
        Self {
            index_name: datasource.current_index_name().map(str::to_string),
            state: datasource.state,
            expiration: datasource.expiration_date(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| now > expiration)
    }
}

/// Thread-safe datasource registry, refreshed by write events
pub struct DatasourceRegistryCache {
    store: Arc<dyn DatasourceStore>,
    entries: DashMap<String, CacheEntry>,
    /// Generation of the last event applied to each datasource
    written: DashMap<String, u64>,
    generation: AtomicU64,
}

impl DatasourceRegistryCache {
    pub fn new(store: Arc<dyn DatasourceStore>) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            written: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Entry for `name`, reloading every datasource on a miss
    ///
    /// `None` means the datasource is unknown even after the reload.
    pub async fn resolve(&self, name: &str) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.entries.get(name) {
            return Ok(Some(entry.value().clone()));
        }

        debug!(datasource = name, "Registry cache miss");
        self.reload().await?;

        Ok(self.entries.get(name).map(|entry| entry.value().clone()))
    }

    /// Load every datasource from the store into the cache
    ///
    /// Returns the number of datasources loaded. Datasources touched by an
    /// event while the store was being read keep the event's view.
    pub async fn reload(&self) -> Result<usize> {
        let started = self.generation.load(Ordering::SeqCst);
        let datasources = self.store.get_all_datasources().await?;

        let mut loaded = 0;
        for datasource in &datasources {
            // holding the shard lock orders this check against `on_write`
            let slot = self.entries.entry(datasource.name.clone());
            if self.written_since(&datasource.name, started) {
                debug!(datasource = %datasource.name, "Keeping entry from newer write event");
                continue;
            }
            slot.insert(CacheEntry::from_datasource(datasource));
            loaded += 1;
        }

        info!(count = loaded, "Reloaded datasource registry cache");
        Ok(loaded)
    }

    fn written_since(&self, name: &str, generation: u64) -> bool {
        self.written
            .get(name)
            .is_some_and(|written| *written.value() > generation)
    }

    fn mark_written(&self, name: &str) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.written.insert(name.to_string(), generation);
    }

    pub async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.resolve(name).await?.is_some())
    }

    /// Whether the datasource's data is stale; unknown datasources count as expired
    pub async fn is_expired(&self, name: &str) -> Result<bool> {
        Ok(self
            .resolve(name)
            .await?
            .map_or(true, |entry| entry.is_expired()))
    }

    /// Serving index of the datasource
    pub async fn index_name(&self, name: &str) -> Result<Option<String>> {
        Ok(self.resolve(name).await?.and_then(|entry| entry.index_name))
    }

    pub async fn state(&self, name: &str) -> Result<Option<DatasourceState>> {
        Ok(self.resolve(name).await?.map(|entry| entry.state))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl WriteListener for DatasourceRegistryCache {
    fn on_write(&self, event: &WriteEvent) {
        if event.outcome() == WriteOutcome::Failure {
            debug!(datasource = event.id(), "Ignoring failed datasource write");
            return;
        }

        self.mark_written(event.id());
        match event {
            WriteEvent::Indexed { id, body, .. } => match Datasource::from_json(body) {
                Ok(datasource) => {
                    debug!(
                        datasource = %datasource.name,
                        state = %datasource.state,
                        index = ?datasource.current_index,
                        "Updating registry cache entry"
                    );
                    self.entries
                        .insert(datasource.name.clone(), CacheEntry::from_datasource(&datasource));
                }
                Err(e) => {
                    // the next miss reloads from the store
                    warn!(datasource = %id, error = %e, "Unparseable datasource record, evicting");
                    self.entries.remove(id);
                }
            },
            WriteEvent::Deleted { id, .. } => {
                debug!(datasource = %id, "Removing registry cache entry");
                self.entries.remove(id);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
