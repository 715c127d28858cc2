//! Datasource lock lens
//!
//! This module provides the `Ip2GeoLockService` used by the refresh job to
//! guard a datasource while rebuilding it. Locks are keyed by datasource name.
//!
//! # Example
//!
//! ```rust,ignore
//! use ip2geo::lens::lock::Ip2GeoLockService;
//!
//! let service = Ip2GeoLockService::new(Arc::new(db.locks()), Handle::current());
//! if let Some(lock) = service.acquire_lock("geo", config.lock_duration_secs).await? {
//!     // ... long rebuild, from a blocking thread:
//!     let lock = service.renew_lock(&lock, config.timeout());
//!     // ...
//! }
//! ```

use crate::database::{LockBackend, LockModel};
use anyhow::Result;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Lock operations on datasources
pub struct Ip2GeoLockService {
    backend: Arc<dyn LockBackend>,
    runtime: Handle,
}

impl Ip2GeoLockService {
    /// `runtime` drives the backend calls made by [`Self::renew_lock`]
    pub fn new(backend: Arc<dyn LockBackend>, runtime: Handle) -> Self {
        Self { backend, runtime }
    }

    /// Lock `datasource` for `lock_duration_secs`; `None` if already held
    pub async fn acquire_lock(
        &self,
        datasource: &str,
        lock_duration_secs: u64,
    ) -> Result<Option<LockModel>> {
        let lock = self.backend.acquire(datasource, lock_duration_secs).await?;
        match &lock {
            Some(lock) => info!(
                datasource,
                lock_id = %lock.lock_id,
                duration_secs = lock_duration_secs,
                "Acquired datasource lock"
            ),
            None => debug!(datasource, "Datasource lock is held elsewhere"),
        }
        Ok(lock)
    }

    pub async fn release_lock(&self, lock: &LockModel) -> Result<bool> {
        let released = self.backend.release(lock).await?;
        info!(
            datasource = %lock.job_id,
            lock_id = %lock.lock_id,
            released,
            "Released datasource lock"
        );
        Ok(released)
    }

    /// Renew `lock`, blocking the calling thread for at most `timeout`
    ///
    /// Returns `None` when the renewal failed or was not confirmed in time.
    /// Must not be called from a runtime worker thread.
    pub fn renew_lock(&self, lock: &LockModel, timeout: Duration) -> Option<LockModel> {
        let (tx, rx) = mpsc::channel();
        let backend = self.backend.clone();
        let pending = lock.clone();
        self.runtime.spawn(async move {
            let result = backend.renew(&pending).await;
            // the caller may have given up already
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(Ok(Some(renewed))) => {
                debug!(datasource = %renewed.job_id, lock_id = %renewed.lock_id, "Renewed datasource lock");
                Some(renewed)
            }
            Ok(Ok(None)) => {
                warn!(datasource = %lock.job_id, lock_id = %lock.lock_id, "Datasource lock no longer held");
                None
            }
            Ok(Err(e)) => {
                warn!(datasource = %lock.job_id, error = %e, "Failed to renew datasource lock");
                None
            }
            Err(_) => {
                warn!(
                    datasource = %lock.job_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Datasource lock renewal timed out"
                );
                None
            }
        }
    }
}
