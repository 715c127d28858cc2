//! Batched geo data lookups
//!
//! This module provides the `LookupBatcher`, which resolves many IPs against
//! one geo data index:
//! - Duplicate IPs are fetched once
//! - Distinct IPs are split into bundles of bounded size
//! - At most `max_concurrent_searches` bundles are in flight at a time
//! - The first failing bundle stops dispatch and fails the whole lookup
//!
//! # Example
//!
//! ```rust,ignore
//! use ip2geo::lens::lookup::{BatchLookupArgs, LookupBatcher};
//!
//! let batcher = LookupBatcher::new(Arc::new(db.geo_data()));
//! let args = BatchLookupArgs::new("geo-v3")
//!     .with_max_bundle_size(100)
//!     .with_max_concurrent_searches(4);
//!
//! let results = batcher.lookup(&args, ips).await?;
//! ```

use crate::config::BatchSettings;
use crate::database::{GeoData, GeoDataStore};
use anyhow::{anyhow, Result};
use futures::{stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Args
// =============================================================================

/// Arguments for a batched lookup
#[derive(Debug, Clone)]
pub struct BatchLookupArgs {
    /// Geo data index to query
    pub index_name: String,
    /// Maximum distinct IPs per bundle
    pub max_bundle_size: usize,
    /// Maximum bundles in flight
    pub max_concurrent_searches: usize,
}

impl BatchLookupArgs {
    pub fn new(index_name: impl Into<String>) -> Self {
        Self::with_settings(index_name, BatchSettings::default())
    }

    pub fn with_settings(index_name: impl Into<String>, settings: BatchSettings) -> Self {
        Self {
            index_name: index_name.into(),
            max_bundle_size: settings.max_bundle_size,
            max_concurrent_searches: settings.max_concurrent_searches,
        }
    }

    pub fn with_max_bundle_size(mut self, max_bundle_size: usize) -> Self {
        self.max_bundle_size = max_bundle_size;
        self
    }

    pub fn with_max_concurrent_searches(mut self, max_concurrent_searches: usize) -> Self {
        self.max_concurrent_searches = max_concurrent_searches;
        self
    }
}

// =============================================================================
// Lens
// =============================================================================

/// Concurrency-bounded bundle lookups against a geo data store
#[derive(Clone)]
pub struct LookupBatcher {
    store: Arc<dyn GeoDataStore>,
}

impl LookupBatcher {
    pub fn new(store: Arc<dyn GeoDataStore>) -> Self {
        Self { store }
    }

    /// Resolve every IP in `ips`
    ///
    /// On success the returned map has exactly one entry per distinct IP,
    /// empty when the IP has no match. A failed bundle fails the lookup:
    /// bundles not yet dispatched are dropped, while bundles already in
    /// flight run to completion and their results are discarded.
    pub async fn lookup<I>(&self, args: &BatchLookupArgs, ips: I) -> Result<HashMap<String, GeoData>>
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: Send,
    {
        let max_concurrent = args.max_concurrent_searches.max(1);
        let bundles = Bundles::new(ips.into_iter(), args.max_bundle_size);

        let mut fetches = stream::iter(bundles)
            .map(|bundle| {
                let store = self.store.clone();
                let index_name = args.index_name.clone();
                debug!(index = %index_name, size = bundle.len(), "Dispatching lookup bundle");
                tokio::spawn(async move {
                    let found = store.fetch_bundle(&index_name, bundle.clone()).await;
                    (bundle, found)
                })
            })
            .buffer_unordered(max_concurrent);

        let mut results: HashMap<String, GeoData> = HashMap::new();
        while let Some(joined) = fetches.next().await {
            let (bundle, found) = joined.map_err(|e| anyhow!("Lookup bundle task failed: {}", e))?;
            let mut found = match found {
                Ok(found) => found,
                Err(e) => {
                    debug!(index = %args.index_name, error = %e, "Lookup bundle failed");
                    return Err(e);
                }
            };

            debug!(
                index = %args.index_name,
                size = bundle.len(),
                matched = found.len(),
                "Lookup bundle completed"
            );
            for ip in bundle {
                let data = found.remove(&ip).unwrap_or_default();
                results.insert(ip, data);
            }
        }

        Ok(results)
    }
}

/// Lazily deduplicated bundles of IPs
struct Bundles<I> {
    ips: I,
    seen: HashSet<String>,
    max_bundle_size: usize,
}

impl<I> Bundles<I> {
    fn new(ips: I, max_bundle_size: usize) -> Self {
        Self {
            ips,
            seen: HashSet::new(),
            max_bundle_size: max_bundle_size.max(1),
        }
    }
}

impl<I: Iterator<Item = String>> Iterator for Bundles<I> {
    type Item = Vec<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut bundle = Vec::new();
        for ip in self.ips.by_ref() {
            if self.seen.insert(ip.clone()) {
                bundle.push(ip);
                if bundle.len() >= self.max_bundle_size {
                    break;
                }
            }
        }
        (!bundle.is_empty()).then_some(bundle)
    }
}

// =============================================================================
// Tests
// =============================================================================
