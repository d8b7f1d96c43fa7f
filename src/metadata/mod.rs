//! Short-lived cache for owner, category and centroid-list lookups.
//!
//! Each lookup kind has its own [`TtlCache`] and lock, and the background
//! sweeper visits them one at a time.

mod ttl;

pub use ttl::{CacheEntry, TtlCache};

use crate::vector::QuantizedVector;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors returned by metadata loaders.
///
/// Cloneable so one failed load can be handed to every waiting caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Metadata not found: {0}")]
    NotFound(String),

    #[error("Metadata loader failed: {0}\nSuggestion: Check the backing store and retry")]
    Loader(String),
}

/// A document owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: u64,
    pub name: String,
}

/// A named document category belonging to one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: u64,
    pub owner_id: u64,
    pub name: String,
}

/// A centroid registered for a category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryCentroid {
    pub id: u64,
    pub category_id: u64,
    pub vector: QuantizedVector,
}

/// TTL and sweep cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetadataConfig {
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5_000,
            sweep_interval_ms: 15_000,
        }
    }
}

impl MetadataConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Entries removed by one sweep, per map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub owners: usize,
    pub categories: usize,
    pub centroids: usize,
}

impl SweepStats {
    #[must_use]
    pub fn total(&self) -> usize {
        self.owners + self.categories + self.centroids
    }
}

#[derive(Debug)]
pub struct MetadataCache {
    owners: TtlCache<Owner>,
    categories: TtlCache<Category>,
    centroids: TtlCache<Vec<CategoryCentroid>>,
}

impl MetadataCache {
    #[must_use]
    pub fn new(config: &MetadataConfig) -> Self {
        Self::with_ttls(config.ttl(), config.ttl(), config.ttl())
    }

    /// Separate TTLs for the owner, category and centroid maps.
    #[must_use]
    pub fn with_ttls(owners: Duration, categories: Duration, centroids: Duration) -> Self {
        Self {
            owners: TtlCache::new(owners),
            categories: TtlCache::new(categories),
            centroids: TtlCache::new(centroids),
        }
    }

    pub async fn fetch_owner<F, Fut>(&self, name: &str, loader: F) -> Result<Owner, MetadataError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Owner, MetadataError>>,
    {
        self.owners.fetch(name, loader).await
    }

    pub async fn fetch_category<F, Fut>(
        &self,
        owner_id: u64,
        name: &str,
        loader: F,
    ) -> Result<Category, MetadataError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Category, MetadataError>>,
    {
        self.categories
            .fetch(&format!("{owner_id}:{name}"), loader)
            .await
    }

    pub async fn fetch_centroids<F, Fut>(
        &self,
        category_id: u64,
        loader: F,
    ) -> Result<Vec<CategoryCentroid>, MetadataError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<CategoryCentroid>, MetadataError>>,
    {
        self.centroids
            .fetch(&category_id.to_string(), loader)
            .await
    }

    #[must_use]
    pub fn owners(&self) -> &TtlCache<Owner> {
        &self.owners
    }

    #[must_use]
    pub fn categories(&self) -> &TtlCache<Category> {
        &self.categories
    }

    #[must_use]
    pub fn centroids(&self) -> &TtlCache<Vec<CategoryCentroid>> {
        &self.centroids
    }

    /// Sweeps each map under its own lock.
    pub fn sweep_expired(&self) -> SweepStats {
        SweepStats {
            owners: self.owners.sweep_expired(),
            categories: self.categories.sweep_expired(),
            centroids: self.centroids.sweep_expired(),
        }
    }

    /// Starts a task that sweeps every `interval` until `cancel` fires or
    /// the cache is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else {
                            break;
                        };
                        let stats = cache.sweep_expired();
                        if stats.total() > 0 {
                            debug!(
                                owners = stats.owners,
                                categories = stats.categories,
                                centroids = stats.centroids,
                                "swept expired metadata"
                            );
                        }
                    }
                }
            }
            debug!("metadata sweeper stopped");
        })
    }
}
