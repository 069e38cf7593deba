//! Process-wide caches refreshed from the rule store.
//!
//! Each cache publishes an immutable snapshot through a [`CacheCell`]. Readers
//! take one atomic load; a refresh builds a complete new snapshot off to the
//! side and swaps it in, so a reader never observes a half-built index.
//!
//! Refresh algorithm, per cache and per tick:
//! - read `max(update_at)` and `count(*)` of the backing tables
//! - skip when both match the published snapshot and the full-sync ceiling
//!   has not elapsed
//! - otherwise load every row, rebuild the indices and swap
//!
//! A failed refresh keeps the previous snapshot.

pub mod datasources;
pub mod mutes;
pub mod resources;
pub mod rules;
pub mod store;
pub mod users;

pub use datasources::{DatasourceCache, DatasourceEntry};
pub use mutes::MuteCache;
pub use resources::ResourceCache;
pub use rules::{RuleCache, INVALID_METRIC};
pub use store::{CacheKind, RuleStore, SqliteRuleStore};
pub use users::UserCache;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::metrics::record_cache_refresh;
use crate::config::CacheConfig;
use crate::crypto::CryptoKey;
use crate::datasource::Registry;
use crate::db::TableStat;

/// One published version of a cache
#[derive(Debug, Default)]
pub struct Snapshot<T> {
    pub data: T,
    pub stat: TableStat,
    /// Unix seconds of the full load that produced this snapshot; 0 before the first load
    pub synced_at: i64,
}

/// Read-mostly snapshot pointer
#[derive(Debug)]
pub struct CacheCell<T> {
    inner: ArcSwap<Snapshot<T>>,
}

impl<T: Default> Default for CacheCell<T> {
    fn default() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Snapshot::default()),
        }
    }
}

impl<T> CacheCell<T> {
    pub fn load(&self) -> Arc<Snapshot<T>> {
        self.inner.load_full()
    }

    /// Replace the published snapshot as a whole
    pub fn set_all(&self, data: T, stat: TableStat, synced_at: i64) {
        self.inner.store(Arc::new(Snapshot {
            data,
            stat,
            synced_at,
        }));
    }

    /// Whether a full load is due for the observed `stat`
    pub fn needs_refresh(&self, stat: TableStat, now: i64, ceiling_secs: i64) -> bool {
        let current = self.inner.load();
        current.synced_at == 0 || current.stat != stat || now - current.synced_at >= ceiling_secs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    Full,
    Skipped,
}

impl RefreshKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshKind::Full => "full",
            RefreshKind::Skipped => "skip",
        }
    }
}

/// A cache that can reload itself from the store
#[async_trait]
pub trait Refresh: Send + Sync {
    fn kind(&self) -> CacheKind;

    async fn refresh(
        &self,
        store: &dyn RuleStore,
        now: i64,
        ceiling_secs: i64,
    ) -> anyhow::Result<RefreshKind>;
}

/// All caches the engine reads
#[derive(Debug)]
pub struct Caches {
    pub rules: Arc<RuleCache>,
    pub mutes: Arc<MuteCache>,
    pub resources: Arc<ResourceCache>,
    pub users: Arc<UserCache>,
    pub datasources: Arc<DatasourceCache>,
}

impl Caches {
    pub fn new(registry: Arc<Registry>, crypto_key: Option<CryptoKey>) -> Self {
        Self {
            rules: Arc::new(RuleCache::new(registry.clone())),
            mutes: Arc::new(MuteCache::new()),
            resources: Arc::new(ResourceCache::new()),
            users: Arc::new(UserCache::new()),
            datasources: Arc::new(DatasourceCache::new(registry, crypto_key)),
        }
    }

    fn all(&self) -> Vec<Arc<dyn Refresh>> {
        vec![
            self.datasources.clone() as Arc<dyn Refresh>,
            self.rules.clone() as Arc<dyn Refresh>,
            self.mutes.clone() as Arc<dyn Refresh>,
            self.resources.clone() as Arc<dyn Refresh>,
            self.users.clone() as Arc<dyn Refresh>,
        ]
    }

    /// Load every cache once. Errors are returned so startup can decide.
    pub async fn sync_all(&self, store: &dyn RuleStore, now: i64) -> anyhow::Result<()> {
        for cache in self.all() {
            cache.refresh(store, now, 0).await?;
        }
        Ok(())
    }

    /// Spawn one refresh loop per cache
    pub fn spawn_refresh_tasks(
        &self,
        store: Arc<dyn RuleStore>,
        config: &CacheConfig,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.all()
            .into_iter()
            .map(|cache| {
                spawn_refresh_task(
                    cache,
                    store.clone(),
                    config.sync_interval_secs,
                    config.full_sync_ceiling_secs as i64,
                    cancel.clone(),
                )
            })
            .collect()
    }
}

/// Run one refresh and record its outcome
pub async fn refresh_once(cache: &dyn Refresh, store: &dyn RuleStore, ceiling_secs: i64) {
    let name = cache.kind().as_str();
    let now = chrono::Utc::now().timestamp();
    match cache.refresh(store, now, ceiling_secs).await {
        Ok(kind) => {
            record_cache_refresh(name, kind.as_str());
            if kind == RefreshKind::Full {
                tracing::debug!(cache = name, "Cache reloaded");
            }
        }
        Err(e) => {
            record_cache_refresh(name, "error");
            tracing::warn!(cache = name, error = %e, "Cache refresh failed, keeping previous snapshot");
        }
    }
}

/// Spawn the background refresh loop for one cache
pub fn spawn_refresh_task(
    cache: Arc<dyn Refresh>,
    store: Arc<dyn RuleStore>,
    interval_secs: u64,
    ceiling_secs: i64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tracing::info!(
        cache = cache.kind().as_str(),
        interval_secs,
        "Starting cache refresh task"
    );

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(interval_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            refresh_once(cache.as_ref(), store.as_ref(), ceiling_secs).await;
        }
        tracing::debug!(cache = cache.kind().as_str(), "Cache refresh task stopped");
    })
}
