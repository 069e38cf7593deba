//! Event persistence with bounded retry, plus the retention prune task.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::metrics::record_persist_retry;
use crate::db::{AlertEvent, DbPool, StoreError};

/// Delays between attempts; one initial try plus one retry per entry
pub const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

/// Append-only event store
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, event: &AlertEvent) -> Result<i64, StoreError>;

    /// Delete events triggered before `cutoff`, returning how many went
    async fn prune_before(&self, cutoff: i64) -> Result<u64, StoreError>;

    /// Cheap round trip used by startup checks
    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    db: DbPool,
}

impl SqliteEventStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn insert(&self, event: &AlertEvent) -> Result<i64, StoreError> {
        Ok(event.insert(&self.db).await?)
    }

    async fn prune_before(&self, cutoff: i64) -> Result<u64, StoreError> {
        Ok(AlertEvent::prune_before(&self.db, cutoff).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1 FROM alert_events LIMIT 1")
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

/// Outcome of [`persist_with_retry`]
#[derive(Debug)]
pub enum Persisted {
    Stored(i64),
    /// Every attempt failed; the last error is kept
    Failed(StoreError),
    /// Shutdown was forced while retrying
    Aborted,
}

/// Insert with exponential backoff. `force` cuts the backoff short on shutdown.
pub async fn persist_with_retry(
    store: &dyn EventStore,
    event: &AlertEvent,
    force: &CancellationToken,
) -> Persisted {
    let mut last_error = match store.insert(event).await {
        Ok(id) => return Persisted::Stored(id),
        Err(e) => e,
    };

    for delay in RETRY_BACKOFF {
        tracing::debug!(
            fingerprint = %event.fingerprint,
            delay_ms = delay.as_millis() as u64,
            error = %last_error,
            "Event store write failed, retrying"
        );
        tokio::select! {
            _ = force.cancelled() => return Persisted::Aborted,
            _ = tokio::time::sleep(delay) => {}
        }
        record_persist_retry();
        match store.insert(event).await {
            Ok(id) => return Persisted::Stored(id),
            Err(e) => last_error = e,
        }
    }
    Persisted::Failed(last_error)
}

/// Spawn the task deleting events older than `retention_secs`
pub fn spawn_retention_task(
    store: Arc<dyn EventStore>,
    retention_secs: i64,
    interval_secs: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tracing::info!(retention_secs, interval_secs, "Starting event retention task");

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(interval_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let cutoff = chrono::Utc::now().timestamp() - retention_secs;
            match store.prune_before(cutoff).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(deleted = n, cutoff, "Pruned old alert events"),
                Err(e) => tracing::warn!(error = %e, "Failed to prune alert events"),
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Keeps events in memory; the first `fail_next` inserts fail
    #[derive(Debug, Default)]
    pub struct FakeEventStore {
        pub events: Mutex<Vec<AlertEvent>>,
        pub fail_next: AtomicUsize,
        pub attempts: AtomicUsize,
    }

    impl FakeEventStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing(times: usize) -> Self {
            let store = Self::default();
            store.fail_next.store(times, Ordering::SeqCst);
            store
        }

        pub fn stored(&self) -> Vec<AlertEvent> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl EventStore for FakeEventStore {
        async fn insert(&self, event: &AlertEvent) -> Result<i64, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            let mut events = self.events.lock();
            events.push(event.clone());
            Ok(events.len() as i64)
        }

        async fn prune_before(&self, cutoff: i64) -> Result<u64, StoreError> {
            let mut events = self.events.lock();
            let before = events.len();
            events.retain(|e| e.trigger_time >= cutoff);
            Ok((before - events.len()) as u64)
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeEventStore;
    use super::*;
    use crate::db::EventState;
    use std::sync::atomic::Ordering;

    fn event() -> AlertEvent {
        AlertEvent {
            rule_id: 1,
            rule_name: "r".into(),
            rule_period: 10,
            fingerprint: "fp".into(),
            ident: "h1".into(),
            severity: 2,
            state: EventState::Alerting,
            trigger_time: 100,
            trigger_value: 1.0,
            labels: Default::default(),
            resource_tags: Default::default(),
            recipients: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let store = FakeEventStore::failing(2);
        let started = tokio::time::Instant::now();
        let result = persist_with_retry(&store, &event(), &CancellationToken::new()).await;
        assert!(matches!(result, Persisted::Stored(_)));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let store = FakeEventStore::failing(10);
        let result = persist_with_retry(&store, &event(), &CancellationToken::new()).await;
        assert!(matches!(result, Persisted::Failed(_)));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 4);
        assert!(store.stored().is_empty());
    }

    #[tokio::test]
    async fn test_forced_shutdown_aborts_backoff() {
        let store = FakeEventStore::failing(10);
        let force = CancellationToken::new();
        force.cancel();
        let result = persist_with_retry(&store, &event(), &force).await;
        assert!(matches!(result, Persisted::Aborted));
    }

    #[tokio::test]
    async fn test_sqlite_event_store() {
        let pool = crate::db::connect("sqlite::memory:", 1).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let store = SqliteEventStore::new(pool);
        store.ping().await.unwrap();
        assert!(store.insert(&event()).await.unwrap() > 0);
        assert_eq!(store.prune_before(200).await.unwrap(), 1);
    }
}
