//! Event pipeline: candidate events from every evaluator flow through one
//! bounded buffer into a fixed set of workers.
//!
//! Key features:
//! - Non-blocking ingress: a full buffer drops the event and counts it
//! - Soft throttle signal once the buffer passes the configured fill ratio
//! - Fingerprints are sharded by hash so each keeps its order
//! - Per worker: dedup, mute, enrich, persist with retry, forward
//! - Shutdown drains within a grace period, then dead-letters what is left

mod dead_letter;
mod mute;
mod sink;
mod store;
mod worker;

pub use dead_letter::DeadLetterLog;
pub use mute::matching_mute;
pub use sink::{spawn_forwarder, EventSink, ForwardQueue, LogSink};
pub use store::{persist_with_retry, spawn_retention_task, EventStore, Persisted, SqliteEventStore, RETRY_BACKOFF};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::metrics::{record_event_dropped, record_event_emitted};
use crate::cache::{Caches, MuteCache, ResourceCache, RuleCache, UserCache};
use crate::config::PipelineConfig;
use crate::db::AlertEvent;

use worker::Worker;

/// How long a forced shutdown waits for workers to dead-letter their queues
const FORCE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Producer side of the pipeline, cloned into every evaluator
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<AlertEvent>,
    capacity: usize,
    throttle_ratio: f64,
}

/// Create the primary buffer
pub fn channel(capacity: usize, throttle_ratio: f64) -> (PipelineHandle, mpsc::Receiver<AlertEvent>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        PipelineHandle {
            tx,
            capacity,
            throttle_ratio,
        },
        rx,
    )
}

impl PipelineHandle {
    /// Enqueue without waiting. Returns false when the event was dropped.
    pub fn submit(&self, event: AlertEvent) -> bool {
        let state = event.state.as_str();
        match self.tx.try_send(event) {
            Ok(()) => {
                record_event_emitted(state);
                true
            }
            Err(TrySendError::Full(event)) => {
                record_event_dropped("full");
                tracing::warn!(
                    rule_id = event.rule_id,
                    fingerprint = %event.fingerprint,
                    "Event buffer full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                record_event_dropped("closed");
                false
            }
        }
    }

    /// Share of the buffer currently occupied, 0.0 to 1.0
    pub fn fill_ratio(&self) -> f64 {
        let used = self.capacity.saturating_sub(self.tx.capacity());
        used as f64 / self.capacity as f64
    }

    /// Evaluators skip comparison queries while this holds
    pub fn is_throttled(&self) -> bool {
        self.fill_ratio() >= self.throttle_ratio
    }
}

/// What the workers read and write
pub struct PipelineDeps {
    pub rules: Arc<RuleCache>,
    pub mutes: Arc<MuteCache>,
    pub resources: Arc<ResourceCache>,
    pub users: Arc<UserCache>,
    pub store: Arc<dyn EventStore>,
    pub dead_letter: Arc<DeadLetterLog>,
    pub sinks: Vec<Arc<dyn EventSink>>,
}

impl PipelineDeps {
    pub fn new(
        caches: &Caches,
        store: Arc<dyn EventStore>,
        dead_letter: Arc<DeadLetterLog>,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            rules: caches.rules.clone(),
            mutes: caches.mutes.clone(),
            resources: caches.resources.clone(),
            users: caches.users.clone(),
            store,
            dead_letter,
            sinks,
        }
    }
}

/// Worker index owning `fingerprint`
pub fn shard_of(fingerprint: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    fingerprint.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Running pipeline tasks
pub struct Pipeline {
    stop: CancellationToken,
    force: CancellationToken,
    forward_stop: CancellationToken,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    forwarder: JoinHandle<()>,
}

impl Pipeline {
    /// Spawn the dispatcher, the workers and the forwarder
    pub fn start(config: &PipelineConfig, deps: PipelineDeps) -> (PipelineHandle, Pipeline) {
        let (handle, rx) = channel(config.buffer_size, config.throttle_ratio);
        let workers_n = config.workers.max(1);
        let shard_capacity = (config.buffer_size / workers_n).max(1);

        let stop = CancellationToken::new();
        let force = CancellationToken::new();
        let forward_stop = CancellationToken::new();

        let forward = Arc::new(ForwardQueue::new(config.forward_buffer));
        let forwarder = spawn_forwarder(forward.clone(), deps.sinks.clone(), forward_stop.clone());

        let deps = Arc::new(deps);
        let mut shards = Vec::with_capacity(workers_n);
        let mut workers = Vec::with_capacity(workers_n);
        for id in 0..workers_n {
            let (tx, rx) = mpsc::channel(shard_capacity);
            shards.push(tx);
            let worker = Worker::new(id, deps.clone(), forward.clone(), config.retention_secs.max(1));
            workers.push(tokio::spawn(worker.run(rx, force.clone())));
        }

        let dispatcher = tokio::spawn(dispatch(rx, shards, stop.clone(), force.clone(), deps.clone()));

        tracing::info!(
            buffer_size = config.buffer_size,
            workers = workers_n,
            forward_buffer = config.forward_buffer,
            "Event pipeline started"
        );

        (
            handle,
            Pipeline {
                stop,
                force,
                forward_stop,
                dispatcher,
                workers,
                forwarder,
            },
        )
    }

    /// Drain buffered events within `grace`; afterwards dead-letter the rest
    pub async fn shutdown(self, grace: Duration) {
        self.shutdown_by(Instant::now() + grace).await
    }

    /// Drain buffered events until `deadline`; afterwards dead-letter the rest
    pub async fn shutdown_by(self, deadline: Instant) {
        self.stop.cancel();

        let mut tasks: Vec<JoinHandle<()>> = std::iter::once(self.dispatcher).chain(self.workers).collect();
        let drained = tokio::time::timeout_at(deadline, futures::future::join_all(tasks.iter_mut()))
            .await
            .is_ok();

        if !drained {
            tracing::warn!("Pipeline drain exceeded its deadline, dead-lettering in-flight events");
            self.force.cancel();
            let pending = tasks.iter_mut().filter(|t| !t.is_finished());
            if tokio::time::timeout(FORCE_FLUSH_TIMEOUT, futures::future::join_all(pending))
                .await
                .is_err()
            {
                for task in &tasks {
                    task.abort();
                }
            }
        }

        self.forward_stop.cancel();
        if tokio::time::timeout(FORCE_FLUSH_TIMEOUT, self.forwarder).await.is_err() {
            tracing::warn!("Event forwarder did not finish flushing");
        }
        tracing::info!("Event pipeline stopped");
    }
}

/// Route buffered events to their shard until stopped, then hand the rest over
async fn dispatch(
    mut rx: mpsc::Receiver<AlertEvent>,
    shards: Vec<mpsc::Sender<AlertEvent>>,
    stop: CancellationToken,
    force: CancellationToken,
    deps: Arc<PipelineDeps>,
) {
    let mut stranded = Vec::new();

    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if let Err(event) = route(&shards, event, &force).await {
            stranded.push(event);
            break;
        }
    }

    rx.close();
    while let Some(event) = rx.recv().await {
        if !stranded.is_empty() {
            stranded.push(event);
            continue;
        }
        if let Err(event) = route(&shards, event, &force).await {
            stranded.push(event);
        }
    }
    drop(shards);

    if !stranded.is_empty() {
        if let Err(e) = deps.dead_letter.append(&stranded).await {
            tracing::error!(error = %e, count = stranded.len(), "Failed to dead-letter stranded events");
        }
    }
}

async fn route(
    shards: &[mpsc::Sender<AlertEvent>],
    event: AlertEvent,
    force: &CancellationToken,
) -> Result<(), AlertEvent> {
    let shard = &shards[shard_of(&event.fingerprint, shards.len())];
    tokio::select! {
        biased;
        _ = force.cancelled() => Err(event),
        permit = shard.reserve() => match permit {
            Ok(permit) => {
                permit.send(event);
                Ok(())
            }
            Err(_) => Err(event),
        },
    }
}
