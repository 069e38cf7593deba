//! Downstream event sinks and the drop-oldest forward queue in front of them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::metrics::record_event_dropped;
use crate::db::AlertEvent;

/// Receiver of persisted events (notification delivery lives behind this)
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, event: &AlertEvent) -> anyhow::Result<()>;
}

/// Writes every event to the log
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, event: &AlertEvent) -> anyhow::Result<()> {
        tracing::info!(
            rule_id = event.rule_id,
            rule_name = %event.rule_name,
            ident = %event.ident,
            state = %event.state,
            value = event.trigger_value,
            recipients = ?event.recipients,
            "Alert event"
        );
        Ok(())
    }
}

/// Bounded queue that never blocks the producer; when full the oldest event goes
#[derive(Debug)]
pub struct ForwardQueue {
    events: Mutex<VecDeque<AlertEvent>>,
    capacity: usize,
    notify: Notify,
}

impl ForwardQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue, returning the evicted event if the queue was full
    pub fn push(&self, event: AlertEvent) -> Option<AlertEvent> {
        let evicted = {
            let mut events = self.events.lock();
            let evicted = if events.len() >= self.capacity {
                events.pop_front()
            } else {
                None
            };
            events.push_back(event);
            evicted
        };
        if evicted.is_some() {
            record_event_dropped("forward_overflow");
        }
        self.notify.notify_one();
        evicted
    }

    pub fn pop(&self) -> Option<AlertEvent> {
        self.events.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn deliver(sinks: &[Arc<dyn EventSink>], event: &AlertEvent) {
    for sink in sinks {
        if let Err(e) = sink.send(event).await {
            tracing::warn!(
                sink = sink.name(),
                fingerprint = %event.fingerprint,
                error = %e,
                "Sink rejected event"
            );
        }
    }
}

/// Spawn the task draining `queue` into `sinks`. On stop the queue is flushed once.
pub fn spawn_forwarder(
    queue: Arc<ForwardQueue>,
    sinks: Vec<Arc<dyn EventSink>>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            while let Some(event) = queue.pop() {
                deliver(&sinks, &event).await;
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = queue.notify.notified() => {}
            }
        }
        while let Some(event) = queue.pop() {
            deliver(&sinks, &event).await;
        }
        tracing::debug!("Event forwarder stopped");
    })
}


#[cfg(test)]
mod tests {
    use super::testing::CollectSink;
    use super::*;
    use crate::db::EventState;

    fn event(fp: &str) -> AlertEvent {
        AlertEvent {
            rule_id: 1,
            rule_name: "r".into(),
            rule_period: 10,
            fingerprint: fp.into(),
            ident: "h1".into(),
            severity: 2,
            state: EventState::Alerting,
            trigger_time: 0,
            trigger_value: 1.0,
            labels: Default::default(),
            resource_tags: Default::default(),
            recipients: vec![],
        }
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let queue = ForwardQueue::new(2);
        assert!(queue.push(event("a")).is_none());
        assert!(queue.push(event("b")).is_none());
        let evicted = queue.push(event("c")).unwrap();
        assert_eq!(evicted.fingerprint, "a");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().fingerprint, "b");
    }

    #[tokio::test]
    async fn test_forwarder_flushes_on_stop() {
        let queue = Arc::new(ForwardQueue::new(10));
        let sink = Arc::new(CollectSink::default());
        let stop = CancellationToken::new();
        let handle = spawn_forwarder(queue.clone(), vec![sink.clone() as Arc<dyn EventSink>], stop.clone());

        queue.push(event("a"));
        queue.push(event("b"));
        stop.cancel();
        handle.await.unwrap();

        let fps: Vec<String> = sink.received().into_iter().map(|e| e.fingerprint).collect();
        assert_eq!(fps, vec!["a", "b"]);
        assert!(queue.is_empty());
    }
}
