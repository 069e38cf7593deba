//! One pipeline worker: dedup, mute, enrich, persist, forward.
//!
//! A worker owns every fingerprint hashed to its shard, so its dedup map is
//! never shared and a fingerprint's events are handled in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::mute::matching_mute;
use super::sink::ForwardQueue;
use super::store::{persist_with_retry, Persisted};
use super::PipelineDeps;
use crate::api::metrics::{record_event_deduped, record_event_muted};
use crate::db::{AlertEvent, EventState};

/// Dedup entries are pruned every this many events
const DEDUP_PRUNE_EVERY: u64 = 1024;

pub(super) struct Worker {
    pub(super) id: usize,
    pub(super) deps: Arc<PipelineDeps>,
    pub(super) forward: Arc<ForwardQueue>,
    /// (fingerprint, state) -> trigger time of the last accepted event
    pub(super) last_seen: HashMap<(String, EventState), i64>,
    /// Entries older than this many seconds are forgotten
    pub(super) dedup_horizon: i64,
    pub(super) processed: u64,
}

impl Worker {
    pub(super) fn new(id: usize, deps: Arc<PipelineDeps>, forward: Arc<ForwardQueue>, dedup_horizon: i64) -> Self {
        Self {
            id,
            deps,
            forward,
            last_seen: HashMap::new(),
            dedup_horizon,
            processed: 0,
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::Receiver<AlertEvent>, force: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = force.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.process(event, &force).await;
        }

        rx.close();
        let mut leftover = Vec::new();
        while let Ok(event) = rx.try_recv() {
            leftover.push(event);
        }
        if !leftover.is_empty() {
            if let Err(e) = self.deps.dead_letter.append(&leftover).await {
                tracing::error!(worker = self.id, error = %e, count = leftover.len(), "Failed to dead-letter queued events");
            }
        }
        tracing::debug!(worker = self.id, "Pipeline worker stopped");
    }

    /// Whether an event with the same fingerprint and state was accepted within one period
    fn is_duplicate(&mut self, event: &AlertEvent) -> bool {
        let key = (event.fingerprint.clone(), event.state);
        if let Some(&prev) = self.last_seen.get(&key) {
            let delta = event.trigger_time - prev;
            if (0..event.rule_period.max(1)).contains(&delta) {
                return true;
            }
        }
        self.last_seen.insert(key, event.trigger_time);

        self.processed += 1;
        if self.processed % DEDUP_PRUNE_EVERY == 0 {
            let cutoff = event.trigger_time - self.dedup_horizon;
            self.last_seen.retain(|_, at| *at >= cutoff);
        }
        false
    }

    pub(super) async fn process(&mut self, mut event: AlertEvent, force: &CancellationToken) {
        if self.is_duplicate(&event) {
            record_event_deduped();
            tracing::debug!(fingerprint = %event.fingerprint, state = %event.state, "Duplicate event dropped");
            return;
        }

        let resource_tags = self
            .deps
            .resources
            .tags_of(&event.ident)
            .map(|r| r.tags)
            .unwrap_or_default();
        // measurement labels win over resource tags
        let mut labels = resource_tags.clone();
        labels.extend(std::mem::take(&mut event.labels));

        let filters = self.deps.mutes.mute_filters_for(event.rule_id);
        if !filters.is_empty() {
            let classpaths = self.deps.resources.classpaths_of(&event.ident);
            if let Some(mute_id) =
                matching_mute(&filters, &event.ident, &classpaths, &labels, event.trigger_time)
            {
                record_event_muted();
                tracing::debug!(
                    rule_id = event.rule_id,
                    ident = %event.ident,
                    mute_id,
                    "Event muted"
                );
                return;
            }
        }

        if let Some(rule) = self.deps.rules.get_rule(event.rule_id) {
            for (k, v) in &rule.append_tags {
                labels.entry(k.clone()).or_insert_with(|| v.clone());
            }
            event.recipients = self.deps.users.recipients_for(&rule);
        }
        event.labels = labels;
        event.resource_tags = resource_tags;

        match persist_with_retry(self.deps.store.as_ref(), &event, force).await {
            Persisted::Stored(id) => {
                tracing::debug!(event_id = id, fingerprint = %event.fingerprint, state = %event.state, "Event persisted");
            }
            Persisted::Failed(e) => {
                tracing::error!(fingerprint = %event.fingerprint, error = %e, "Event persistence failed after retries");
                self.dead_letter(&event).await;
            }
            Persisted::Aborted => {
                self.dead_letter(&event).await;
            }
        }

        self.forward.push(event);
    }

    async fn dead_letter(&self, event: &AlertEvent) {
        if let Err(e) = self.deps.dead_letter.append(std::slice::from_ref(event)).await {
            tracing::error!(fingerprint = %event.fingerprint, error = %e, "Failed to write dead-letter record");
        }
    }
}
