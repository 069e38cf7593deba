pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod datasource;
pub mod db;
pub mod engine;
pub mod pipeline;
pub mod startup;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::cache::Caches;
use crate::datasource::Registry;
use crate::engine::{AlertStateStore, HealthRegistry, PushHook};
use crate::pipeline::PipelineHandle;

/// Handles shared by the engine and the HTTP surface, built once at startup
pub struct CoreState {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub caches: Arc<Caches>,
    pub pipeline: PipelineHandle,
    pub states: Arc<AlertStateStore>,
    pub health: Arc<HealthRegistry>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl CoreState {
    pub fn new(
        config: Config,
        registry: Arc<Registry>,
        caches: Arc<Caches>,
        pipeline: PipelineHandle,
        states: Arc<AlertStateStore>,
    ) -> Self {
        Self {
            config,
            registry,
            caches,
            pipeline,
            states,
            health: Arc::new(HealthRegistry::new()),
            metrics_handle: None,
        }
    }

    /// Entry point for PUSH rules. The server has no ingest route; an embedder
    /// feeding points from its own transport calls `ingest` on this hook, which
    /// shares the rule cache, alert state and pipeline with the scheduler.
    pub fn push_hook(&self) -> PushHook {
        PushHook::new(self.caches.rules.clone(), self.states.clone(), self.pipeline.clone())
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_rule, EventState, RuleType, TableStat};
    use crate::engine::{AlertStatus, MetricPoint};

    #[test]
    fn test_push_hook_shares_engine_state() {
        let registry = Arc::new(Registry::with_builtin());
        let caches = Arc::new(Caches::new(registry.clone(), None));
        let mut rule = test_rule(1, "cpu_usage > 90", 10);
        rule.rule_type = RuleType::Push;
        rule.config.predicate = Some("$current > 90".into());
        let index = caches.rules.index(vec![rule]);
        caches.rules.set_all(index, TableStat::default(), 1);

        let (handle, mut rx) = pipeline::channel(10, 0.8);
        let state = CoreState::new(
            Config::default(),
            registry,
            caches,
            handle,
            Arc::new(AlertStateStore::new()),
        );

        let point = MetricPoint {
            ident: "h1".into(),
            metric: "cpu_usage".into(),
            tags: Default::default(),
            time: 1000,
            value: 95.0,
        };
        let outcome = state.push_hook().ingest(vec![point], 1000);
        assert_eq!(outcome.events, 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.state, EventState::Alerting);
        // the scheduler's store sees the alert raised through the hook
        assert_eq!(state.states.status(1, &event.fingerprint), Some(AlertStatus::Alerting));
    }
}
