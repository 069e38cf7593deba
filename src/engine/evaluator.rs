//! One evaluation tick of one rule.
//!
//! Key features:
//! - Primary query through the rule's datasource, timeout bounded by the period
//! - Sequential comparison queries within half a period, skipped under backpressure
//! - Out-of-window samples dropped before down-sampling and aggregation
//! - Client-side predicate over `$current` and the comparison names
//! - State transitions turned into pipeline events; failures go to rule health

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::expr::{Expr, ExprError};
use super::health::HealthRegistry;
use super::point::{MAX_FUTURE_SECS, MAX_PAST_SECS};
use super::reduce::{aggregate, downsample, Reduced};
use super::state::{fingerprint, AlertStateStore, StatePolicy, Sweep, Transition, Trigger};
use crate::api::metrics::{
    record_comparison_query, record_comparisons_skipped, record_point_rejected, record_query_duration,
    record_rule_eval, record_rule_eval_error,
};
use crate::cache::DatasourceCache;
use crate::datasource::{DataResp, Datasource, DatasourceError, Labels, QueryParam};
use crate::db::{AlertEvent, AlertRule};
use crate::pipeline::PipelineHandle;

/// Label read first when resolving a series' ident
pub const IDENT_LABEL: &str = "ident";

/// Variable bound to the primary query's value in predicates
pub const CURRENT_VAR: &str = "current";

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("datasource {0} not found or disabled")]
    DatasourceMissing(i64),

    #[error("datasource {id} is {actual}, rule expects {expected}")]
    DatasourceMismatch {
        id: i64,
        expected: String,
        actual: String,
    },

    #[error("query failed: {0}")]
    Query(#[from] DatasourceError),

    #[error("predicate: {0}")]
    Predicate(#[from] ExprError),

    #[error("evaluation cancelled")]
    Cancelled,
}

impl EvalError {
    pub fn stage(&self) -> &'static str {
        match self {
            EvalError::DatasourceMissing(_) | EvalError::DatasourceMismatch { .. } => "datasource",
            EvalError::Query(_) => "query",
            EvalError::Predicate(_) => "predicate",
            EvalError::Cancelled => "cancelled",
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalOutcome {
    pub series: usize,
    pub triggered: usize,
    pub events: usize,
    pub comparisons_issued: usize,
    pub comparisons_skipped: usize,
}

/// A reduced value with its label set
#[derive(Debug, Clone, PartialEq)]
struct Reading {
    labels: Labels,
    value: f64,
}

impl From<Reduced> for Reading {
    fn from(r: Reduced) -> Self {
        Reading {
            labels: r.labels,
            value: r.value,
        }
    }
}

/// Resolve the ident of a series: the `ident` label, else the rule's configured label.
/// Returns the ident and the label it came from.
pub fn resolve_ident<'a>(labels: &Labels, configured: Option<&'a str>) -> (String, &'a str) {
    if let Some(ident) = labels.get(IDENT_LABEL) {
        return (ident.clone(), IDENT_LABEL);
    }
    if let Some(label) = configured.filter(|l| !l.is_empty()) {
        if let Some(ident) = labels.get(label) {
            return (ident.clone(), label);
        }
    }
    (String::new(), IDENT_LABEL)
}

/// Whether a pulled sample lies inside the acceptance window of a query over `[start, end]`
pub fn sample_in_range(timestamp: i64, start: i64, end: i64) -> bool {
    timestamp <= end + MAX_FUTURE_SECS && timestamp >= start.min(end - MAX_PAST_SECS)
}

/// Drop out-of-window samples, counting each one
fn filter_window(mut series: Vec<DataResp>, start: i64, end: i64) -> Vec<DataResp> {
    for s in &mut series {
        let before = s.values.len();
        s.values.retain(|p| sample_in_range(p.timestamp, start, end));
        for _ in s.values.len()..before {
            record_point_rejected("time_window");
        }
    }
    series
}

fn reduce(rule: &AlertRule, series: &[DataResp]) -> Vec<Reduced> {
    let reduced = downsample(series, rule.config.downsample);
    match &rule.config.aggregation {
        Some(agg) => aggregate(&reduced, &agg.group_key, agg.func),
        None => reduced,
    }
}

/// Value of the comparison series matching `labels`; a lone series matches anything
fn matching_value(candidates: &[Reduced], labels: &Labels) -> f64 {
    if let [only] = candidates {
        return only.value;
    }
    candidates
        .iter()
        .find(|c| &c.labels == labels)
        .map(|c| c.value)
        .unwrap_or(f64::NAN)
}

fn to_event(rule: &AlertRule, t: Transition) -> AlertEvent {
    AlertEvent {
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        rule_period: rule.period(),
        fingerprint: t.fingerprint,
        ident: t.ident,
        severity: rule.severity,
        state: t.state,
        trigger_time: t.at,
        trigger_value: t.value,
        labels: t.labels,
        resource_tags: Labels::new(),
        recipients: Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct Evaluator {
    datasources: Arc<DatasourceCache>,
    states: Arc<AlertStateStore>,
    health: Arc<HealthRegistry>,
    pipeline: PipelineHandle,
}

impl Evaluator {
    pub fn new(
        datasources: Arc<DatasourceCache>,
        states: Arc<AlertStateStore>,
        health: Arc<HealthRegistry>,
        pipeline: PipelineHandle,
    ) -> Self {
        Self {
            datasources,
            states,
            health,
            pipeline,
        }
    }

    pub fn states(&self) -> &Arc<AlertStateStore> {
        &self.states
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    /// Run one tick of `rule` at `now`, recording health and metrics
    pub async fn eval(
        &self,
        rule: &AlertRule,
        now: i64,
        cancel: &CancellationToken,
    ) -> Result<EvalOutcome, EvalError> {
        record_rule_eval();
        let result = self.evaluate(rule, now, cancel).await;
        match &result {
            Ok(outcome) => {
                self.health.record_success(rule.id, now);
                tracing::debug!(
                    rule_id = rule.id,
                    series = outcome.series,
                    triggered = outcome.triggered,
                    events = outcome.events,
                    "Rule evaluated"
                );
            }
            Err(EvalError::Cancelled) => {
                tracing::debug!(rule_id = rule.id, "Rule evaluation cancelled, discarding results");
            }
            Err(e) => {
                record_rule_eval_error(e.stage());
                self.health.record_failure(rule.id, now, e);
                tracing::warn!(rule_id = rule.id, stage = e.stage(), error = %e, "Rule evaluation failed");
            }
        }
        result
    }

    async fn evaluate(
        &self,
        rule: &AlertRule,
        now: i64,
        cancel: &CancellationToken,
    ) -> Result<EvalOutcome, EvalError> {
        let entry = self
            .datasources
            .get(rule.datasource_id)
            .ok_or(EvalError::DatasourceMissing(rule.datasource_id))?;
        if entry.plugin_type != rule.cate {
            return Err(EvalError::DatasourceMismatch {
                id: entry.id,
                expected: rule.cate.clone(),
                actual: entry.plugin_type,
            });
        }
        let client = entry.client.as_ref();

        let end = now;
        let start = end - rule.window();
        let timeout = Duration::from_secs(rule.period() as u64);
        let mut outcome = EvalOutcome::default();

        let readings = if rule.is_log() {
            self.query_logs(rule, client, start, end, timeout, cancel).await?
        } else {
            self.query_metrics(rule, client, start, end, timeout, cancel, &mut outcome)
                .await?
        };
        if cancel.is_cancelled() {
            return Err(EvalError::Cancelled);
        }
        outcome.series = readings.len();

        let ident_label = rule.config.ident_label.as_deref();
        let triggers: Vec<Trigger> = readings
            .into_iter()
            .map(|r| {
                let (ident, label) = resolve_ident(&r.labels, ident_label);
                Trigger {
                    fingerprint: fingerprint(rule.id, &ident, &r.labels, &rule.config.fingerprint_labels, label),
                    ident,
                    labels: r.labels,
                    value: r.value,
                }
            })
            .collect();
        outcome.triggered = triggers.len();

        let transitions = self.commit(rule, now, triggers, cancel)?;
        for t in transitions {
            tracing::info!(
                rule_id = rule.id,
                fingerprint = %t.fingerprint,
                ident = %t.ident,
                state = %t.state,
                "Alert state changed"
            );
            if self.pipeline.submit(to_event(rule, t)) {
                outcome.events += 1;
            }
        }
        Ok(outcome)
    }

    /// Feed triggers into the state store unless the tick was cancelled,
    /// so a replaced rule's old tick never writes state after its successor starts
    fn commit(
        &self,
        rule: &AlertRule,
        now: i64,
        triggers: Vec<Trigger>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Transition>, EvalError> {
        if cancel.is_cancelled() {
            return Err(EvalError::Cancelled);
        }
        let policy = StatePolicy::from_rule(rule);
        Ok(self
            .states
            .observe(rule.id, &policy, now, triggers, Sweep::Untriggered))
    }

    async fn query_metrics(
        &self,
        rule: &AlertRule,
        client: &dyn Datasource,
        start: i64,
        end: i64,
        timeout: Duration,
        cancel: &CancellationToken,
        outcome: &mut EvalOutcome,
    ) -> Result<Vec<Reading>, EvalError> {
        let mut query = client.make_ts_query(&rule.expression, &rule.config.inject_labels, start, end)?;
        query.ref_id = "A".to_string();
        query.timeout = Some(timeout);

        let started = Instant::now();
        let result = client.query_data(cancel, &query).await;
        record_query_duration(client.plugin_type(), started.elapsed());
        let series = match result {
            Ok(series) => series,
            Err(DatasourceError::Cancelled) => return Err(EvalError::Cancelled),
            Err(e) => return Err(e.into()),
        };
        let current = reduce(rule, &filter_window(series, start, end));

        if !rule.has_predicate() {
            return Ok(current.into_iter().map(Reading::from).collect());
        }
        let predicate = rule.config.predicate.as_deref().unwrap_or_default();
        let expr = Expr::parse(predicate)?;

        let comparisons = self
            .query_comparisons(rule, client, &query, cancel, outcome)
            .await?;

        let mut readings = Vec::new();
        for item in current {
            let mut vars: HashMap<String, f64> = HashMap::with_capacity(comparisons.len() + 1);
            vars.insert(CURRENT_VAR.to_string(), item.value);
            for cmp in &rule.config.comparisons {
                let value = comparisons
                    .get(&cmp.name)
                    .map(|c| matching_value(c, &item.labels))
                    .unwrap_or(f64::NAN);
                vars.insert(cmp.name.clone(), value);
            }
            if expr.is_true(&vars)? {
                readings.push(Reading::from(item));
            }
        }
        Ok(readings)
    }

    /// Shifted copies of `query`, run one after another within half a period.
    /// A failed or timed-out comparison is left out and reads as NaN.
    async fn query_comparisons(
        &self,
        rule: &AlertRule,
        client: &dyn Datasource,
        query: &QueryParam,
        cancel: &CancellationToken,
        outcome: &mut EvalOutcome,
    ) -> Result<HashMap<String, Vec<Reduced>>, EvalError> {
        let mut results = HashMap::new();
        if rule.config.comparisons.is_empty() {
            return Ok(results);
        }
        if self.pipeline.is_throttled() {
            outcome.comparisons_skipped = rule.config.comparisons.len();
            record_comparisons_skipped(outcome.comparisons_skipped);
            tracing::debug!(
                rule_id = rule.id,
                fill_ratio = self.pipeline.fill_ratio(),
                "Event buffer under pressure, skipping comparison queries"
            );
            return Ok(results);
        }

        let budget = Duration::from_secs((rule.period() as u64 / 2).max(1));
        let deadline = Instant::now() + budget;

        for cmp in &rule.config.comparisons {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::debug!(rule_id = rule.id, comparison = %cmp.name, "Comparison budget spent, term unavailable");
                continue;
            }
            let mut shifted = query.shifted(cmp.offset_secs);
            shifted.ref_id = cmp.name.clone();
            shifted.timeout = Some(remaining);

            outcome.comparisons_issued += 1;
            record_comparison_query();
            match client.query_data(cancel, &shifted).await {
                Ok(series) => {
                    let series = filter_window(series, shifted.start, shifted.end);
                    results.insert(cmp.name.clone(), reduce(rule, &series));
                }
                Err(DatasourceError::Cancelled) => return Err(EvalError::Cancelled),
                Err(e) => {
                    tracing::debug!(
                        rule_id = rule.id,
                        comparison = %cmp.name,
                        error = %e,
                        "Comparison unavailable"
                    );
                }
            }
        }
        Ok(results)
    }

    async fn query_logs(
        &self,
        rule: &AlertRule,
        client: &dyn Datasource,
        start: i64,
        end: i64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Reading>, EvalError> {
        let mut query = client.make_log_query(&rule.expression, &rule.config.inject_labels, start, end)?;
        query.ref_id = "A".to_string();
        query.limit = rule.config.log_limit;
        query.timeout = Some(timeout);

        let started = Instant::now();
        let result = client.query_log(cancel, &query).await;
        record_query_duration(client.plugin_type(), started.elapsed());
        let logs = match result {
            Ok(logs) => logs,
            Err(DatasourceError::Cancelled) => return Err(EvalError::Cancelled),
            Err(e) => return Err(e.into()),
        };
        if logs.records.is_empty() && logs.total == 0 {
            return Ok(Vec::new());
        }

        let value = logs.total.max(logs.records.len() as i64) as f64;
        if rule.has_predicate() {
            let expr = Expr::parse(rule.config.predicate.as_deref().unwrap_or_default())?;
            let vars = HashMap::from([(CURRENT_VAR.to_string(), value)]);
            if !expr.is_true(&vars)? {
                return Ok(Vec::new());
            }
        }
        Ok(vec![Reading {
            labels: Labels::new(),
            value,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::datasources::testing::install;
    use crate::datasource::testing::{series, FakeDatasource, Scripted};
    use crate::datasource::Registry;
    use crate::db::{test_rule, Aggregation, Comparison, EventState};
    use crate::engine::ReduceFn;
    use crate::pipeline;
    use tokio::sync::mpsc;

    struct Harness {
        evaluator: Evaluator,
        fake: Arc<FakeDatasource>,
        rx: mpsc::Receiver<AlertEvent>,
    }

    fn harness(capacity: usize) -> Harness {
        let cache = Arc::new(DatasourceCache::new(Arc::new(Registry::with_builtin()), None));
        let fake = Arc::new(FakeDatasource::new("fake"));
        install(&cache, "prometheus", vec![(1, fake.clone() as Arc<dyn Datasource>)]);
        let (handle, rx) = pipeline::channel(capacity, 0.8);
        Harness {
            evaluator: Evaluator::new(
                cache,
                Arc::new(AlertStateStore::new()),
                Arc::new(HealthRegistry::new()),
                handle,
            ),
            fake,
            rx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<AlertEvent>) -> Vec<AlertEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn comparison_rule() -> AlertRule {
        let mut rule = test_rule(1, "rate(x[5m])", 10);
        rule.config.comparisons = vec![Comparison {
            name: "d1".into(),
            offset_secs: 86_400,
        }];
        rule.config.predicate = Some("$current > 2 * $d1".into());
        rule
    }

    #[tokio::test]
    async fn test_fire_then_recover() {
        let mut h = harness(100);
        let rule = test_rule(1, "up == 0", 10);
        let cancel = CancellationToken::new();

        let mut emitted = Vec::new();
        for now in [1000, 1010, 1020] {
            h.fake.push(Scripted::Series(vec![series(&[("ident", "h1")], &[(now, 0.0)])]));
            h.evaluator.eval(&rule, now, &cancel).await.unwrap();
            emitted.extend(drain(&mut h.rx));
        }
        // value 1 no longer satisfies `up == 0`
        for now in [1030, 1040] {
            h.fake.push(Scripted::Series(vec![]));
            h.evaluator.eval(&rule, now, &cancel).await.unwrap();
            emitted.extend(drain(&mut h.rx));
        }

        let labels: Labels = [("ident".to_string(), "h1".to_string())].into_iter().collect();
        let fp = fingerprint(1, "h1", &labels, &[], IDENT_LABEL);
        let states: Vec<(EventState, i64)> = emitted.iter().map(|e| (e.state, e.trigger_time)).collect();
        assert_eq!(states, vec![(EventState::Alerting, 1000), (EventState::Recovered, 1040)]);
        assert!(emitted.iter().all(|e| e.fingerprint == fp && e.ident == "h1"));
        assert_eq!(h.evaluator.health().get(1).unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_comparison_timeout_reads_nan() {
        let mut h = harness(100);
        let rule = comparison_rule();
        h.fake.push(Scripted::Series(vec![series(&[("ident", "h1")], &[(1000, 5.0)])]));
        h.fake.push(Scripted::Hang);

        let outcome = h.evaluator.eval(&rule, 1000, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.comparisons_issued, 1);
        assert_eq!(outcome.triggered, 0);
        assert!(drain(&mut h.rx).is_empty());

        let queries = h.fake.queries.lock().clone();
        assert_eq!(queries[1].end, 1000 - 86_400);
        assert!(queries[1].timeout.unwrap() <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_comparison_predicate_triggers() {
        let mut h = harness(100);
        let rule = comparison_rule();
        h.fake.push(Scripted::Series(vec![series(&[("ident", "h1")], &[(1000, 5.0)])]));
        h.fake.push(Scripted::Series(vec![series(&[("ident", "h1")], &[(1000 - 86_400, 2.0)])]));

        let outcome = h.evaluator.eval(&rule, 1000, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.triggered, 1);
        let events = drain(&mut h.rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger_value, 5.0);
    }

    #[tokio::test]
    async fn test_backpressure_skips_comparisons() {
        let mut h = harness(10);
        let rule = comparison_rule();
        let cancel = CancellationToken::new();

        let outcome = h.evaluator.eval(&rule, 1000, &cancel).await.unwrap();
        assert_eq!(outcome.comparisons_issued, 1);

        for i in 0..8 {
            h.evaluator.pipeline.submit(to_event(&rule, Transition {
                state: EventState::Alerting,
                fingerprint: format!("filler-{}", i),
                ident: String::new(),
                labels: Labels::new(),
                value: 0.0,
                at: 0,
            }));
        }
        let throttled = h.evaluator.eval(&rule, 1010, &cancel).await.unwrap();
        assert_eq!(throttled.comparisons_issued, 0);
        assert_eq!(throttled.comparisons_skipped, 1);

        drain(&mut h.rx);
        let recovered = h.evaluator.eval(&rule, 1020, &cancel).await.unwrap();
        assert_eq!(recovered.comparisons_issued, 1);
    }

    #[tokio::test]
    async fn test_injected_labels_reach_datasource() {
        let h = harness(100);
        let mut rule = test_rule(1, "cpu_usage + memory_usage > 10", 10);
        rule.config.inject_labels = vec!["cluster=c1".into()];
        h.evaluator.eval(&rule, 1000, &CancellationToken::new()).await.unwrap();

        let queries = h.fake.queries.lock().clone();
        assert_eq!(queries[0].query, r#"cpu_usage{cluster="c1"} + memory_usage{cluster="c1"} > 10"#);
        assert_eq!((queries[0].start, queries[0].end), (990, 1000));
        assert_eq!(queries[0].timeout, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_failures_recorded_in_health() {
        let mut h = harness(100);
        let rule = test_rule(1, "up == 0", 10);
        let cancel = CancellationToken::new();

        h.fake.push(Scripted::Fail("connection refused".into()));
        let err = h.evaluator.eval(&rule, 1000, &cancel).await.unwrap_err();
        assert_eq!(err.stage(), "query");
        h.fake.push(Scripted::Fail("connection refused".into()));
        h.evaluator.eval(&rule, 1010, &cancel).await.unwrap_err();

        let health = h.evaluator.health().get(1).unwrap();
        assert_eq!(health.consecutive_failures, 2);
        assert!(health.last_error.unwrap().contains("connection refused"));
        assert!(drain(&mut h.rx).is_empty());

        h.evaluator.eval(&rule, 1020, &cancel).await.unwrap();
        assert_eq!(h.evaluator.health().get(1).unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_datasource_type_mismatch() {
        let h = harness(100);
        let mut rule = test_rule(1, "_time:5m error", 10);
        rule.cate = "victorialogs".into();
        let err = h.evaluator.eval(&rule, 1000, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EvalError::DatasourceMismatch { .. }));
        assert_eq!(h.fake.call_count(), 0);

        rule.cate = "prometheus".into();
        rule.datasource_id = 42;
        let err = h.evaluator.eval(&rule, 1000, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EvalError::DatasourceMissing(42)));
    }

    #[tokio::test]
    async fn test_stale_samples_never_reach_aggregation() {
        let mut h = harness(100);
        let rule = test_rule(1, "up == 0", 10);
        h.fake.push(Scripted::Series(vec![
            series(&[("ident", "h1")], &[(1000 - 4000, 0.0)]),
            series(&[("ident", "h2")], &[(1000 + 600, 0.0)]),
            series(&[("ident", "h3")], &[(995, 0.0)]),
        ]));
        let outcome = h.evaluator.eval(&rule, 1000, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.series, 1);
        let events = drain(&mut h.rx);
        assert_eq!(events[0].ident, "h3");
    }

    #[tokio::test]
    async fn test_downsample_and_aggregate() {
        let mut h = harness(100);
        let mut rule = test_rule(1, "cpu > 0", 10);
        rule.config.downsample = Some(ReduceFn::Avg);
        rule.config.aggregation = Some(Aggregation {
            group_key: vec!["cluster".into()],
            func: ReduceFn::Max,
        });
        rule.config.predicate = Some("$current > 50".into());
        h.fake.push(Scripted::Series(vec![
            series(&[("ident", "h1"), ("cluster", "a")], &[(990, 40.0), (1000, 80.0)]),
            series(&[("ident", "h2"), ("cluster", "a")], &[(1000, 10.0)]),
            series(&[("ident", "h3"), ("cluster", "b")], &[(1000, 20.0)]),
        ]));

        let outcome = h.evaluator.eval(&rule, 1000, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.series, 1);
        let events = drain(&mut h.rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger_value, 60.0);
        assert_eq!(events[0].labels.get("cluster").map(String::as_str), Some("a"));
    }

    #[tokio::test]
    async fn test_cancelled_tick_discards_results() {
        let mut h = harness(100);
        let rule = test_rule(1, "up == 0", 10);
        let cancel = CancellationToken::new();
        cancel.cancel();
        h.fake.push(Scripted::Hang);

        let err = h.evaluator.eval(&rule, 1000, &cancel).await.unwrap_err();
        assert!(matches!(err, EvalError::Cancelled));
        assert!(drain(&mut h.rx).is_empty());
        assert!(h.evaluator.health().get(1).is_none());
    }

    #[tokio::test]
    async fn test_cancel_after_query_skips_state_update() {
        let h = harness(100);
        let rule = test_rule(1, "up == 0", 10);
        let trigger = Trigger {
            fingerprint: "fp-1".into(),
            ident: "h1".into(),
            labels: Labels::new(),
            value: 0.0,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.evaluator.commit(&rule, 1000, vec![trigger.clone()], &cancel).unwrap_err();
        assert!(matches!(err, EvalError::Cancelled));
        assert!(h.evaluator.states.is_empty());

        let transitions = h
            .evaluator
            .commit(&rule, 1000, vec![trigger], &CancellationToken::new())
            .unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(h.evaluator.states.status(1, "fp-1"), Some(crate::engine::AlertStatus::Alerting));
    }

    #[tokio::test]
    async fn test_rule_without_interval_uses_default_period() {
        let h = harness(100);
        let rule = test_rule(1, "up == 0", 0);
        h.fake.push(Scripted::Series(vec![]));

        h.evaluator.eval(&rule, 1000, &CancellationToken::new()).await.unwrap();
        let queries = h.fake.queries.lock().clone();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].end - queries[0].start, crate::db::DEFAULT_PERIOD_SECS);
        assert_eq!(queries[0].timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_resolve_ident() {
        let labels: Labels = [("host".to_string(), "h9".to_string())].into_iter().collect();
        assert_eq!(resolve_ident(&labels, Some("host")), ("h9".to_string(), "host"));
        assert_eq!(resolve_ident(&labels, None), (String::new(), IDENT_LABEL));
    }
}
