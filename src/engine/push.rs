//! Hook for PUSH rules: externally fed points instead of datasource polling.
//!
//! Points are validated, matched to PUSH rules by metric name and run through
//! the same predicate, state machine and pipeline as pulled series.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::evaluator::{resolve_ident, CURRENT_VAR, IDENT_LABEL};
use super::expr::Expr;
use super::point::MetricPoint;
use super::state::{fingerprint, AlertStateStore, StatePolicy, Sweep, Trigger};
use crate::api::metrics::record_point_rejected;
use crate::cache::RuleCache;
use crate::db::{AlertEvent, AlertRule, RuleType};
use crate::pipeline::PipelineHandle;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub accepted: usize,
    pub rejected: usize,
    pub events: usize,
}

#[derive(Debug, Clone)]
pub struct PushHook {
    rules: Arc<RuleCache>,
    states: Arc<AlertStateStore>,
    pipeline: PipelineHandle,
}

impl PushHook {
    pub fn new(rules: Arc<RuleCache>, states: Arc<AlertStateStore>, pipeline: PipelineHandle) -> Self {
        Self {
            rules,
            states,
            pipeline,
        }
    }

    /// Validate `points` and evaluate every enabled PUSH rule they feed
    pub fn ingest(&self, points: Vec<MetricPoint>, now: i64) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        let mut by_rule: BTreeMap<i64, (Arc<AlertRule>, Vec<MetricPoint>)> = BTreeMap::new();

        for mut point in points {
            if let Err(e) = point.check_validity(now) {
                record_point_rejected(e.reason());
                tracing::debug!(metric = %point.metric, ident = %point.ident, error = %e, "Point rejected");
                outcome.rejected += 1;
                continue;
            }
            outcome.accepted += 1;

            for rule in self.rules.rules_for_metric(&point.metric) {
                if rule.rule_type != RuleType::Push || rule.disabled {
                    continue;
                }
                by_rule
                    .entry(rule.id)
                    .or_insert_with(|| (rule.clone(), Vec::new()))
                    .1
                    .push(point.clone());
            }
        }

        for (rule, points) in by_rule.into_values() {
            outcome.events += self.evaluate(&rule, points, now);
        }
        outcome
    }

    fn evaluate(&self, rule: &AlertRule, points: Vec<MetricPoint>, now: i64) -> usize {
        let predicate = match rule.config.predicate.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(src) => match Expr::parse(src) {
                Ok(expr) => Some(expr),
                Err(e) => {
                    tracing::warn!(rule_id = rule.id, error = %e, "Push rule predicate does not parse");
                    return 0;
                }
            },
            None => None,
        };

        let mut seen = Vec::with_capacity(points.len());
        let mut triggers = Vec::new();
        for point in points {
            let mut labels = point.tags;
            if !point.ident.is_empty() {
                labels.insert(IDENT_LABEL.to_string(), point.ident);
            }
            let (ident, label) = resolve_ident(&labels, rule.config.ident_label.as_deref());
            let fp = fingerprint(rule.id, &ident, &labels, &rule.config.fingerprint_labels, label);
            seen.push(fp.clone());

            let fired = match &predicate {
                Some(expr) => {
                    let vars = HashMap::from([(CURRENT_VAR.to_string(), point.value)]);
                    expr.is_true(&vars).unwrap_or_else(|e| {
                        tracing::warn!(rule_id = rule.id, error = %e, "Push rule predicate failed");
                        false
                    })
                }
                None => true,
            };
            if fired {
                triggers.push(Trigger {
                    fingerprint: fp,
                    ident,
                    labels,
                    value: point.value,
                });
            }
        }

        let policy = StatePolicy::from_rule(rule);
        let transitions = self
            .states
            .observe(rule.id, &policy, now, triggers, Sweep::Only(seen));

        let mut emitted = 0;
        for t in transitions {
            let event = AlertEvent {
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
                resource_tags: Default::default(),
                recipients: Vec::new(),
            };
            if self.pipeline.submit(event) {
                emitted += 1;
            }
        }
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{Labels, Registry};
    use crate::db::{test_rule, EventState, TableStat};
    use crate::pipeline;
    use tokio::sync::mpsc;

    fn point(ident: &str, tags: &[(&str, &str)], time: i64, value: f64) -> MetricPoint {
        MetricPoint {
            ident: ident.to_string(),
            metric: "cpu_usage".to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Labels>(),
            time,
            value,
        }
    }

    fn hook() -> (PushHook, mpsc::Receiver<AlertEvent>) {
        let rules = Arc::new(RuleCache::new(Arc::new(Registry::with_builtin())));
        let mut push = test_rule(1, "cpu_usage > 90", 10);
        push.rule_type = RuleType::Push;
        push.config.predicate = Some("$current > 90".into());
        let pull = test_rule(2, "cpu_usage > 50", 10);
        let index = rules.index(vec![push, pull]);
        rules.set_all(index, TableStat::default(), 1);

        let (handle, rx) = pipeline::channel(100, 0.8);
        (PushHook::new(rules, Arc::new(AlertStateStore::new()), handle), rx)
    }

    #[test]
    fn test_reserved_char_point_rejected() {
        let (hook, mut rx) = hook();
        let outcome = hook.ingest(vec![point("h1", &[("app", "foo bar")], 1000, 99.0)], 1000);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.accepted, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_push_rule_fires_and_recovers() {
        let (hook, mut rx) = hook();

        let outcome = hook.ingest(
            vec![
                point("h1", &[("cpu", "0")], 1000, 95.0),
                point("h2", &[("cpu", "0")], 1000, 20.0),
            ],
            1000,
        );
        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.events, 1);
        let event = rx.try_recv().unwrap();
        assert_eq!((event.rule_id, event.ident.as_str(), event.state), (1, "h1", EventState::Alerting));
        assert!(rx.try_recv().is_err());

        // quiet points for h1; recovery once the window has passed
        hook.ingest(vec![point("h1", &[("cpu", "0")], 1005, 10.0)], 1005);
        assert!(rx.try_recv().is_err());
        hook.ingest(vec![point("h1", &[("cpu", "0")], 1020, 10.0)], 1020);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.state, EventState::Recovered);
    }

    #[test]
    fn test_stale_point_never_evaluated() {
        let (hook, mut rx) = hook();
        let outcome = hook.ingest(vec![point("h1", &[], 1000 - 4000, 99.0)], 1000);
        assert_eq!(outcome.rejected, 1);
        assert!(rx.try_recv().is_err());
    }
}
