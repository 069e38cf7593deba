//! Rule scheduler: one timer task per enabled PULL rule.
//!
//! A reconcile tick compares the rule cache with the running tasks. New rules
//! start, removed or disabled rules stop, and rules whose evaluation shape
//! changed are restarted. Other rules are left untouched.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::evaluator::Evaluator;
use crate::api::metrics::set_scheduled_rules;
use crate::cache::RuleCache;
use crate::config::SchedulerConfig;
use crate::db::{AlertRule, RuleConfig};

/// Fields whose change restarts a rule's task
#[derive(Debug, Clone, PartialEq)]
struct Signature {
    expression: String,
    cate: String,
    datasource_id: i64,
    period: i64,
    config: RuleConfig,
}

impl Signature {
    fn of(rule: &AlertRule, period: i64) -> Self {
        Self {
            expression: rule.expression.clone(),
            cate: rule.cate.clone(),
            datasource_id: rule.datasource_id,
            period,
            config: rule.config.clone(),
        }
    }
}

#[derive(Debug)]
struct RuleTask {
    signature: Signature,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Rule ids touched by one reconcile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<i64>,
    pub restarted: Vec<i64>,
    pub stopped: Vec<i64>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.restarted.is_empty() && self.stopped.is_empty()
    }
}

pub struct Scheduler {
    rules: Arc<RuleCache>,
    evaluator: Evaluator,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: HashMap<i64, RuleTask>,
}

impl Scheduler {
    pub fn new(
        rules: Arc<RuleCache>,
        evaluator: Evaluator,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            rules,
            evaluator,
            config,
            permits,
            cancel,
            tasks: HashMap::new(),
        }
    }

    /// Number of rules with a running task
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Period a rule is currently scheduled with
    pub fn scheduled_period(&self, rule_id: i64) -> Option<i64> {
        self.tasks.get(&rule_id).map(|t| t.signature.period)
    }

    /// Bring running tasks in line with the rule cache
    pub fn reconcile(&mut self) -> ReconcileReport {
        let desired: HashMap<i64, Arc<AlertRule>> = self
            .rules
            .pull_rules()
            .into_iter()
            .filter(|r| !r.disabled && !self.rules.is_invalid(r.id))
            .map(|r| (r.id, r))
            .collect();

        let mut report = ReconcileReport::default();

        let gone: Vec<i64> = self
            .tasks
            .keys()
            .filter(|id| !desired.contains_key(id))
            .copied()
            .collect();
        for id in gone {
            if let Some(task) = self.tasks.remove(&id) {
                task.cancel.cancel();
            }
            self.evaluator.states().forget_rule(id);
            self.evaluator.health().remove(id);
            tracing::info!(rule_id = id, "Rule unscheduled");
            report.stopped.push(id);
        }

        let mut ids: Vec<i64> = desired.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let rule = &desired[&id];
            let period = rule.period();
            let signature = Signature::of(rule, period);
            match self.tasks.get(&id) {
                Some(task) if task.signature == signature => continue,
                Some(task) => {
                    task.cancel.cancel();
                    tracing::info!(rule_id = id, period, "Rule changed, restarting its task");
                    report.restarted.push(id);
                }
                None => {
                    tracing::info!(rule_id = id, period, "Rule scheduled");
                    report.started.push(id);
                }
            }
            let cancel = self.cancel.child_token();
            let handle = self.spawn_rule(id, period, cancel.clone());
            self.tasks.insert(
                id,
                RuleTask {
                    signature,
                    cancel,
                    handle,
                },
            );
        }

        set_scheduled_rules(self.tasks.len());
        report
    }

    fn spawn_rule(&self, rule_id: i64, period: i64, cancel: CancellationToken) -> JoinHandle<()> {
        let rules = self.rules.clone();
        let evaluator = self.evaluator.clone();
        let permits = self.permits.clone();

        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(period as u64));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                // the latest cached version is evaluated
                let Some(rule) = rules.get_rule(rule_id) else {
                    continue;
                };
                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let now = chrono::Utc::now().timestamp();
                // errors are recorded in rule health by the evaluator
                let _ = evaluator.eval(&rule, now, &cancel).await;
                drop(permit);
            }
            tracing::debug!(rule_id, "Rule task stopped");
        })
    }

    /// Cancel every task and wait up to `grace` for in-flight evaluations
    pub async fn stop_all(&mut self, grace: Duration) {
        let tasks: Vec<RuleTask> = self.tasks.drain().map(|(_, t)| t).collect();
        for task in &tasks {
            task.cancel.cancel();
        }
        let mut handles: Vec<JoinHandle<()>> = tasks.into_iter().map(|t| t.handle).collect();
        let count = handles.len();

        if tokio::time::timeout(grace, futures::future::join_all(handles.iter_mut()))
            .await
            .is_err()
        {
            tracing::warn!(tasks = count, "Rule tasks did not stop within the grace period, aborting");
            for handle in &handles {
                handle.abort();
            }
        }
        set_scheduled_rules(0);
    }

    /// Reconcile on every sync tick until cancelled, then stop all rule tasks
    pub async fn run(mut self) {
        let delay = Duration::from_secs(self.config.engine_delay_secs);
        if !delay.is_zero() {
            tracing::info!(delay_secs = delay.as_secs(), "Delaying first rule reconcile");
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(
            sync_interval_secs = self.config.sync_interval_secs,
            max_concurrency = self.config.max_concurrency,
            "Rule scheduler started"
        );
        let mut tick = interval(Duration::from_secs(self.config.sync_interval_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let report = self.reconcile();
            if !report.is_empty() {
                tracing::debug!(?report, scheduled = self.tasks.len(), "Rules reconciled");
            }
        }

        self.stop_all(Duration::from_secs(self.config.shutdown_grace_secs))
            .await;
        tracing::info!("Rule scheduler stopped");
    }
}
