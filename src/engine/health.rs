//! Per-rule evaluation health, published at `/api/v1/rules/health`.

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleHealth {
    pub rule_id: i64,
    pub last_eval_time: i64,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
pub struct HealthRegistry {
    rules: DashMap<i64, RuleHealth>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, rule_id: i64, now: i64) {
        let mut entry = self.rules.entry(rule_id).or_insert_with(|| RuleHealth {
            rule_id,
            ..Default::default()
        });
        entry.last_eval_time = now;
        entry.last_error = None;
        entry.consecutive_failures = 0;
    }

    pub fn record_failure(&self, rule_id: i64, now: i64, error: impl ToString) {
        let mut entry = self.rules.entry(rule_id).or_insert_with(|| RuleHealth {
            rule_id,
            ..Default::default()
        });
        entry.last_eval_time = now;
        entry.last_error = Some(error.to_string());
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
    }

    pub fn get(&self, rule_id: i64) -> Option<RuleHealth> {
        self.rules.get(&rule_id).map(|h| h.value().clone())
    }

    pub fn remove(&self, rule_id: i64) {
        self.rules.remove(&rule_id);
    }

    /// All entries ordered by rule id
    pub fn snapshot(&self) -> Vec<RuleHealth> {
        let mut all: Vec<RuleHealth> = self.rules.iter().map(|h| h.value().clone()).collect();
        all.sort_by_key(|h| h.rule_id);
        all
    }
}
