// Rule evaluation health API
//
// Read-only view over the per-rule health the evaluator records.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::engine::RuleHealth;
use crate::CoreState;

/// Rule health entry, joined with the cached rule name when still known
#[derive(Debug, Serialize)]
pub struct RuleHealthInfo {
    #[serde(flatten)]
    pub health: RuleHealth,
    pub name: Option<String>,
    pub scheduled: bool,
}

#[derive(Debug, Serialize)]
pub struct ListRuleHealthResponse {
    pub rules: Vec<RuleHealthInfo>,
    pub total: usize,
    pub failing: usize,
}

fn describe(state: &CoreState, health: RuleHealth) -> RuleHealthInfo {
    let rule = state.caches.rules.get_rule(health.rule_id);
    RuleHealthInfo {
        name: rule.as_ref().map(|r| r.name.clone()),
        scheduled: rule.map(|r| r.is_pull() && !r.disabled).unwrap_or(false),
        health,
    }
}

/// List health of every evaluated rule
///
/// GET /api/v1/rules/health
pub async fn list_rule_health(State(state): State<Arc<CoreState>>) -> Json<ListRuleHealthResponse> {
    let rules: Vec<RuleHealthInfo> = state
        .health
        .snapshot()
        .into_iter()
        .map(|h| describe(&state, h))
        .collect();
    let total = rules.len();
    let failing = rules
        .iter()
        .filter(|r| r.health.consecutive_failures > 0)
        .count();

    Json(ListRuleHealthResponse {
        rules,
        total,
        failing,
    })
}

/// Health of one rule
///
/// GET /api/v1/rules/health/:id
pub async fn get_rule_health(
    State(state): State<Arc<CoreState>>,
    Path(rule_id): Path<i64>,
) -> Result<Json<RuleHealthInfo>, StatusCode> {
    match state.health.get(rule_id) {
        Some(health) => Ok(Json(describe(&state, health))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Caches;
    use crate::config::Config;
    use crate::datasource::Registry;
    use crate::db::{test_rule, TableStat};
    use crate::engine::AlertStateStore;
    use crate::pipeline;

    fn state() -> Arc<CoreState> {
        let registry = Arc::new(Registry::with_builtin());
        let caches = Arc::new(Caches::new(registry.clone(), None));
        let index = caches.rules.index(vec![test_rule(1, "up == 0", 10)]);
        caches.rules.set_all(index, TableStat::default(), 1);
        let (handle, _rx) = pipeline::channel(10, 0.8);
        Arc::new(CoreState::new(
            Config::default(),
            registry,
            caches,
            handle,
            Arc::new(AlertStateStore::new()),
        ))
    }

    #[tokio::test]
    async fn test_list_rule_health() {
        let state = state();
        state.health.record_success(1, 1000);
        state.health.record_failure(7, 1000, "query: connection refused");
        state.health.record_failure(7, 1010, "query: connection refused");

        let Json(resp) = list_rule_health(State(state)).await;
        assert_eq!(resp.total, 2);
        assert_eq!(resp.failing, 1);
        assert_eq!(resp.rules[0].name.as_deref(), Some("rule-1"));
        assert!(resp.rules[0].scheduled);
        assert_eq!(resp.rules[1].name, None);
        assert_eq!(resp.rules[1].health.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_get_unknown_rule_is_404() {
        let state = state();
        let err = get_rule_health(State(state), Path(42)).await.unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);
    }
}
