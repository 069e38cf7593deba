//! Alert rule models.
//!
//! Rules are stored one per row; evaluation options that vary by rule kind
//! live in the `rule_config` JSON column and are parsed into [`RuleConfig`].

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use crate::engine::ReduceFn;

/// How a rule is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// The scheduler polls a datasource on the rule's period
    Pull,
    /// Evaluation is driven by externally pushed points
    Push,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Pull => "pull",
            RuleType::Push => "push",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pull" => Some(RuleType::Pull),
            "push" => Some(RuleType::Push),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the primary query returns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    /// Time series samples via `QueryData`
    #[default]
    Metric,
    /// Log records plus a hit count via `QueryLog`
    Log,
}

/// Group series by a label subset and reduce each group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    #[serde(default)]
    pub group_key: Vec<String>,
    pub func: ReduceFn,
}

/// A period-over-period comparison: the primary query shifted back by `offset_secs`.
///
/// The down-sampled value is bound to `$<name>` in the rule predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub name: String,
    pub offset_secs: i64,
}

/// Per-rule evaluation options parsed from the `rule_config` column
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Query window; one period when absent
    pub lookback_secs: Option<i64>,
    /// Consecutive triggering evaluations required before alerting (default 1)
    pub for_count: Option<u32>,
    /// Time without a trigger before an alert recovers (default one period)
    pub recover_secs: Option<i64>,
    /// Time a recovered fingerprint stays quiet before returning to ok (default one period)
    pub cooldown_secs: Option<i64>,
    pub downsample: Option<ReduceFn>,
    pub aggregation: Option<Aggregation>,
    pub comparisons: Vec<Comparison>,
    /// Client-side predicate over `$current` and comparison names
    pub predicate: Option<String>,
    /// Label holding the resource ident when `ident` is absent
    pub ident_label: Option<String>,
    /// Labels contributing to the fingerprint; all labels when empty
    pub fingerprint_labels: Vec<String>,
    /// `key=value` matchers injected into every metric selector of the expression
    pub inject_labels: Vec<String>,
    /// Re-emit an alerting event after this many seconds while still firing; 0 disables
    pub repeat_secs: i64,
    pub query_kind: QueryKind,
    pub log_limit: Option<usize>,
}

/// Raw `alert_rules` row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertRuleRow {
    pub id: i64,
    pub group_id: i64,
    pub name: String,
    pub rule_type: String,
    pub cate: String,
    pub datasource_id: i64,
    pub prom_ql: String,
    pub eval_interval: i64,
    pub severity: i64,
    pub disabled: i64,
    pub notify_recipients: String,
    pub notify_groups: String,
    pub append_tags: String,
    pub rule_config: String,
    pub update_at: i64,
}

impl AlertRuleRow {
    pub async fn list_all(db: &SqlitePool) -> Result<Vec<AlertRuleRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT id, group_id, name, rule_type, cate, datasource_id, prom_ql, eval_interval,
                   severity, disabled, notify_recipients, notify_groups, append_tags, rule_config, update_at
            FROM alert_rules
            ORDER BY id
            "#,
        )
        .fetch_all(db)
        .await
    }
}

/// A parsed alert rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub group_id: i64,
    pub name: String,
    pub rule_type: RuleType,
    /// Datasource plugin type the expression is written for
    pub cate: String,
    pub datasource_id: i64,
    pub expression: String,
    /// Evaluation period in seconds
    pub eval_interval: i64,
    pub severity: i32,
    pub disabled: bool,
    pub notify_recipients: Vec<String>,
    pub notify_groups: Vec<i64>,
    /// Enrichment labels appended to every event
    pub append_tags: BTreeMap<String, String>,
    pub config: RuleConfig,
    pub update_at: i64,
}

impl TryFrom<AlertRuleRow> for AlertRule {
    type Error = serde_json::Error;

    fn try_from(row: AlertRuleRow) -> Result<Self, Self::Error> {
        let rule_type = RuleType::from_str(&row.rule_type).unwrap_or(RuleType::Pull);
        let notify_recipients = parse_json_or_default(&row.notify_recipients)?;
        let notify_groups = parse_json_or_default(&row.notify_groups)?;
        let append_tags = parse_json_or_default(&row.append_tags)?;
        let config = parse_json_or_default(&row.rule_config)?;

        Ok(Self {
            id: row.id,
            group_id: row.group_id,
            name: row.name,
            rule_type,
            cate: row.cate,
            datasource_id: row.datasource_id,
            expression: row.prom_ql,
            eval_interval: row.eval_interval,
            severity: row.severity as i32,
            disabled: row.disabled != 0,
            notify_recipients,
            notify_groups,
            append_tags,
            config,
            update_at: row.update_at,
        })
    }
}

pub(crate) fn parse_json_or_default<T>(raw: &str) -> Result<T, serde_json::Error>
where
    T: serde::de::DeserializeOwned + Default,
{
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw)
}

/// Period used for rules stored without an evaluation interval
pub const DEFAULT_PERIOD_SECS: i64 = 10;

impl AlertRule {
    /// Evaluation period; a non-positive interval falls back to [`DEFAULT_PERIOD_SECS`]
    pub fn period(&self) -> i64 {
        if self.eval_interval > 0 {
            self.eval_interval
        } else {
            DEFAULT_PERIOD_SECS
        }
    }

    /// Query lookback: the configured window or one period
    pub fn window(&self) -> i64 {
        self.config
            .lookback_secs
            .filter(|w| *w > 0)
            .unwrap_or_else(|| self.period())
    }

    pub fn for_count(&self) -> u32 {
        self.config.for_count.unwrap_or(1).max(1)
    }

    pub fn recover_window(&self) -> i64 {
        self.config.recover_secs.unwrap_or_else(|| self.period())
    }

    pub fn cooldown(&self) -> i64 {
        self.config.cooldown_secs.unwrap_or_else(|| self.period())
    }

    pub fn is_pull(&self) -> bool {
        self.rule_type == RuleType::Pull
    }

    pub fn is_log(&self) -> bool {
        self.config.query_kind == QueryKind::Log
    }

    /// Whether evaluation needs the client-side predicate
    pub fn has_predicate(&self) -> bool {
        self.config
            .predicate
            .as_deref()
            .map(|p| !p.trim().is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) fn test_rule(id: i64, expression: &str, period: i64) -> AlertRule {
    AlertRule {
        id,
        group_id: 0,
        name: format!("rule-{}", id),
        rule_type: RuleType::Pull,
        cate: "prometheus".to_string(),
        datasource_id: 1,
        expression: expression.to_string(),
        eval_interval: period,
        severity: 2,
        disabled: false,
        notify_recipients: Vec::new(),
        notify_groups: Vec::new(),
        append_tags: BTreeMap::new(),
        config: RuleConfig::default(),
        update_at: 100,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(rule_config: &str) -> AlertRuleRow {
        AlertRuleRow {
            id: 7,
            group_id: 1,
            name: "cpu high".into(),
            rule_type: "PULL".into(),
            cate: "prometheus".into(),
            datasource_id: 3,
            prom_ql: "cpu_usage > 90".into(),
            eval_interval: 30,
            severity: 1,
            disabled: 0,
            notify_recipients: r#"["alice"]"#.into(),
            notify_groups: "[2]".into(),
            append_tags: r#"{"team":"infra"}"#.into(),
            rule_config: rule_config.into(),
            update_at: 100,
        }
    }

    #[test]
    fn test_row_conversion_defaults() {
        let rule = AlertRule::try_from(row("")).unwrap();
        assert_eq!(rule.rule_type, RuleType::Pull);
        assert_eq!(rule.notify_groups, vec![2]);
        assert_eq!(rule.append_tags.get("team").map(String::as_str), Some("infra"));
        assert_eq!(rule.window(), 30);
        assert_eq!(rule.for_count(), 1);
        assert_eq!(rule.recover_window(), 30);
        assert_eq!(rule.cooldown(), 30);
        assert!(!rule.has_predicate());
    }

    #[test]
    fn test_row_conversion_with_config() {
        let rule = AlertRule::try_from(row(
            r#"{
                "lookback_secs": 300,
                "for_count": 3,
                "downsample": "p95",
                "aggregation": {"group_key": ["cluster"], "func": "max"},
                "comparisons": [{"name": "d1", "offset_secs": 86400}],
                "predicate": "$current > 2 * $d1",
                "query_kind": "metric"
            }"#,
        ))
        .unwrap();
        assert_eq!(rule.window(), 300);
        assert_eq!(rule.for_count(), 3);
        assert_eq!(rule.config.downsample, Some(ReduceFn::P95));
        assert_eq!(rule.config.comparisons[0].offset_secs, 86400);
        assert!(rule.has_predicate());
    }

    #[test]
    fn test_row_conversion_bad_json() {
        assert!(AlertRule::try_from(row("{not json")).is_err());
    }
}
