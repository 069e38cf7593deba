//! Alert rule cache: rules by id and by referenced metric name.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::{CacheCell, CacheKind, Refresh, RefreshKind, RuleStore};
use crate::datasource::Registry;
use crate::db::{AlertRule, AlertRuleRow, TableStat, DEFAULT_PERIOD_SECS};

/// Metric key under which rules with an unparseable expression are indexed
pub const INVALID_METRIC: &str = "__n9e_invalid__";

#[derive(Debug, Default)]
pub struct RuleIndex {
    pub by_id: HashMap<i64, Arc<AlertRule>>,
    pub by_metric: HashMap<String, Vec<Arc<AlertRule>>>,
    pub invalid: HashSet<i64>,
}

#[derive(Debug)]
pub struct RuleCache {
    cell: CacheCell<RuleIndex>,
    registry: Arc<Registry>,
    /// Interval given to rules stored without one
    default_period: AtomicI64,
    /// (rule id, update_at) pairs whose parse error was already logged
    reported: Mutex<HashSet<(i64, i64)>>,
}

impl RuleCache {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            cell: CacheCell::default(),
            registry,
            default_period: AtomicI64::new(DEFAULT_PERIOD_SECS),
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Interval applied from the next build on to rules whose `eval_interval` is not positive
    pub fn set_default_period(&self, secs: i64) {
        let secs = if secs > 0 { secs } else { DEFAULT_PERIOD_SECS };
        self.default_period.store(secs, Ordering::Relaxed);
    }

    fn report_once(&self, id: i64, update_at: i64, message: std::fmt::Arguments<'_>) {
        if self.reported.lock().insert((id, update_at)) {
            tracing::warn!(rule_id = id, update_at, "{}", message);
        }
    }

    /// Build a fresh index from store rows
    pub fn build(&self, rows: Vec<AlertRuleRow>) -> RuleIndex {
        // forget logged errors of rules that were since edited or removed
        let current: HashSet<(i64, i64)> = rows.iter().map(|r| (r.id, r.update_at)).collect();
        self.reported.lock().retain(|key| current.contains(key));

        let rules = rows
            .into_iter()
            .filter_map(|row| {
                let (id, update_at) = (row.id, row.update_at);
                match AlertRule::try_from(row) {
                    Ok(rule) => Some(rule),
                    Err(e) => {
                        self.report_once(id, update_at, format_args!("Skipping rule with malformed JSON column: {}", e));
                        None
                    }
                }
            })
            .collect();
        self.index(rules)
    }

    /// Index already-converted rules. Each rule lands under every metric its
    /// expression references, or under [`INVALID_METRIC`] when it does not parse.
    pub fn index(&self, rules: Vec<AlertRule>) -> RuleIndex {
        let default_period = self.default_period.load(Ordering::Relaxed);
        let mut index = RuleIndex::default();
        for mut rule in rules {
            if rule.eval_interval <= 0 {
                rule.eval_interval = default_period;
            }
            let rule = Arc::new(rule);
            match self.registry.parse_expression(&rule.cate, &rule.expression) {
                Ok(parsed) => {
                    for metric in parsed.metrics {
                        index.by_metric.entry(metric).or_default().push(rule.clone());
                    }
                }
                Err(e) => {
                    self.report_once(rule.id, rule.update_at, format_args!("Rule expression does not parse, skipping: {}", e));
                    index.invalid.insert(rule.id);
                    index
                        .by_metric
                        .entry(INVALID_METRIC.to_string())
                        .or_default()
                        .push(rule.clone());
                }
            }
            index.by_id.insert(rule.id, rule);
        }
        index
    }

    pub fn set_all(&self, index: RuleIndex, stat: TableStat, now: i64) {
        self.cell.set_all(index, stat, now);
    }

    pub fn get_rule(&self, id: i64) -> Option<Arc<AlertRule>> {
        self.cell.load().data.by_id.get(&id).cloned()
    }

    pub fn rules_for_metric(&self, metric: &str) -> Vec<Arc<AlertRule>> {
        self.cell
            .load()
            .data
            .by_metric
            .get(metric)
            .cloned()
            .unwrap_or_default()
    }

    /// Every PULL rule, ordered by id
    pub fn pull_rules(&self) -> Vec<Arc<AlertRule>> {
        let snapshot = self.cell.load();
        let mut rules: Vec<Arc<AlertRule>> = snapshot
            .data
            .by_id
            .values()
            .filter(|r| r.is_pull())
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.id);
        rules
    }

    pub fn is_invalid(&self, id: i64) -> bool {
        self.cell.load().data.invalid.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.cell.load().data.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Longest period among cached rules, for the retention floor
    pub fn max_period(&self) -> i64 {
        self.cell
            .load()
            .data
            .by_id
            .values()
            .map(|r| r.period())
            .max()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Refresh for RuleCache {
    fn kind(&self) -> CacheKind {
        CacheKind::Rules
    }

    async fn refresh(
        &self,
        store: &dyn RuleStore,
        now: i64,
        ceiling_secs: i64,
    ) -> anyhow::Result<RefreshKind> {
        let stat = store.stat(CacheKind::Rules).await?;
        if !self.cell.needs_refresh(stat, now, ceiling_secs) {
            return Ok(RefreshKind::Skipped);
        }
        let rows = store.load_rules().await?;
        let index = self.build(rows);
        tracing::debug!(
            rules = index.by_id.len(),
            invalid = index.invalid.len(),
            "Rule cache rebuilt"
        );
        self.set_all(index, stat, now);
        Ok(RefreshKind::Full)
    }
}
