//! Mute rule cache keyed by rule id (as a string) or `*`.

use async_trait::async_trait;
use std::collections::HashMap;

use super::{CacheCell, CacheKind, Refresh, RefreshKind, RuleStore};
use crate::db::{AlertMute, AlertMuteRow, MuteFilter, TableStat, MUTE_ALL_RULES};

#[derive(Debug, Default)]
pub struct MuteCache {
    cell: CacheCell<HashMap<String, Vec<MuteFilter>>>,
}

impl MuteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile rows into filters per key. Disabled mutes and mutes with an
    /// invalid regex are left out.
    pub fn build(rows: Vec<AlertMuteRow>) -> HashMap<String, Vec<MuteFilter>> {
        let mut by_key: HashMap<String, Vec<MuteFilter>> = HashMap::new();
        for row in rows {
            let id = row.id;
            match AlertMute::from_row(row) {
                Ok(mute) if mute.disabled => {}
                Ok(mute) => by_key
                    .entry(mute.rule_key.trim().to_string())
                    .or_default()
                    .extend(mute.filters),
                Err(e) => {
                    tracing::warn!(mute_id = id, error = %e, "Skipping mute rule with invalid filters");
                }
            }
        }
        by_key
    }

    pub fn set_all(&self, mutes: HashMap<String, Vec<MuteFilter>>, stat: TableStat, now: i64) {
        self.cell.set_all(mutes, stat, now);
    }

    /// Filters that apply to `rule_id`: its own plus the `*` ones
    pub fn mute_filters_for(&self, rule_id: i64) -> Vec<MuteFilter> {
        let snapshot = self.cell.load();
        let own_key = rule_id.to_string();
        let mut filters = Vec::new();
        for key in [own_key.as_str(), MUTE_ALL_RULES] {
            if let Some(list) = snapshot.data.get(key) {
                filters.extend(list.iter().cloned());
            }
        }
        filters
    }
}

#[async_trait]
impl Refresh for MuteCache {
    fn kind(&self) -> CacheKind {
        CacheKind::Mutes
    }

    async fn refresh(
        &self,
        store: &dyn RuleStore,
        now: i64,
        ceiling_secs: i64,
    ) -> anyhow::Result<RefreshKind> {
        let stat = store.stat(CacheKind::Mutes).await?;
        if !self.cell.needs_refresh(stat, now, ceiling_secs) {
            return Ok(RefreshKind::Skipped);
        }
        let mutes = Self::build(store.load_mutes().await?);
        self.set_all(mutes, stat, now);
        Ok(RefreshKind::Full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, rule_key: &str, filters: &str, disabled: i64) -> AlertMuteRow {
        AlertMuteRow {
            id,
            rule_key: rule_key.to_string(),
            filters: filters.to_string(),
            cause: "maintenance".to_string(),
            btime: 0,
            etime: 0,
            disabled,
            update_at: 1,
        }
    }

    #[test]
    fn test_filters_for_rule_include_wildcard() {
        let cache = MuteCache::new();
        let mutes = MuteCache::build(vec![
            row(1, "7", r#"[{"classpath_prefix":"prod/","ident_regex":"^h.*$","tags":{"env":"prod"}}]"#, 0),
            row(2, "*", r#"[{"ident_regex":"^db"}]"#, 0),
            row(3, "7", r#"[{"ident_regex":"("}]"#, 0),
            row(4, "7", r#"[{"ident_regex":"x"}]"#, 1),
            row(5, "8", r#"[{"ident_regex":"y"}]"#, 0),
        ]);
        cache.set_all(mutes, TableStat::default(), 1);

        let filters = cache.mute_filters_for(7);
        let ids: Vec<i64> = filters.iter().map(|f| f.mute_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(filters[0].classpath_prefix, "prod/");

        assert_eq!(cache.mute_filters_for(99).len(), 1);
    }
}
