//! Live datasource clients, rebuilt from the `datasources` table.
//!
//! Key features:
//! - Only `enabled` rows are exposed
//! - `ENC:` settings values are decrypted with the server crypto key
//! - An existing client is kept when the rebuilt one is `equal` to it, so
//!   unchanged datasources keep their connection pools across reloads
//! - A row that fails to initialise is logged and left out; the others load

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::{CacheCell, CacheKind, Refresh, RefreshKind, RuleStore};
use crate::crypto::{decrypt_settings, CryptoKey};
use crate::datasource::{Datasource, Registry};
use crate::db::{DatasourceRow, TableStat};

#[derive(Debug, Clone)]
pub struct DatasourceEntry {
    pub id: i64,
    pub name: String,
    pub plugin_type: String,
    pub client: Arc<dyn Datasource>,
}

#[derive(Debug)]
pub struct DatasourceCache {
    cell: CacheCell<HashMap<i64, DatasourceEntry>>,
    registry: Arc<Registry>,
    crypto_key: Option<CryptoKey>,
}

impl DatasourceCache {
    pub fn new(registry: Arc<Registry>, crypto_key: Option<CryptoKey>) -> Self {
        Self {
            cell: CacheCell::default(),
            registry,
            crypto_key,
        }
    }

    fn init_row(&self, row: &DatasourceRow) -> anyhow::Result<Box<dyn Datasource>> {
        let mut settings = row.settings_json()?;
        decrypt_settings(&mut settings, self.crypto_key.as_ref())?;
        Ok(self.registry.init(&row.plugin_type, &settings)?)
    }

    /// Build entries for the enabled rows, reusing equal clients from `previous`
    pub fn build(
        &self,
        rows: Vec<DatasourceRow>,
        previous: &HashMap<i64, DatasourceEntry>,
    ) -> HashMap<i64, DatasourceEntry> {
        let mut entries = HashMap::new();
        for row in rows.into_iter().filter(|r| r.is_enabled()) {
            let fresh = match self.init_row(&row) {
                Ok(ds) => ds,
                Err(e) => {
                    tracing::warn!(
                        datasource_id = row.id,
                        name = %row.name,
                        plugin_type = %row.plugin_type,
                        error = %e,
                        "Failed to initialise datasource, skipping"
                    );
                    continue;
                }
            };

            let client: Arc<dyn Datasource> = match previous.get(&row.id) {
                Some(old) if old.plugin_type == row.plugin_type && old.client.equal(fresh.as_ref()) => {
                    old.client.clone()
                }
                _ => {
                    tracing::info!(datasource_id = row.id, name = %row.name, "Datasource client (re)built");
                    Arc::from(fresh)
                }
            };

            entries.insert(
                row.id,
                DatasourceEntry {
                    id: row.id,
                    name: row.name,
                    plugin_type: row.plugin_type,
                    client,
                },
            );
        }
        entries
    }

    pub fn set_all(&self, entries: HashMap<i64, DatasourceEntry>, stat: TableStat, now: i64) {
        self.cell.set_all(entries, stat, now);
    }

    pub fn get(&self, id: i64) -> Option<DatasourceEntry> {
        self.cell.load().data.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.cell.load().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<DatasourceEntry> {
        let mut all: Vec<DatasourceEntry> = self.cell.load().data.values().cloned().collect();
        all.sort_by_key(|e| e.id);
        all
    }
}

#[async_trait]
impl Refresh for DatasourceCache {
    fn kind(&self) -> CacheKind {
        CacheKind::Datasources
    }

    async fn refresh(
        &self,
        store: &dyn RuleStore,
        now: i64,
        ceiling_secs: i64,
    ) -> anyhow::Result<RefreshKind> {
        let stat = store.stat(CacheKind::Datasources).await?;
        if !self.cell.needs_refresh(stat, now, ceiling_secs) {
            return Ok(RefreshKind::Skipped);
        }
        let rows = store.load_datasources().await?;
        let previous = self.cell.load();
        let entries = self.build(rows, &previous.data);
        self.set_all(entries, stat, now);
        Ok(RefreshKind::Full)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::testing::FakeRuleStore;
    use crate::crypto::derive_key;
    use crate::crypto::testing::seal;
    use serde_json::json;

    fn row(id: i64, plugin_type: &str, settings: serde_json::Value, status: &str, update_at: i64) -> DatasourceRow {
        DatasourceRow {
            id,
            name: format!("ds-{}", id),
            plugin_type: plugin_type.to_string(),
            settings: settings.to_string(),
            status: status.to_string(),
            update_at,
        }
    }

    fn cache(key: Option<CryptoKey>) -> DatasourceCache {
        DatasourceCache::new(Arc::new(Registry::with_builtin()), key)
    }

    #[tokio::test]
    async fn test_only_enabled_and_valid_rows() {
        let store = FakeRuleStore::new();
        {
            let mut rows = store.datasources.lock();
            rows.push(row(1, "prometheus", json!({"addr": "http://prom:9090"}), "enabled", 1));
            rows.push(row(2, "victorialogs", json!({"addr": "http://vl:9428"}), "disabled", 1));
            rows.push(row(3, "prometheus", json!({"addr": "ftp://bad"}), "enabled", 1));
            rows.push(row(4, "influxdb", json!({"addr": "http://x"}), "enabled", 1));
        }
        let cache = cache(None);
        cache.refresh(&store, 100, 600).await.unwrap();

        assert_eq!(cache.len(), 1);
        let entry = cache.get(1).unwrap();
        assert_eq!(entry.plugin_type, "prometheus");
        assert_eq!(entry.client.plugin_type(), "prometheus");
        assert!(cache.get(2).is_none());
    }

    #[tokio::test]
    async fn test_equal_client_is_reused() {
        let store = FakeRuleStore::new();
        store
            .datasources
            .lock()
            .push(row(1, "prometheus", json!({"addr": "http://prom:9090"}), "enabled", 1));
        let cache = cache(None);
        cache.refresh(&store, 100, 600).await.unwrap();
        let first = cache.get(1).unwrap().client;

        // touched but unchanged settings
        store.datasources.lock()[0].update_at = 2;
        cache.refresh(&store, 110, 600).await.unwrap();
        assert!(Arc::ptr_eq(&first, &cache.get(1).unwrap().client));

        store.datasources.lock()[0] = row(1, "prometheus", json!({"addr": "http://prom2:9090"}), "enabled", 3);
        cache.refresh(&store, 120, 600).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &cache.get(1).unwrap().client));
    }

    #[test]
    fn test_encrypted_settings() {
        let key = derive_key("secret");
        let password = seal("hunter2", &key);
        let rows = vec![row(
            1,
            "prometheus",
            json!({"addr": "http://prom:9090", "basic": {"username": "u", "password": password}}),
            "enabled",
            1,
        )];

        assert_eq!(cache(Some(key)).build(rows.clone(), &HashMap::new()).len(), 1);
        // no key: the row cannot be decrypted and is skipped
        assert!(cache(None).build(rows, &HashMap::new()).is_empty());
    }
}
