//! Datasource rows. Settings are a JSON object handed to the plugin factory.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DatasourceRow {
    pub id: i64,
    pub name: String,
    pub plugin_type: String,
    pub settings: String,
    pub status: String,
    pub update_at: i64,
}

impl DatasourceRow {
    pub async fn list_all(db: &SqlitePool) -> Result<Vec<DatasourceRow>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, name, plugin_type, settings, status, update_at FROM datasources ORDER BY id",
        )
        .fetch_all(db)
        .await
    }

    pub fn is_enabled(&self) -> bool {
        self.status == "enabled"
    }

    pub fn settings_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.settings.trim().is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        serde_json::from_str(&self.settings)
    }
}
