//! Alert event models for the append-only event store.
//!
//! Events are created by the evaluator, pass through the pipeline and are
//! written here once. Rows older than the retention window are pruned.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;

/// Event state indicating whether the alert fired or recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Alerting,
    Recovered,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Alerting => "alerting",
            EventState::Recovered => "recovered",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "alerting" => Some(EventState::Alerting),
            "recovered" => Some(EventState::Recovered),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reads `null` back as NaN, mirroring how serde_json writes non-finite floats
pub(crate) fn f64_or_nan<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// An alert event travelling through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub rule_id: i64,
    pub rule_name: String,
    /// Rule period in seconds, used as the dedup window
    pub rule_period: i64,
    pub fingerprint: String,
    pub ident: String,
    pub severity: i32,
    pub state: EventState,
    pub trigger_time: i64,
    /// NaN is written as `null`
    #[serde(deserialize_with = "f64_or_nan")]
    pub trigger_value: f64,
    /// Measurement labels; after enrichment also the merged resource tags
    pub labels: BTreeMap<String, String>,
    pub resource_tags: BTreeMap<String, String>,
    pub recipients: Vec<String>,
}

/// A persisted event row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertEventRow {
    pub id: i64,
    pub rule_id: i64,
    pub rule_name: String,
    pub fingerprint: String,
    pub ident: String,
    pub severity: i64,
    pub state: String,
    pub trigger_time: i64,
    pub trigger_value: f64,
    pub labels: String,
    pub resource_tags: String,
    pub recipients: String,
    pub created_at: i64,
}

impl AlertEvent {
    /// Append the event to the store, returning the new row id
    pub async fn insert(&self, db: &SqlitePool) -> Result<i64, sqlx::Error> {
        let labels = serde_json::to_string(&self.labels).unwrap_or_else(|_| "{}".to_string());
        let resource_tags =
            serde_json::to_string(&self.resource_tags).unwrap_or_else(|_| "{}".to_string());
        let recipients =
            serde_json::to_string(&self.recipients).unwrap_or_else(|_| "[]".to_string());
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO alert_events (rule_id, rule_name, fingerprint, ident, severity, state,
                                      trigger_time, trigger_value, labels, resource_tags, recipients, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(self.rule_id)
        .bind(&self.rule_name)
        .bind(&self.fingerprint)
        .bind(&self.ident)
        .bind(self.severity as i64)
        .bind(self.state.as_str())
        .bind(self.trigger_time)
        // SQLite stores NaN as NULL
        .bind(if self.trigger_value.is_nan() { 0.0 } else { self.trigger_value })
        .bind(labels)
        .bind(resource_tags)
        .bind(recipients)
        .bind(now)
        .execute(db)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Events of one fingerprint, newest first
    pub async fn list_for_fingerprint(
        db: &SqlitePool,
        fingerprint: &str,
        limit: i64,
    ) -> Result<Vec<AlertEventRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT id, rule_id, rule_name, fingerprint, ident, severity, state, trigger_time,
                   trigger_value, labels, resource_tags, recipients, created_at
            FROM alert_events
            WHERE fingerprint = ?
            ORDER BY trigger_time DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(fingerprint)
        .bind(limit)
        .fetch_all(db)
        .await
    }

    /// Delete events triggered before `cutoff` (unix seconds)
    pub async fn prune_before(db: &SqlitePool, cutoff: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM alert_events WHERE trigger_time < ?")
            .bind(cutoff)
            .execute(db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect, run_migrations};

    fn event(fingerprint: &str, state: EventState, at: i64) -> AlertEvent {
        AlertEvent {
            rule_id: 1,
            rule_name: "up".into(),
            rule_period: 10,
            fingerprint: fingerprint.into(),
            ident: "h1".into(),
            severity: 2,
            state,
            trigger_time: at,
            trigger_value: 0.0,
            labels: BTreeMap::new(),
            resource_tags: BTreeMap::new(),
            recipients: vec!["alice".into()],
        }
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(EventState::from_str("ALERTING"), Some(EventState::Alerting));
        assert_eq!(EventState::Recovered.to_string(), "recovered");
        assert_eq!(EventState::from_str("pending"), None);
    }

    #[tokio::test]
    async fn test_insert_and_prune() {
        let pool = connect("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();

        event("fp1", EventState::Alerting, 100).insert(&pool).await.unwrap();
        event("fp1", EventState::Recovered, 200).insert(&pool).await.unwrap();

        let rows = AlertEvent::list_for_fingerprint(&pool, "fp1", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].state, "recovered");
        assert_eq!(rows[1].recipients, r#"["alice"]"#);

        let pruned = AlertEvent::prune_before(&pool, 150).await.unwrap();
        assert_eq!(pruned, 1);
        let rows = AlertEvent::list_for_fingerprint(&pool, "fp1", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
