mod models;

pub use models::*;
pub(crate) use models::alert_event::f64_or_nan;
#[cfg(test)]
pub(crate) use models::alert_rule::test_rule;

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

pub type DbPool = SqlitePool;

/// Bundled migrations, applied in order. Every statement is idempotent.
const MIGRATIONS: &[(&str, &str)] = &[
    ("001_initial", include_str!("../../migrations/001_initial.sql")),
    ("002_alert_events", include_str!("../../migrations/002_alert_events.sql")),
];

/// Execute a SQL script statement by statement, skipping `--` comment lines
pub async fn execute_sql(pool: &SqlitePool, sql: &str) -> Result<usize> {
    let mut executed = 0;
    for statement in sql.split(';') {
        let cleaned: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let trimmed = cleaned.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
            executed += 1;
        }
    }
    Ok(executed)
}

/// Open a connection pool for the given sqlx URL
pub async fn connect(url: &str, max_connections: u32) -> Result<DbPool> {
    info!(url = %url, "Connecting to database");

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;

    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;

    Ok(pool)
}

/// Apply every bundled migration
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations...");
    for (name, sql) in MIGRATIONS {
        let statements = execute_sql(pool, sql)
            .await
            .with_context(|| format!("Migration {} failed", name))?;
        info!(migration = %name, statements, "Migration applied");
    }
    Ok(())
}

/// Failure talking to the rule store or the event store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Snapshot statistics for one cached table: `max(update_at)` and `count(*)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStat {
    pub max_update_at: i64,
    pub row_count: i64,
}

impl TableStat {
    /// Fold the stats of several tables backing one cache
    pub fn combine(stats: &[TableStat]) -> TableStat {
        stats.iter().fold(TableStat::default(), |acc, s| TableStat {
            max_update_at: acc.max_update_at.max(s.max_update_at),
            row_count: acc.row_count + s.row_count,
        })
    }
}

/// Read `max(update_at)` and `count(*)` for a table
pub async fn table_stat(pool: &SqlitePool, table: &str) -> Result<TableStat, sqlx::Error> {
    let sql = format!(
        "SELECT COALESCE(MAX(update_at), 0), COUNT(*) FROM {}",
        table
    );
    let (max_update_at, row_count): (i64, i64) = sqlx::query_as(&sql).fetch_one(pool).await?;
    Ok(TableStat {
        max_update_at,
        row_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_stat_combine() {
        let combined = TableStat::combine(&[
            TableStat {
                max_update_at: 100,
                row_count: 3,
            },
            TableStat {
                max_update_at: 250,
                row_count: 2,
            },
        ]);
        assert_eq!(combined.max_update_at, 250);
        assert_eq!(combined.row_count, 5);
    }

    #[tokio::test]
    async fn test_migrations_apply_twice() {
        let pool = connect("sqlite::memory:", 1).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let stat = table_stat(&pool, "alert_rules").await.unwrap();
        assert_eq!(stat, TableStat::default());
    }

    #[tokio::test]
    async fn test_execute_sql_skips_comments() {
        let pool = connect("sqlite::memory:", 1).await.unwrap();
        let executed = execute_sql(
            &pool,
            "-- leading comment\nCREATE TABLE t (update_at INTEGER);\n-- only a comment;\nINSERT INTO t VALUES (7);",
        )
        .await
        .unwrap();
        assert_eq!(executed, 2);
        let stat = table_stat(&pool, "t").await.unwrap();
        assert_eq!(stat.max_update_at, 7);
        assert_eq!(stat.row_count, 1);
    }
}
