//! Command-line interfaces for the two binaries.
//!
//! - `n9e` - the alert engine server
//! - `n9e-cli` - schema maintenance for the rule and event stores:
//!   - `--upgrade` applies the bundled migrations
//!   - `--sql <FILE>` executes a script statement by statement

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::db;

/// Server arguments
#[derive(Parser, Debug)]
#[command(name = "n9e")]
#[command(author, version, about = "Alert rule evaluation engine", long_about = None)]
pub struct ServerCli {
    /// Directory holding config.toml
    #[arg(long, env = "N9E_CONFIGS", default_value = "etc")]
    pub configs: PathBuf,

    /// Secret used to decrypt `ENC:` datasource credentials
    #[arg(long, env = "N9E_CRYPTO_KEY", hide_env_values = true)]
    pub crypto_key: Option<String>,
}

/// Migrator arguments
#[derive(Parser, Debug)]
#[command(name = "n9e-cli")]
#[command(author, version, about = "Schema maintenance for the n9e stores", long_about = None)]
pub struct MigratorCli {
    /// Apply the bundled migrations to the rule store and the event store
    #[arg(long)]
    pub upgrade: bool,

    /// Execute a SQL file against the rule store
    #[arg(long, value_name = "FILE")]
    pub sql: Option<PathBuf>,

    /// Directory holding config.toml
    #[arg(long = "config", value_name = "DIR", default_value = "etc")]
    pub config: PathBuf,
}

impl MigratorCli {
    /// Run the requested actions in order: upgrade first, then the script
    pub async fn run(&self) -> Result<()> {
        if !self.upgrade && self.sql.is_none() {
            bail!("Nothing to do: pass --upgrade and/or --sql <FILE>");
        }

        let config = Config::load(&self.config)?;

        if self.upgrade {
            upgrade(&config).await?;
        }
        if let Some(path) = &self.sql {
            let executed = run_sql_file(&config, path).await?;
            println!("Executed {} statement(s) from {}", executed, path.display());
        }
        Ok(())
    }
}

/// Apply migrations to every distinct store URL
pub async fn upgrade(config: &Config) -> Result<()> {
    let stores = &config.database;
    let mut urls = vec![stores.rule_store_url.as_str()];
    if stores.event_store_url != stores.rule_store_url {
        urls.push(stores.event_store_url.as_str());
    }

    for url in urls {
        let pool = db::connect(url, 1).await?;
        db::run_migrations(&pool)
            .await
            .with_context(|| format!("Upgrade of {} failed", url))?;
        pool.close().await;
        println!("Upgraded {}", url);
    }
    Ok(())
}

pub async fn run_sql_file(config: &Config, path: &Path) -> Result<usize> {
    let sql = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read SQL file: {}", path.display()))?;
    let pool = db::connect(&config.database.rule_store_url, 1).await?;
    let executed = db::execute_sql(&pool, &sql)
        .await
        .with_context(|| format!("Failed to execute {}", path.display()))?;
    pool.close().await;
    Ok(executed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> PathBuf {
        let configs = dir.join("etc");
        std::fs::create_dir_all(&configs).unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.join("n9e.db").display());
        std::fs::write(
            configs.join(crate::config::CONFIG_FILE_NAME),
            format!(
                "[database]\nrule_store_url = \"{url}\"\nevent_store_url = \"{url}\"\n"
            ),
        )
        .unwrap();
        configs
    }

    #[test]
    fn test_server_args() {
        let cli = ServerCli::try_parse_from(["n9e", "--configs", "/opt/n9e/etc", "--crypto-key", "k"])
            .unwrap();
        assert_eq!(cli.configs, PathBuf::from("/opt/n9e/etc"));
        assert_eq!(cli.crypto_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_migrator_args() {
        let cli = MigratorCli::try_parse_from(["n9e-cli", "--upgrade", "--config", "conf"]).unwrap();
        assert!(cli.upgrade);
        assert!(cli.sql.is_none());
        assert_eq!(cli.config, PathBuf::from("conf"));
    }

    #[tokio::test]
    async fn test_migrator_without_action_fails() {
        let cli = MigratorCli::try_parse_from(["n9e-cli"]).unwrap();
        tokio_test::assert_err!(cli.run().await);
    }

    #[tokio::test]
    async fn test_upgrade_then_sql() {
        let dir = tempfile::tempdir().unwrap();
        let configs = config_in(dir.path());
        let script = dir.path().join("seed.sql");
        std::fs::write(
            &script,
            "-- seed one user\nINSERT INTO users (id, username, update_at) VALUES (1, 'alice', 1);\n",
        )
        .unwrap();

        let cli = MigratorCli {
            upgrade: true,
            sql: Some(script),
            config: configs.clone(),
        };
        tokio_test::assert_ok!(cli.run().await);

        // migrations are idempotent
        let config = Config::load(&configs).unwrap();
        upgrade(&config).await.unwrap();

        let pool = db::connect(&config.database.rule_store_url, 1).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_missing_sql_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&config_in(dir.path())).unwrap();
        assert!(run_sql_file(&config, &dir.path().join("nope.sql")).await.is_err());
    }
}
