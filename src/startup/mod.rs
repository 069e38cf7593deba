//! Startup self-checks module
//!
//! Runs before the engine starts scheduling rules. Checks include:
//! - Rule store reachable (critical)
//! - Event store reachable (critical)
//! - Datasource registry has at least one plugin (critical)
//! - Data directory writable, needed for the dead-letter log and the state
//!   snapshot (non-critical)

use serde::Serialize;
use std::path::Path;
use tracing::{error, info, warn};

use crate::cache::{CacheKind, RuleStore};
use crate::datasource::Registry;
use crate::pipeline::EventStore;

/// Result of a single startup check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Name of the check
    pub name: String,
    /// Whether the check passed
    pub passed: bool,
    /// Whether this check is critical (failure should abort startup)
    pub critical: bool,
    /// Human-readable message describing the result
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            critical: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>, critical: bool) -> Self {
        Self {
            name: name.into(),
            passed: false,
            critical,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Aggregated startup check results
#[derive(Debug, Clone, Serialize)]
pub struct StartupCheckReport {
    pub checks: Vec<CheckResult>,
    /// Whether all critical checks passed
    pub all_critical_passed: bool,
    pub all_passed: bool,
    pub summary: String,
}

impl StartupCheckReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        let all_critical_passed = checks.iter().filter(|c| c.critical).all(|c| c.passed);
        let all_passed = checks.iter().all(|c| c.passed);

        let failed_critical = checks.iter().filter(|c| c.critical && !c.passed).count();
        let failed_non_critical = checks.iter().filter(|c| !c.critical && !c.passed).count();
        let total = checks.len();
        let passed = checks.iter().filter(|c| c.passed).count();

        let summary = if all_passed {
            format!("All {} startup checks passed", total)
        } else if all_critical_passed {
            format!(
                "{}/{} checks passed ({} non-critical warnings)",
                passed, total, failed_non_critical
            )
        } else {
            format!(
                "{}/{} checks passed ({} critical failures)",
                passed, total, failed_critical
            )
        };

        Self {
            checks,
            all_critical_passed,
            all_passed,
            summary,
        }
    }

    /// Names of the failed critical checks
    pub fn critical_failures(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| c.critical && !c.passed)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Run all startup self-checks
pub async fn run_startup_checks(
    data_dir: &Path,
    rules: &dyn RuleStore,
    events: &dyn EventStore,
    registry: &Registry,
) -> StartupCheckReport {
    info!("Running startup self-checks...");

    let checks = vec![
        check_rule_store(rules).await,
        check_event_store(events).await,
        check_registry(registry),
        check_directory_writability(data_dir),
    ];

    let report = StartupCheckReport::new(checks);

    for check in &report.checks {
        if check.passed {
            info!(check = %check.name, message = %check.message, "Startup check PASSED");
        } else if check.critical {
            error!(
                check = %check.name,
                message = %check.message,
                details = ?check.details,
                "Startup check FAILED (CRITICAL)"
            );
        } else {
            warn!(
                check = %check.name,
                message = %check.message,
                details = ?check.details,
                "Startup check FAILED (non-critical)"
            );
        }
    }

    info!(
        summary = %report.summary,
        all_passed = report.all_passed,
        all_critical_passed = report.all_critical_passed,
        "Startup checks completed"
    );

    report
}

async fn check_rule_store(store: &dyn RuleStore) -> CheckResult {
    match store.stat(CacheKind::Rules).await {
        Ok(stat) => CheckResult::pass("rule_store", "Rule store reachable")
            .with_details(format!("{} alert rules", stat.row_count)),
        Err(e) => CheckResult::fail("rule_store", "Rule store unreachable", true)
            .with_details(e.to_string()),
    }
}

async fn check_event_store(store: &dyn EventStore) -> CheckResult {
    match store.ping().await {
        Ok(()) => CheckResult::pass("event_store", "Event store reachable"),
        Err(e) => CheckResult::fail("event_store", "Event store unreachable", true)
            .with_details(e.to_string()),
    }
}

fn check_registry(registry: &Registry) -> CheckResult {
    if registry.is_empty() {
        CheckResult::fail("datasource_registry", "No datasource plugins registered", true)
    } else {
        CheckResult::pass("datasource_registry", "Datasource plugins registered")
            .with_details(registry.plugin_types().join(", "))
    }
}

/// Check the data directory with a throwaway file
fn check_directory_writability(data_dir: &Path) -> CheckResult {
    let test_file = data_dir.join(".n9e_write_test");

    let written = std::fs::create_dir_all(data_dir).and_then(|_| std::fs::write(&test_file, "test"));
    match written {
        Ok(()) => {
            let _ = std::fs::remove_file(&test_file);
            CheckResult::pass("directory_writability", "Data directory is writable")
                .with_details(format!("Path: {}", data_dir.display()))
        }
        Err(e) => CheckResult::fail(
            "directory_writability",
            "Data directory is not writable",
            false,
        )
        .with_details(format!("{}: {}", data_dir.display(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::testing::FakeRuleStore;
    use crate::pipeline::SqliteEventStore;
    use std::sync::atomic::Ordering;

    async fn event_store() -> SqliteEventStore {
        let pool = crate::db::connect("sqlite::memory:", 1).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        SqliteEventStore::new(pool)
    }

    #[test]
    fn test_check_result_fail() {
        let result = CheckResult::fail("test", "Test failed", true);
        assert!(!result.passed);
        assert!(result.critical);
    }

    #[test]
    fn test_report_non_critical_failure() {
        let checks = vec![
            CheckResult::pass("check1", "ok"),
            CheckResult::fail("check2", "warn", false),
        ];
        let report = StartupCheckReport::new(checks);
        assert!(!report.all_passed);
        assert!(report.all_critical_passed);
        assert!(report.critical_failures().is_empty());
    }

    #[tokio::test]
    async fn test_all_checks_pass() {
        let dir = tempfile::tempdir().unwrap();
        let rules = FakeRuleStore::new();
        let events = event_store().await;

        let report =
            run_startup_checks(dir.path(), &rules, &events, &Registry::with_builtin()).await;
        assert!(report.all_passed, "{:?}", report.checks);
        assert!(!dir.path().join(".n9e_write_test").exists());
    }

    #[tokio::test]
    async fn test_unreachable_rule_store_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let rules = FakeRuleStore::new();
        rules.fail.store(true, Ordering::SeqCst);
        let events = event_store().await;

        let report =
            run_startup_checks(dir.path(), &rules, &events, &Registry::with_builtin()).await;
        assert!(!report.all_critical_passed);
        assert_eq!(report.critical_failures(), vec!["rule_store"]);
    }

    #[tokio::test]
    async fn test_event_store_without_schema_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect("sqlite::memory:", 1).await.unwrap();
        let events = SqliteEventStore::new(pool);

        let report = run_startup_checks(
            dir.path(),
            &FakeRuleStore::new(),
            &events,
            &Registry::with_builtin(),
        )
        .await;
        assert_eq!(report.critical_failures(), vec!["event_store"]);
    }

    #[tokio::test]
    async fn test_empty_registry_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let events = event_store().await;

        let report = run_startup_checks(
            dir.path(),
            &FakeRuleStore::new(),
            &events,
            &Registry::builder().build(),
        )
        .await;
        assert_eq!(report.critical_failures(), vec!["datasource_registry"]);
    }
}
