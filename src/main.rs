use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use n9e::cache::{Caches, RuleStore, SqliteRuleStore};
use n9e::cli::ServerCli;
use n9e::config::Config;
use n9e::crypto::derive_key;
use n9e::datasource::Registry;
use n9e::engine::{AlertStateStore, Evaluator, Scheduler};
use n9e::pipeline::{
    spawn_retention_task, DeadLetterLog, EventSink, EventStore, LogSink, Pipeline, PipelineDeps,
    SqliteEventStore,
};
use n9e::CoreState;

/// How often expired events are pruned
const RETENTION_INTERVAL_SECS: u64 = 3600;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ServerCli::parse();

    let config = Config::load(&cli.configs)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting n9e alert engine v{}", env!("CARGO_PKG_VERSION"));

    let metrics_handle = n9e::api::metrics::init_metrics()?;

    let crypto_key = cli.crypto_key.as_deref().map(derive_key);
    let registry = Arc::new(Registry::with_builtin());

    // Stores
    let rule_db = n9e::db::connect(&config.database.rule_store_url, config.database.max_connections).await?;
    n9e::db::run_migrations(&rule_db).await?;
    let event_db = if config.database.event_store_url == config.database.rule_store_url {
        rule_db.clone()
    } else {
        let pool =
            n9e::db::connect(&config.database.event_store_url, config.database.max_connections).await?;
        n9e::db::run_migrations(&pool).await?;
        pool
    };
    let rule_store: Arc<dyn RuleStore> = Arc::new(SqliteRuleStore::new(rule_db));
    let event_store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(event_db));

    let report = n9e::startup::run_startup_checks(
        &config.server.data_dir,
        rule_store.as_ref(),
        event_store.as_ref(),
        &registry,
    )
    .await;
    if !report.all_critical_passed {
        bail!(
            "Startup checks failed: {}",
            report.critical_failures().join(", ")
        );
    }

    // Caches
    let caches = Arc::new(Caches::new(registry.clone(), crypto_key));
    caches.rules.set_default_period(config.scheduler.default_period_secs);
    caches
        .sync_all(rule_store.as_ref(), chrono::Utc::now().timestamp())
        .await
        .context("Initial cache load failed")?;
    tracing::info!(
        rules = caches.rules.len(),
        datasources = caches.datasources.len(),
        "Caches loaded"
    );

    let background = CancellationToken::new();
    let refresh_tasks = caches.spawn_refresh_tasks(rule_store.clone(), &config.cache, background.clone());

    // Events must outlive the longest rule period so dedup and recovery can see them
    let mut pipeline_config = config.pipeline.clone();
    pipeline_config.retention_secs = pipeline_config.retention_secs.max(caches.rules.max_period());
    let retention_task = spawn_retention_task(
        event_store.clone(),
        pipeline_config.retention_secs,
        RETENTION_INTERVAL_SECS,
        background.clone(),
    );

    // Pipeline
    let states = Arc::new(AlertStateStore::load(&config.state.snapshot_path));
    if !states.is_empty() {
        tracing::info!(fingerprints = states.len(), "Restored alert state");
    }
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LogSink)];
    let deps = PipelineDeps::new(
        &caches,
        event_store.clone(),
        Arc::new(DeadLetterLog::new(&pipeline_config.dead_letter_path)),
        sinks,
    );
    let (pipeline_handle, pipeline) = Pipeline::start(&pipeline_config, deps);

    let state = Arc::new(
        CoreState::new(
            config.clone(),
            registry.clone(),
            caches.clone(),
            pipeline_handle.clone(),
            states.clone(),
        )
        .with_metrics(metrics_handle),
    );

    // Scheduler
    let evaluator = Evaluator::new(
        caches.datasources.clone(),
        states.clone(),
        state.health.clone(),
        pipeline_handle,
    );
    let engine_cancel = CancellationToken::new();
    let scheduler = Scheduler::new(
        caches.rules.clone(),
        evaluator,
        config.scheduler.clone(),
        engine_cancel.clone(),
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    // HTTP
    let http_cancel = CancellationToken::new();
    let http_task = if config.http.enabled {
        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        tracing::info!("HTTP server listening on http://{}", addr);

        let app = n9e::api::create_router(state.clone());
        let cancel = http_cancel.clone();
        Some(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "HTTP server error");
            }
        }))
    } else {
        None
    };

    wait_for_shutdown_signal().await?;

    // Stop evaluating first so no new candidates arrive, then drain the pipeline.
    // Both phases share one grace period.
    let deadline = Instant::now() + Duration::from_secs(config.scheduler.shutdown_grace_secs);
    engine_cancel.cancel();
    let mut scheduler_task = scheduler_task;
    match tokio::time::timeout_at(deadline, &mut scheduler_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Scheduler task failed"),
        Err(_) => {
            tracing::warn!("Scheduler did not stop within the grace period");
            scheduler_task.abort();
        }
    }
    pipeline.shutdown_by(deadline).await;

    http_cancel.cancel();
    background.cancel();
    if let Some(task) = http_task {
        let _ = task.await;
    }
    let _ = retention_task.await;
    futures::future::join_all(refresh_tasks).await;

    match states.save(&config.state.snapshot_path, chrono::Utc::now().timestamp()) {
        Ok(count) => tracing::info!(fingerprints = count, "Alert state saved"),
        Err(e) => tracing::warn!(error = %e, "Failed to save alert state"),
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Block until INT, TERM or QUIT. HUP is reserved for reload and only logged.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut quit = signal(SignalKind::quit()).context("Failed to install SIGQUIT handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    loop {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = quit.recv() => "SIGQUIT",
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received, reload is not supported yet");
                continue;
            }
        };
        tracing::info!(signal = name, "Shutdown signal received");
        return Ok(());
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    tracing::info!("Shutdown signal received");
    Ok(())
}
