//! Append-only JSON-lines log of events that could not be persisted.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::api::metrics::record_dead_lettered;
use crate::db::AlertEvent;

#[derive(Debug)]
pub struct DeadLetterLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DeadLetterLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one JSON record per event
    pub async fn append(&self, events: &[AlertEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open dead-letter log {}", self.path.display()))?;
        file.write_all(&buf).await?;
        file.flush().await?;

        record_dead_lettered(events.len());
        tracing::warn!(
            count = events.len(),
            path = %self.path.display(),
            "Events written to dead-letter log"
        );
        Ok(())
    }

    /// Every parseable record in the log, oldest first
    pub async fn read_all(&self) -> Result<Vec<AlertEvent>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed dead-letter record");
                    None
                }
            })
            .collect())
    }
}
