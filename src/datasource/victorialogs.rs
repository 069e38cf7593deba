//! VictoriaLogs client.
//!
//! Log queries stream newline-delimited JSON. Decoding stops as soon as the
//! limit is reached or the cancellation token fires.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::any::Any;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    decode_prom_response, logsql, race, DataResp, Datasource, DatasourceError, HttpSettings,
    Labels, LogRecord, LogResult, Partial, QueryParam, VALIDATE_TIMEOUT,
};

pub const PLUGIN_TYPE: &str = "victorialogs";

/// Default cap on the number of log lines per query
pub const DEFAULT_MAX_LINES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct Settings {
    #[serde(flatten)]
    http: HttpSettings,
    #[serde(default = "default_max_lines")]
    max_lines: usize,
}

fn default_max_lines() -> usize {
    DEFAULT_MAX_LINES
}

#[derive(Debug, Deserialize)]
struct HitsResponse {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(default)]
    total: i64,
}

#[derive(Debug)]
pub struct VictoriaLogs {
    settings: Settings,
    client: Option<reqwest::Client>,
}

/// Unix seconds to the millisecond timestamps the wire protocol expects
fn millis(secs: i64) -> String {
    (secs * 1000).to_string()
}

impl VictoriaLogs {
    pub fn init(settings: &serde_json::Value) -> Result<Box<dyn Datasource>, DatasourceError> {
        let mut settings: Settings = serde_json::from_value(settings.clone())
            .map_err(|e| DatasourceError::Settings(e.to_string()))?;
        settings.http.validate()?;
        if settings.max_lines == 0 {
            settings.max_lines = DEFAULT_MAX_LINES;
        }
        Ok(Box::new(VictoriaLogs {
            settings,
            client: None,
        }))
    }

    fn client(&self) -> Result<&reqwest::Client, DatasourceError> {
        self.client.as_ref().ok_or(DatasourceError::NotInitialized)
    }

    fn form(&self, query: &QueryParam, timeout: Duration) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("query", query.query.clone()),
            ("start", millis(query.start)),
            ("end", millis(query.end)),
            ("time", millis(query.end)),
            ("timeout", format!("{}s", timeout.as_secs().max(1))),
        ];
        if let Some(step) = &query.step {
            form.push(("step", step.as_param()));
        }
        form
    }

    async fn post(
        &self,
        path: &str,
        form: &[(&'static str, String)],
    ) -> Result<reqwest::Response, DatasourceError> {
        let request = self.client()?.post(self.settings.http.url(path)).form(form);
        let response = self.settings.http.authorize(request).send().await?;
        if !response.status().is_success() {
            return Err(DatasourceError::from_response(response).await);
        }
        Ok(response)
    }

    /// Stream `/select/logsql/query`, stopping at `limit` records
    async fn stream_records(
        &self,
        cancel: &CancellationToken,
        form: &[(&'static str, String)],
        limit: usize,
    ) -> Result<Vec<LogRecord>, DatasourceError> {
        let response = self.post("/select/logsql/query", form).await?;
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut records: Vec<LogRecord> = Vec::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DatasourceError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let done = match chunk {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    false
                }
                Some(Err(e)) => {
                    return Err(DatasourceError::decode(e.to_string(), Partial::Logs(records)))
                }
                None => true,
            };

            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                if push_line(&line, &mut records)? && records.len() >= limit {
                    return Ok(records);
                }
            }

            if done {
                if !buffer.is_empty() {
                    let rest = std::mem::take(&mut buffer);
                    push_line(&rest, &mut records)?;
                }
                records.truncate(limit);
                return Ok(records);
            }
        }
    }

    /// Sum of `hits[].total` from `/select/logsql/hits`
    async fn hits(&self, form: &[(&'static str, String)]) -> Result<i64, DatasourceError> {
        let response = self.post("/select/logsql/hits", form).await?;
        let body = response.bytes().await?;
        let hits: HitsResponse = serde_json::from_slice(&body)
            .map_err(|e| DatasourceError::decode(e.to_string(), Partial::None))?;
        Ok(hits.hits.iter().map(|h| h.total).sum())
    }
}

/// Decode one NDJSON line into `records`; returns whether a record was added.
/// On a malformed line the records decoded so far travel with the error.
fn push_line(line: &[u8], records: &mut Vec<LogRecord>) -> Result<bool, DatasourceError> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace());
    let trimmed = match (start, end) {
        (Some(s), Some(e)) => &line[s..=e],
        _ => return Ok(false),
    };
    match serde_json::from_slice::<LogRecord>(trimmed) {
        Ok(record) => {
            records.push(record);
            Ok(true)
        }
        Err(e) => Err(DatasourceError::decode(
            format!("malformed log line: {}", e),
            Partial::Logs(std::mem::take(records)),
        )),
    }
}

#[async_trait]
impl Datasource for VictoriaLogs {
    fn plugin_type(&self) -> &'static str {
        PLUGIN_TYPE
    }

    fn init_client(&mut self) -> Result<(), DatasourceError> {
        if self.client.is_none() {
            self.client = Some(self.settings.http.build_client()?);
        }
        Ok(())
    }

    async fn validate(&self, cancel: &CancellationToken) -> Result<(), DatasourceError> {
        race(cancel, VALIDATE_TIMEOUT, async {
            let request = self.client()?.get(self.settings.http.url("/health"));
            let response = self.settings.http.authorize(request).send().await?;
            if !response.status().is_success() {
                return Err(DatasourceError::from_response(response).await);
            }
            Ok(())
        })
        .await
    }

    fn equal(&self, other: &dyn Datasource) -> bool {
        other
            .as_any()
            .downcast_ref::<VictoriaLogs>()
            .map(|o| o.settings == self.settings)
            .unwrap_or(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    /// Range stats query; the response is Prometheus-shaped
    async fn query_data(
        &self,
        cancel: &CancellationToken,
        query: &QueryParam,
    ) -> Result<Vec<DataResp>, DatasourceError> {
        if query.query.trim().is_empty() {
            return Err(DatasourceError::InvalidQuery("query cannot be empty".into()));
        }
        let timeout = query.effective_timeout(self.settings.http.timeout());
        let form = self.form(query, timeout);
        race(cancel, timeout, async {
            let response = self.post("/select/logsql/stats_query_range", &form).await?;
            let body = response.bytes().await?;
            decode_prom_response(&body, &query.ref_id, &query.query)
        })
        .await
    }

    async fn query_log(
        &self,
        cancel: &CancellationToken,
        query: &QueryParam,
    ) -> Result<LogResult, DatasourceError> {
        if query.query.trim().is_empty() {
            return Err(DatasourceError::InvalidQuery("query cannot be empty".into()));
        }
        let limit = query
            .limit
            .filter(|l| *l > 0)
            .unwrap_or(self.settings.max_lines)
            .min(self.settings.max_lines);
        let timeout = query.effective_timeout(self.settings.http.timeout());
        let mut form = self.form(query, timeout);
        form.push(("limit", limit.to_string()));
        debug!(query = %query.query, limit, "victorialogs query");

        let records = race(cancel, timeout, self.stream_records(cancel, &form, limit)).await?;
        if records.is_empty() {
            return Ok(LogResult::default());
        }

        let total = match race(cancel, timeout, self.hits(&form)).await {
            Ok(total) => total,
            Err(DatasourceError::Cancelled) => return Err(DatasourceError::Cancelled),
            Err(e) => {
                warn!(error = %e, "victorialogs hits query failed, using record count");
                records.len() as i64
            }
        };

        Ok(LogResult { records, total })
    }

    /// Instant stats query at `end`, returning series label sets
    async fn query_map_data(
        &self,
        cancel: &CancellationToken,
        query: &QueryParam,
    ) -> Result<Vec<Labels>, DatasourceError> {
        let timeout = query.effective_timeout(self.settings.http.timeout());
        let form = self.form(query, timeout);
        let series = race(cancel, timeout, async {
            let response = self.post("/select/logsql/stats_query", &form).await?;
            let body = response.bytes().await?;
            decode_prom_response(&body, &query.ref_id, &query.query)
        })
        .await?;
        Ok(series.into_iter().map(|s| s.metric).collect())
    }

    fn make_ts_query(
        &self,
        raw: &str,
        event_tags: &[String],
        start: i64,
        end: i64,
    ) -> Result<QueryParam, DatasourceError> {
        let query = logsql::inject_filters(raw, event_tags)
            .map_err(|e| DatasourceError::InvalidQuery(e.to_string()))?;
        Ok(QueryParam::new(query, start, end))
    }

    fn make_log_query(
        &self,
        raw: &str,
        event_tags: &[String],
        start: i64,
        end: i64,
    ) -> Result<QueryParam, DatasourceError> {
        let mut query = self.make_ts_query(raw, event_tags, start, end)?;
        query.limit = Some(self.settings.max_lines);
        Ok(query)
    }
}
