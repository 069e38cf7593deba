//! Pluggable query backends.
//!
//! Every backend implements [`Datasource`]; the [`Registry`] maps a plugin
//! type string to the factory that builds it from a settings object. Clients
//! are built once per datasource row by the datasource cache and shared as
//! `Arc<dyn Datasource>`.

pub mod logsql;
pub mod prometheus;
pub mod promql;
mod registry;
pub mod victorialogs;

pub use registry::{DatasourceFactory, Registry, RegistryBuilder};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Label set of one series
pub type Labels = BTreeMap<String, String>;

/// One decoded log line
pub type LogRecord = serde_json::Map<String, serde_json::Value>;

/// Timeout of the `validate` health check, independent of per-call timeouts
pub const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-call timeout when neither settings nor the query set one
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of bytes of an error body kept in [`DatasourceError::Status`]
const ERROR_BODY_EXCERPT: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum DatasourceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("query cancelled")]
    Cancelled,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Malformed payload; `partial` holds whatever decoded before the failure
    #[error("decode error: {reason}")]
    Decode { reason: String, partial: Partial },

    #[error("backend reported error: {0}")]
    Backend(String),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("client not initialized")]
    NotInitialized,

    #[error("{operation} is not supported by {plugin_type}")]
    Unsupported {
        operation: &'static str,
        plugin_type: &'static str,
    },
}

impl DatasourceError {
    pub(crate) fn decode(reason: impl Into<String>, partial: Partial) -> Self {
        DatasourceError::Decode {
            reason: reason.into(),
            partial,
        }
    }

    /// Build a status error from a non-2xx response, keeping a short body excerpt
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let body = match body.char_indices().nth(ERROR_BODY_EXCERPT) {
            Some((idx, _)) => format!("{}...", &body[..idx]),
            None => body,
        };
        DatasourceError::Status { status, body }
    }
}

impl From<reqwest::Error> for DatasourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DatasourceError::Timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        } else if e.is_decode() {
            DatasourceError::decode(e.to_string(), Partial::None)
        } else {
            DatasourceError::Transport(e.to_string())
        }
    }
}

/// Results decoded before a [`DatasourceError::Decode`]
#[derive(Debug, Clone, Default)]
pub enum Partial {
    #[default]
    None,
    Series(Vec<DataResp>),
    Logs(Vec<LogRecord>),
}

/// A single sample: unix seconds and value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub value: f64,
}

/// One series returned by `query_data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataResp {
    /// Reference id copied from the query for response correlation
    pub ref_id: String,
    pub metric: Labels,
    /// Samples ordered by timestamp ascending
    pub values: Vec<Sample>,
    pub query: String,
}

impl DataResp {
    pub fn metric_name(&self) -> Option<&str> {
        self.metric.get("__name__").map(String::as_str)
    }

    pub fn last(&self) -> Option<Sample> {
        self.values.last().copied()
    }

    /// Sort samples by timestamp ascending
    pub fn sort(&mut self) {
        self.values.sort_by_key(|s| s.timestamp);
    }
}

/// Query resolution: a number of seconds or a backend-native duration string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Step {
    Seconds(i64),
    Raw(String),
}

impl Step {
    pub fn as_param(&self) -> String {
        match self {
            Step::Seconds(secs) => format!("{}s", (*secs).max(1)),
            Step::Raw(raw) => raw.clone(),
        }
    }
}

/// Parameters of one datasource call. Times are unix seconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParam {
    pub ref_id: String,
    pub query: String,
    pub start: i64,
    pub end: i64,
    pub step: Option<Step>,
    pub limit: Option<usize>,
    pub timeout: Option<Duration>,
}

impl QueryParam {
    pub fn new(query: impl Into<String>, start: i64, end: i64) -> Self {
        Self {
            query: query.into(),
            start,
            end,
            ..Default::default()
        }
    }

    /// Same query shifted back in time
    pub fn shifted(&self, offset_secs: i64) -> Self {
        Self {
            start: self.start - offset_secs,
            end: self.end - offset_secs,
            ..self.clone()
        }
    }

    /// Effective timeout: the lesser of the call's own and the client's
    pub fn effective_timeout(&self, client_timeout: Duration) -> Duration {
        match self.timeout {
            Some(t) => t.min(client_timeout),
            None => client_timeout,
        }
    }
}

/// Log records plus the total hit count reported by the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogResult {
    pub records: Vec<LogRecord>,
    pub total: i64,
}

/// Result of parsing an expression under a datasource grammar
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedExpr {
    /// Referenced metric names in order of first appearance
    pub metrics: Vec<String>,
}

/// Expression syntax error with the byte offset it was detected at
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parse error at {position}: {message}")]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// Uniform capability set of a query backend
#[async_trait]
pub trait Datasource: Send + Sync + std::fmt::Debug {
    fn plugin_type(&self) -> &'static str;

    /// Build the HTTP transport, applying TLS and auth options
    fn init_client(&mut self) -> Result<(), DatasourceError>;

    /// Light health-check query, bounded by [`VALIDATE_TIMEOUT`]
    async fn validate(&self, cancel: &CancellationToken) -> Result<(), DatasourceError>;

    /// Deep settings equality, used to keep clients across cache reloads
    fn equal(&self, other: &dyn Datasource) -> bool;

    fn as_any(&self) -> &dyn Any;

    async fn query_data(
        &self,
        cancel: &CancellationToken,
        query: &QueryParam,
    ) -> Result<Vec<DataResp>, DatasourceError>;

    async fn query_log(
        &self,
        cancel: &CancellationToken,
        query: &QueryParam,
    ) -> Result<LogResult, DatasourceError>;

    async fn query_map_data(
        &self,
        cancel: &CancellationToken,
        query: &QueryParam,
    ) -> Result<Vec<Labels>, DatasourceError>;

    /// Build a time-series query, scoping `raw` by the `key=value` event tags
    fn make_ts_query(
        &self,
        raw: &str,
        event_tags: &[String],
        start: i64,
        end: i64,
    ) -> Result<QueryParam, DatasourceError>;

    /// Build a log query, scoping `raw` by the `key=value` event tags
    fn make_log_query(
        &self,
        raw: &str,
        event_tags: &[String],
        start: i64,
        end: i64,
    ) -> Result<QueryParam, DatasourceError>;
}

/// Run `fut` until it completes, `cancel` fires, or `timeout` elapses
pub(crate) async fn race<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    fut: F,
) -> Result<T, DatasourceError>
where
    F: Future<Output = Result<T, DatasourceError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DatasourceError::Cancelled),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(DatasourceError::Timeout(timeout)),
        },
    }
}

/// Basic auth credentials shared by the HTTP backends
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Connection settings common to the HTTP backends
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HttpSettings {
    pub addr: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub basic: BasicAuth,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub skip_tls_verify: bool,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn validate(&mut self) -> Result<(), DatasourceError> {
        self.addr = self.addr.trim_end_matches('/').to_string();
        if !(self.addr.starts_with("http://") || self.addr.starts_with("https://")) {
            return Err(DatasourceError::Settings(format!(
                "addr must be an http(s) URL, got {:?}",
                self.addr
            )));
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = DEFAULT_TIMEOUT_SECS;
        }
        Ok(())
    }

    pub fn build_client(&self) -> Result<reqwest::Client, DatasourceError> {
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &self.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DatasourceError::Settings(format!("header {}: {}", name, e)))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| DatasourceError::Settings(format!("header value: {}", e)))?;
            headers.insert(name, value);
        }

        reqwest::Client::builder()
            .user_agent("n9e")
            .timeout(self.timeout())
            .default_headers(headers)
            .danger_accept_invalid_certs(self.skip_tls_verify)
            .build()
            .map_err(|e| DatasourceError::Settings(e.to_string()))
    }

    /// Apply basic auth when a username is configured
    pub fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.basic.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.basic.username, Some(&self.basic.password))
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }
}

/// Decode a Prometheus-shaped query response (`matrix`, `vector` or `scalar`)
///
/// Series decoded before a malformed one are returned in the error.
pub(crate) fn decode_prom_response(
    body: &[u8],
    ref_id: &str,
    query: &str,
) -> Result<Vec<DataResp>, DatasourceError> {
    let envelope: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| DatasourceError::decode(e.to_string(), Partial::None))?;

    let status = envelope.get("status").and_then(|s| s.as_str()).unwrap_or("");
    if status != "success" {
        let message = envelope
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown error");
        return Err(DatasourceError::Backend(message.to_string()));
    }

    let data = envelope
        .get("data")
        .ok_or_else(|| DatasourceError::decode("missing data", Partial::None))?;
    let result_type = data.get("resultType").and_then(|t| t.as_str()).unwrap_or("");
    let result = data.get("result").cloned().unwrap_or(serde_json::Value::Null);

    if result_type == "scalar" {
        let sample = decode_sample(&result)
            .map_err(|reason| DatasourceError::decode(reason, Partial::None))?;
        return Ok(vec![DataResp {
            ref_id: ref_id.to_string(),
            metric: Labels::new(),
            values: vec![sample],
            query: query.to_string(),
        }]);
    }

    let items = match result.as_array() {
        Some(items) => items,
        None if result.is_null() => return Ok(Vec::new()),
        None => return Err(DatasourceError::decode("result is not an array", Partial::None)),
    };

    let mut series = Vec::with_capacity(items.len());
    for item in items {
        let metric: Labels = match item.get("metric") {
            Some(m) => match serde_json::from_value(m.clone()) {
                Ok(m) => m,
                Err(e) => {
                    return Err(DatasourceError::decode(e.to_string(), Partial::Series(series)))
                }
            },
            None => Labels::new(),
        };

        let mut values = Vec::new();
        if let Some(raw) = item.get("values").and_then(|v| v.as_array()) {
            for pair in raw {
                match decode_sample(pair) {
                    Ok(sample) => values.push(sample),
                    Err(reason) => {
                        return Err(DatasourceError::decode(reason, Partial::Series(series)))
                    }
                }
            }
        } else if let Some(pair) = item.get("value") {
            match decode_sample(pair) {
                Ok(sample) => values.push(sample),
                Err(reason) => return Err(DatasourceError::decode(reason, Partial::Series(series))),
            }
        }

        let mut resp = DataResp {
            ref_id: ref_id.to_string(),
            metric,
            values,
            query: query.to_string(),
        };
        resp.sort();
        series.push(resp);
    }

    Ok(series)
}

/// Decode a `[timestamp, "value"]` pair
fn decode_sample(pair: &serde_json::Value) -> Result<Sample, String> {
    let arr = pair
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| format!("sample is not a pair: {}", pair))?;

    let ts = arr[0]
        .as_f64()
        .ok_or_else(|| format!("bad timestamp: {}", arr[0]))?;
    let value = match &arr[1] {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| format!("bad sample value: {}", s))?,
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        other => return Err(format!("bad sample value: {}", other)),
    };

    Ok(Sample {
        timestamp: ts.floor() as i64,
        value,
    })
}

/// Turn `key=value` event tags into `(key, value)` pairs, dropping malformed entries
pub(crate) fn split_tags(event_tags: &[String]) -> Vec<(String, String)> {
    event_tags
        .iter()
        .filter_map(|tag| {
            let (k, v) = tag.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            let v = v.trim().trim_matches(|c| c == '"' || c == '\'');
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory datasource used by evaluator and cache tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted response for one `query_data` call
    #[derive(Debug, Clone)]
    pub enum Scripted {
        Series(Vec<DataResp>),
        Fail(String),
        /// Sleep until cancelled or timed out by the caller
        Hang,
    }

    #[derive(Debug, Default)]
    pub struct FakeDatasource {
        pub addr: String,
        pub responses: Mutex<VecDeque<Scripted>>,
        /// Returned when the script is exhausted
        pub fallback: Mutex<Vec<DataResp>>,
        pub queries: Mutex<Vec<QueryParam>>,
        pub calls: AtomicUsize,
    }

    impl FakeDatasource {
        pub fn new(addr: &str) -> Self {
            Self {
                addr: addr.to_string(),
                ..Default::default()
            }
        }

        pub fn push(&self, response: Scripted) {
            self.responses.lock().push_back(response);
        }

        pub fn set_fallback(&self, series: Vec<DataResp>) {
            *self.fallback.lock() = series;
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub fn series(labels: &[(&str, &str)], samples: &[(i64, f64)]) -> DataResp {
        DataResp {
            ref_id: String::new(),
            metric: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            values: samples
                .iter()
                .map(|(t, v)| Sample {
                    timestamp: *t,
                    value: *v,
                })
                .collect(),
            query: String::new(),
        }
    }

    #[async_trait]
    impl Datasource for FakeDatasource {
        fn plugin_type(&self) -> &'static str {
            "fake"
        }

        fn init_client(&mut self) -> Result<(), DatasourceError> {
            Ok(())
        }

        async fn validate(&self, _cancel: &CancellationToken) -> Result<(), DatasourceError> {
            Ok(())
        }

        fn equal(&self, other: &dyn Datasource) -> bool {
            other
                .as_any()
                .downcast_ref::<FakeDatasource>()
                .map(|o| o.addr == self.addr)
                .unwrap_or(false)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        async fn query_data(
            &self,
            cancel: &CancellationToken,
            query: &QueryParam,
        ) -> Result<Vec<DataResp>, DatasourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().push(query.clone());
            let next = self.responses.lock().pop_front();
            match next {
                Some(Scripted::Series(s)) => Ok(s),
                Some(Scripted::Fail(msg)) => Err(DatasourceError::Transport(msg)),
                Some(Scripted::Hang) => {
                    let timeout = query.timeout.unwrap_or(Duration::from_secs(3600));
                    race(cancel, timeout, futures::future::pending()).await
                }
                None => Ok(self.fallback.lock().clone()),
            }
        }

        async fn query_log(
            &self,
            _cancel: &CancellationToken,
            _query: &QueryParam,
        ) -> Result<LogResult, DatasourceError> {
            Ok(LogResult::default())
        }

        async fn query_map_data(
            &self,
            _cancel: &CancellationToken,
            _query: &QueryParam,
        ) -> Result<Vec<Labels>, DatasourceError> {
            Ok(Vec::new())
        }

        fn make_ts_query(
            &self,
            raw: &str,
            event_tags: &[String],
            start: i64,
            end: i64,
        ) -> Result<QueryParam, DatasourceError> {
            let query = promql::inject_labels(raw, event_tags)
                .map_err(|e| DatasourceError::InvalidQuery(e.to_string()))?;
            Ok(QueryParam::new(query, start, end))
        }

        fn make_log_query(
            &self,
            raw: &str,
            _event_tags: &[String],
            start: i64,
            end: i64,
        ) -> Result<QueryParam, DatasourceError> {
            Ok(QueryParam::new(raw, start, end))
        }
    }
}
