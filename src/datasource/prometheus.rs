//! Prometheus-compatible TSDB client.

use async_trait::async_trait;
use std::any::Any;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    decode_prom_response, promql, race, DataResp, Datasource, DatasourceError, HttpSettings,
    Labels, LogResult, QueryParam, Step, VALIDATE_TIMEOUT,
};

pub const PLUGIN_TYPE: &str = "prometheus";

#[derive(Debug)]
pub struct Prometheus {
    settings: HttpSettings,
    client: Option<reqwest::Client>,
}

impl Prometheus {
    pub fn init(settings: &serde_json::Value) -> Result<Box<dyn Datasource>, DatasourceError> {
        let mut settings: HttpSettings = serde_json::from_value(settings.clone())
            .map_err(|e| DatasourceError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(Box::new(Prometheus {
            settings,
            client: None,
        }))
    }

    fn client(&self) -> Result<&reqwest::Client, DatasourceError> {
        self.client.as_ref().ok_or(DatasourceError::NotInitialized)
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<bytes::Bytes, DatasourceError> {
        let request = self.client()?.get(self.settings.url(path)).query(params);
        let response = self.settings.authorize(request).send().await?;
        if !response.status().is_success() {
            return Err(DatasourceError::from_response(response).await);
        }
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl Datasource for Prometheus {
    fn plugin_type(&self) -> &'static str {
        PLUGIN_TYPE
    }

    fn init_client(&mut self) -> Result<(), DatasourceError> {
        if self.client.is_none() {
            self.client = Some(self.settings.build_client()?);
        }
        Ok(())
    }

    async fn validate(&self, cancel: &CancellationToken) -> Result<(), DatasourceError> {
        race(cancel, VALIDATE_TIMEOUT, async {
            let body = self.get("/api/v1/query", &[("query", "1".to_string())]).await?;
            decode_prom_response(&body, "", "1").map(|_| ())
        })
        .await
    }

    fn equal(&self, other: &dyn Datasource) -> bool {
        other
            .as_any()
            .downcast_ref::<Prometheus>()
            .map(|o| o.settings == self.settings)
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
        if query.query.trim().is_empty() {
            return Err(DatasourceError::InvalidQuery("query cannot be empty".into()));
        }
        let step = query
            .step
            .clone()
            .unwrap_or(Step::Seconds(((query.end - query.start) / 2).max(1)));
        let params = [
            ("query", query.query.clone()),
            ("start", query.start.to_string()),
            ("end", query.end.to_string()),
            ("step", step.as_param()),
        ];
        debug!(query = %query.query, start = query.start, end = query.end, "prometheus query_range");

        let timeout = query.effective_timeout(self.settings.timeout());
        race(cancel, timeout, async {
            let body = self.get("/api/v1/query_range", &params).await?;
            decode_prom_response(&body, &query.ref_id, &query.query)
        })
        .await
    }

    async fn query_log(
        &self,
        _cancel: &CancellationToken,
        _query: &QueryParam,
    ) -> Result<LogResult, DatasourceError> {
        Err(DatasourceError::Unsupported {
            operation: "query_log",
            plugin_type: PLUGIN_TYPE,
        })
    }

    /// Instant query at `end`, returning the label set of every series
    async fn query_map_data(
        &self,
        cancel: &CancellationToken,
        query: &QueryParam,
    ) -> Result<Vec<Labels>, DatasourceError> {
        let params = [("query", query.query.clone()), ("time", query.end.to_string())];
        let timeout = query.effective_timeout(self.settings.timeout());
        let series = race(cancel, timeout, async {
            let body = self.get("/api/v1/query", &params).await?;
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
        let query = promql::inject_labels(raw, event_tags)
            .map_err(|e| DatasourceError::InvalidQuery(e.to_string()))?;
        Ok(QueryParam::new(query, start, end))
    }

    fn make_log_query(
        &self,
        _raw: &str,
        _event_tags: &[String],
        _start: i64,
        _end: i64,
    ) -> Result<QueryParam, DatasourceError> {
        Err(DatasourceError::Unsupported {
            operation: "make_log_query",
            plugin_type: PLUGIN_TYPE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> Box<dyn Datasource> {
        let mut ds = Prometheus::init(&json!({
            "addr": "http://127.0.0.1:1/",
            "timeout_secs": 2,
            "basic": {"username": "u", "password": "p"},
            "headers": {"X-Scope-OrgID": "tenant"}
        }))
        .unwrap();
        ds.init_client().unwrap();
        ds
    }

    #[test]
    fn test_make_ts_query_injects_labels() {
        let ds = client();
        let q = ds
            .make_ts_query("cpu_usage + memory_usage > 10", &["cluster=c1".into()], 100, 110)
            .unwrap();
        assert_eq!(q.query, r#"cpu_usage{cluster="c1"} + memory_usage{cluster="c1"} > 10"#);
        assert_eq!((q.start, q.end), (100, 110));
        assert!(ds.make_log_query("x", &[], 0, 1).is_err());
    }

    #[tokio::test]
    async fn test_query_log_unsupported() {
        let ds = client();
        let res = ds
            .query_log(&CancellationToken::new(), &QueryParam::new("x", 0, 1))
            .await;
        assert!(matches!(res, Err(DatasourceError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_query() {
        let ds = client();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = ds.query_data(&cancel, &QueryParam::new("up", 0, 10)).await;
        assert!(matches!(res, Err(DatasourceError::Cancelled)));
    }

    #[tokio::test]
    async fn test_uninitialized_client() {
        let ds = Prometheus::init(&json!({"addr": "http://127.0.0.1:1"})).unwrap();
        let res = ds
            .query_data(&CancellationToken::new(), &QueryParam::new("up", 0, 10))
            .await;
        assert!(matches!(res, Err(DatasourceError::NotInitialized)));
    }
}
