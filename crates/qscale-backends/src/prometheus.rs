//! Prometheus metric source.
//!
//! Issues instant queries (`/api/v1/query`) for the configured backlog and
//! error-rate metric names and reads the resulting instant vector. The
//! query string is the bare metric name; any selector logic is expected to
//! live in a recording rule on the Prometheus side.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::BackendError;
use crate::MetricSource;

pub struct PrometheusMetricSource {
    endpoint: String,
    queue_length_metric: String,
    error_rate_metric: String,
    client: reqwest::Client,
}

impl PrometheusMetricSource {
    pub fn new(
        endpoint: impl Into<String>,
        queue_length_metric: impl Into<String>,
        error_rate_metric: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            queue_length_metric: queue_length_metric.into(),
            error_rate_metric: error_rate_metric.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn query(&self, metric: &str) -> Result<u64, BackendError> {
        let url = format!("{}/api/v1/query", self.endpoint.trim_end_matches('/'));

        debug!(%url, metric, "querying prometheus");

        let resp = self
            .client
            .get(&url)
            .query(&[("query", metric)])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::ErrorStatus {
                endpoint: url,
                status,
                body,
            });
        }

        let body = resp.text().await?;
        parse_instant_query(&body, metric)
    }
}

#[async_trait]
impl MetricSource for PrometheusMetricSource {
    async fn queue_length(&self) -> Result<u64, BackendError> {
        self.query(&self.queue_length_metric).await
    }

    async fn error_rate(&self) -> Result<u64, BackendError> {
        self.query(&self.error_rate_metric).await
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    data: QueryData,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<VectorSample>,
}

#[derive(Deserialize)]
struct VectorSample {
    /// Instant-vector sample: `[unix_timestamp, "value"]`.
    value: (f64, String),
}

/// Extract the integer value of an instant query response.
///
/// Takes the last sample of the vector when the query matches several
/// series. An empty result set is an error: the metric is required for a
/// scaling decision and absence must fail the poll, not read as zero.
fn parse_instant_query(body: &str, metric: &str) -> Result<u64, BackendError> {
    let resp: QueryResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::Malformed(format!("prometheus response: {e}")))?;

    if resp.status != "success" {
        return Err(BackendError::Malformed(format!(
            "prometheus query for `{metric}` returned status `{}`",
            resp.status
        )));
    }

    if resp.data.result_type != "vector" {
        return Err(BackendError::Malformed(format!(
            "prometheus query for `{metric}` returned `{}`, expected an instant vector",
            resp.data.result_type
        )));
    }

    let sample = resp.data.result.last().ok_or_else(|| {
        BackendError::Malformed(format!("prometheus query for `{metric}` matched no series"))
    })?;

    sample.value.1.parse::<u64>().map_err(|_| {
        BackendError::Malformed(format!(
            "prometheus sample for `{metric}` is not a non-negative integer: `{}`",
            sample.value.1
        ))
    })
}
