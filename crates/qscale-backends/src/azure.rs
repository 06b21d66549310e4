//! Azure metric source.
//!
//! Backlog comes from the Service Bus entity itself: an ARM GET on the
//! queue (or topic subscription) returns its message-count details.
//! The 429 error rate comes from a Log Analytics workspace, where the
//! subscriber application exports an `AppMetrics` custom metric.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::auth::TokenProvider;
use crate::error::BackendError;
use crate::MetricSource;

/// Scope for ARM management-plane calls.
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Scope for Log Analytics query calls.
pub const LOG_ANALYTICS_SCOPE: &str = "https://api.loganalytics.io/.default";

const SERVICE_BUS_API_VERSION: &str = "2023-01-01-preview";

pub struct AzureMetricSource {
    /// Full ARM resource id of the Service Bus namespace.
    service_bus_resource_id: String,
    /// Queue name, or topic name when a subscription is set.
    entity_name: String,
    /// Set when the backlog lives on a topic subscription instead of a queue.
    topic_subscription: Option<String>,
    /// `AppMetrics` metric name carrying the 429 counts.
    error_rate_metric: String,
    log_analytics_workspace_id: String,
    credential: Arc<dyn TokenProvider>,
    client: reqwest::Client,
}

impl AzureMetricSource {
    pub fn new(
        service_bus_resource_id: impl Into<String>,
        entity_name: impl Into<String>,
        topic_subscription: Option<String>,
        error_rate_metric: impl Into<String>,
        log_analytics_workspace_id: impl Into<String>,
        credential: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            service_bus_resource_id: service_bus_resource_id.into(),
            entity_name: entity_name.into(),
            topic_subscription,
            error_rate_metric: error_rate_metric.into(),
            log_analytics_workspace_id: log_analytics_workspace_id.into(),
            credential,
            client: reqwest::Client::new(),
        }
    }

    fn entity_request_uri(&self) -> String {
        match &self.topic_subscription {
            None => format!(
                "https://management.azure.com:443{}/queues/{}?api-version={SERVICE_BUS_API_VERSION}",
                self.service_bus_resource_id, self.entity_name
            ),
            Some(subscription) => format!(
                "https://management.azure.com:443{}/topics/{}/subscriptions/{}?api-version={SERVICE_BUS_API_VERSION}",
                self.service_bus_resource_id, self.entity_name, subscription
            ),
        }
    }

    async fn run_log_analytics_query(&self, query: &str) -> Result<u64, BackendError> {
        let token = self.credential.token(LOG_ANALYTICS_SCOPE).await?;
        let url = format!(
            "https://api.loganalytics.io/v1/workspaces/{}/query",
            self.log_analytics_workspace_id
        );

        debug!(%url, query, "running log analytics query");

        let resp = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .bearer_auth(token)
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
        parse_query_result(&body)
    }
}

#[async_trait]
impl MetricSource for AzureMetricSource {
    async fn queue_length(&self) -> Result<u64, BackendError> {
        let token = self.credential.token(MANAGEMENT_SCOPE).await?;
        let url = self.entity_request_uri();

        debug!(%url, "fetching service bus entity");

        let resp = self.client.get(&url).bearer_auth(token).send().await?;

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
        parse_entity_response(&body)
    }

    async fn error_rate(&self) -> Result<u64, BackendError> {
        let query = format!(
            "AppMetrics | where Name  == '{}' | top 1 by TimeGenerated desc \
             | project rate_429_errors=(Sum /ItemCount)",
            self.error_rate_metric
        );
        self.run_log_analytics_query(&query).await
    }
}

#[derive(Deserialize)]
struct EntityResponse {
    properties: EntityProperties,
}

#[derive(Deserialize)]
struct EntityProperties {
    #[serde(rename = "countDetails")]
    count_details: CountDetails,
}

#[derive(Deserialize)]
struct CountDetails {
    #[serde(rename = "activeMessageCount")]
    active_message_count: u64,
}

fn parse_entity_response(body: &str) -> Result<u64, BackendError> {
    let entity: EntityResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::Malformed(format!("service bus entity: {e}")))?;
    Ok(entity.properties.count_details.active_message_count)
}

#[derive(Deserialize)]
struct QueryResult {
    tables: Vec<QueryTable>,
}

#[derive(Deserialize)]
struct QueryTable {
    rows: Vec<Vec<Value>>,
}

/// Extract the single scalar a `top 1 ... | project` query produces.
///
/// An empty row set means no matching metric was recorded in the window
/// and reads as an error rate of zero rather than a failure.
fn parse_query_result(body: &str) -> Result<u64, BackendError> {
    let result: QueryResult = serde_json::from_str(body)
        .map_err(|e| BackendError::Malformed(format!("log analytics response: {e}")))?;

    let table = result
        .tables
        .first()
        .ok_or_else(|| BackendError::Malformed("log analytics response has no tables".into()))?;

    let Some(row) = table.rows.first() else {
        return Ok(0);
    };

    let cell = row
        .first()
        .ok_or_else(|| BackendError::Malformed("log analytics row is empty".into()))?;

    match cell {
        Value::Number(n) => n.as_u64().ok_or_else(|| {
            BackendError::Malformed(format!("query result is not a non-negative integer: {n}"))
        }),
        Value::String(s) => s.parse::<u64>().map_err(|_| {
            BackendError::Malformed(format!("query result is not a non-negative integer: `{s}`"))
        }),
        other => Err(BackendError::Malformed(format!(
            "unexpected query result cell: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ClientSecretCredential;

    fn test_source(topic_subscription: Option<String>) -> AzureMetricSource {
        AzureMetricSource::new(
            "/subscriptions/sub-1/resourceGroups/rg/providers/Microsoft.ServiceBus/namespaces/ns",
            "orders",
            topic_subscription,
            "rate_429_errors",
            "workspace-1",
            Arc::new(ClientSecretCredential::new("t", "c", "s")),
        )
    }

    #[test]
    fn queue_uri_addresses_the_queue() {
        let uri = test_source(None).entity_request_uri();
        assert_eq!(
            uri,
            "https://management.azure.com:443/subscriptions/sub-1/resourceGroups/rg\
             /providers/Microsoft.ServiceBus/namespaces/ns/queues/orders\
             ?api-version=2023-01-01-preview"
        );
    }

    #[test]
    fn topic_uri_addresses_the_subscription() {
        let uri = test_source(Some("workers".to_string())).entity_request_uri();
        assert_eq!(
            uri,
            "https://management.azure.com:443/subscriptions/sub-1/resourceGroups/rg\
             /providers/Microsoft.ServiceBus/namespaces/ns/topics/orders/subscriptions/workers\
             ?api-version=2023-01-01-preview"
        );
    }

    #[test]
    fn parses_active_message_count() {
        let body = r#"{
            "properties": {
                "countDetails": {
                    "activeMessageCount": 17,
                    "deadLetterMessageCount": 2
                }
            }
        }"#;
        assert_eq!(parse_entity_response(body).unwrap(), 17);
    }

    #[test]
    fn entity_without_count_details_is_an_error() {
        let body = r#"{"properties": {}}"#;
        assert!(matches!(
            parse_entity_response(body),
            Err(BackendError::Malformed(_))
        ));
    }

    #[test]
    fn parses_numeric_query_cell() {
        let body = r#"{"tables":[{"rows":[[15]]}]}"#;
        assert_eq!(parse_query_result(body).unwrap(), 15);
    }

    #[test]
    fn parses_string_query_cell() {
        let body = r#"{"tables":[{"rows":[["15"]]}]}"#;
        assert_eq!(parse_query_result(body).unwrap(), 15);
    }

    #[test]
    fn empty_rows_mean_zero_errors() {
        let body = r#"{"tables":[{"rows":[]}]}"#;
        assert_eq!(parse_query_result(body).unwrap(), 0);
    }

    #[test]
    fn no_tables_is_an_error() {
        let body = r#"{"tables":[]}"#;
        assert!(matches!(
            parse_query_result(body),
            Err(BackendError::Malformed(_))
        ));
    }

    #[test]
    fn fractional_query_cell_is_an_error() {
        let body = r#"{"tables":[{"rows":[[15.5]]}]}"#;
        assert!(matches!(
            parse_query_result(body),
            Err(BackendError::Malformed(_))
        ));
    }
}
