//! Azure Container Apps replica source.
//!
//! The replica count of a container app lives on its revisions, so the
//! lookup is two ARM calls: fetch the app to learn its latest ready
//! revision, then fetch that revision's replica count.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::auth::TokenProvider;
use crate::azure::MANAGEMENT_SCOPE;
use crate::error::BackendError;
use crate::ReplicaSource;

const CONTAINER_APPS_API_VERSION: &str = "2024-03-01";

pub struct ContainerAppReplicaSource {
    subscription_id: String,
    resource_group: String,
    app_name: String,
    credential: Arc<dyn TokenProvider>,
    client: reqwest::Client,
}

impl ContainerAppReplicaSource {
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        app_name: impl Into<String>,
        credential: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            app_name: app_name.into(),
            credential,
            client: reqwest::Client::new(),
        }
    }

    fn app_uri(&self) -> String {
        format!(
            "https://management.azure.com/subscriptions/{}/resourceGroups/{}\
             /providers/Microsoft.App/containerApps/{}?api-version={CONTAINER_APPS_API_VERSION}",
            self.subscription_id, self.resource_group, self.app_name
        )
    }

    fn revision_uri(&self, revision: &str) -> String {
        format!(
            "https://management.azure.com/subscriptions/{}/resourceGroups/{}\
             /providers/Microsoft.App/containerApps/{}/revisions/{revision}\
             ?api-version={CONTAINER_APPS_API_VERSION}",
            self.subscription_id, self.resource_group, self.app_name
        )
    }

    async fn get_json(&self, url: String, token: &str) -> Result<String, BackendError> {
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

        Ok(resp.text().await?)
    }
}

#[async_trait]
impl ReplicaSource for ContainerAppReplicaSource {
    async fn instance_count(&self) -> Result<u32, BackendError> {
        let token = self.credential.token(MANAGEMENT_SCOPE).await?;

        let body = self.get_json(self.app_uri(), &token).await?;
        let revision = parse_latest_ready_revision(&body)?;

        debug!(app = %self.app_name, %revision, "resolved latest ready revision");

        let body = self.get_json(self.revision_uri(&revision), &token).await?;
        parse_revision_replicas(&body)
    }
}

#[derive(Deserialize)]
struct ContainerAppResponse {
    properties: ContainerAppProperties,
}

#[derive(Deserialize)]
struct ContainerAppProperties {
    #[serde(rename = "latestReadyRevisionName")]
    latest_ready_revision_name: Option<String>,
}

fn parse_latest_ready_revision(body: &str) -> Result<String, BackendError> {
    let app: ContainerAppResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::Malformed(format!("container app: {e}")))?;

    app.properties.latest_ready_revision_name.ok_or_else(|| {
        BackendError::Malformed("container app has no ready revision".into())
    })
}

#[derive(Deserialize)]
struct RevisionResponse {
    properties: RevisionProperties,
}

#[derive(Deserialize)]
struct RevisionProperties {
    replicas: Option<u32>,
}

fn parse_revision_replicas(body: &str) -> Result<u32, BackendError> {
    let revision: RevisionResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::Malformed(format!("container app revision: {e}")))?;

    revision.properties.replicas.ok_or_else(|| {
        BackendError::Malformed("revision reports no replica count".into())
    })
}
