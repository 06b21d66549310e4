//! Kubernetes replica source.
//!
//! Reads the live replica count from a Deployment's status through the
//! cluster API. Expects in-cluster configuration (service account token)
//! when running inside the cluster, falling back to the local kubeconfig
//! for development.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use tracing::debug;

use crate::error::BackendError;
use crate::ReplicaSource;

pub struct DeploymentReplicaSource {
    deployments: Api<Deployment>,
    name: String,
}

impl DeploymentReplicaSource {
    /// Connect to the cluster and bind to one Deployment.
    pub async fn new(name: impl Into<String>, namespace: &str) -> Result<Self, BackendError> {
        let client = Client::try_default().await?;
        Ok(Self {
            deployments: Api::namespaced(client, namespace),
            name: name.into(),
        })
    }
}

#[async_trait]
impl ReplicaSource for DeploymentReplicaSource {
    async fn instance_count(&self) -> Result<u32, BackendError> {
        let deployment = self.deployments.get(&self.name).await?;

        // A deployment that has not reported status yet has zero replicas.
        let replicas = deployment
            .status
            .and_then(|status| status.replicas)
            .unwrap_or(0);

        debug!(deployment = %self.name, replicas, "read deployment status");

        Ok(u32::try_from(replicas).unwrap_or(0))
    }
}
