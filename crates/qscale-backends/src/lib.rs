//! qscale-backends — signal retrieval for the decision service.
//!
//! Two small capability contracts hide the identity of the systems being
//! queried:
//!
//! - [`MetricSource`] reports the work-queue backlog and the 429 error
//!   rate of a workload. Implementations: [`PrometheusMetricSource`]
//!   (instant queries against a Prometheus HTTP API) and
//!   [`AzureMetricSource`] (Service Bus entity counts over ARM plus a Log
//!   Analytics query).
//! - [`ReplicaSource`] reports the current replica count. Implementations:
//!   [`DeploymentReplicaSource`] (Kubernetes Deployment status) and
//!   [`ContainerAppReplicaSource`] (Azure Container Apps revisions).
//!
//! A failed fetch fails the whole poll cycle; no stale or partial value
//! is ever substituted.

pub mod auth;
pub mod azure;
pub mod container_apps;
pub mod error;
pub mod kubernetes;
pub mod prometheus;

use async_trait::async_trait;

pub use auth::{ClientSecretCredential, DefaultCredential, ManagedIdentityCredential, TokenProvider};
pub use azure::AzureMetricSource;
pub use container_apps::ContainerAppReplicaSource;
pub use error::BackendError;
pub use kubernetes::DeploymentReplicaSource;
pub use prometheus::PrometheusMetricSource;

/// Reports the backlog and error-rate signals for a workload.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Current number of pending messages in the work queue.
    async fn queue_length(&self) -> Result<u64, BackendError>;

    /// Current rate of throttled (429) requests.
    async fn error_rate(&self) -> Result<u64, BackendError>;
}

/// Reports the current replica count of a workload.
#[async_trait]
pub trait ReplicaSource: Send + Sync {
    async fn instance_count(&self) -> Result<u32, BackendError>;
}
