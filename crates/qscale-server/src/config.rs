//! Service settings and per-workload configuration resolution.
//!
//! Two layers feed the service:
//!
//! - [`Settings`] is loaded once at startup from the environment and holds
//!   the numeric knobs, metric-name aliases, and backend selection, plus
//!   optional presets for the per-workload addressing fields.
//! - [`resolve`] runs once per scaled workload: it merges the scaler
//!   metadata supplied over the wire into the settings, validates that
//!   every field the selected backends need is present, and constructs the
//!   backend clients. The result is held as data for the workload's
//!   lifetime; nothing is re-selected per poll.
//!
//! A required field present in neither layer is a hard error for the poll
//! call, never silently defaulted.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use qscale_backends::{
    AzureMetricSource, ContainerAppReplicaSource, DefaultCredential, DeploymentReplicaSource,
    MetricSource, PrometheusMetricSource, ReplicaSource,
};
use qscale_engine::{InvalidConfig, ReplicaBounds, ScalingConfig};

/// Configuration rejected during settings load or workload resolution.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`{0}` is required for this configuration and not set")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: `{value}`")]
    InvalidNumber { field: &'static str, value: String },

    #[error("unknown metrics backend `{0}`")]
    UnknownMetricsBackend(String),

    #[error("unknown compute backend `{0}`")]
    UnknownComputeBackend(String),

    #[error(transparent)]
    InvalidScaling(#[from] InvalidConfig),

    #[error("cluster api unavailable: {0}")]
    Cluster(String),
}

/// Where backlog and error-rate numbers come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsBackend {
    Prometheus,
    Azure,
}

impl FromStr for MetricsBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prometheus" => Ok(Self::Prometheus),
            "azure" => Ok(Self::Azure),
            other => Err(ConfigError::UnknownMetricsBackend(other.to_string())),
        }
    }
}

/// Where the replica count comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeBackend {
    Kubernetes,
    ContainerApps,
}

impl FromStr for ComputeBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kubernetes" => Ok(Self::Kubernetes),
            "containerApps" => Ok(Self::ContainerApps),
            other => Err(ConfigError::UnknownComputeBackend(other.to_string())),
        }
    }
}

/// Process-wide settings, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Desired backlog per replica; advertised as the metric target.
    pub target_per_replica: u64,
    /// 429 rate at which scale-down throttling activates.
    pub error_rate_threshold: u64,
    /// Minimum interval between scale-down decisions.
    pub scale_down_cooldown: Duration,
    /// Metric-name alias for the backlog query.
    pub queue_length_metric: String,
    /// Metric-name alias for the 429-rate query.
    pub error_rate_metric: String,
    pub metrics_backend: MetricsBackend,
    pub compute_backend: ComputeBackend,

    // Optional presets for fields otherwise required from scaler metadata.
    pub prometheus_endpoint: Option<String>,
    pub log_analytics_workspace_id: Option<String>,
    pub service_bus_resource_id: Option<String>,
    pub service_bus_queue_name: Option<String>,
    pub service_bus_topic_subscription: Option<String>,
    pub deployment_name: Option<String>,
    pub deployment_namespace: Option<String>,
    pub azure_subscription_id: Option<String>,
    pub resource_group: Option<String>,
    pub container_app: Option<String>,
    pub min_replicas: Option<u32>,
    pub max_replicas: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_per_replica: 10,
            error_rate_threshold: 5,
            scale_down_cooldown: Duration::from_secs(60),
            queue_length_metric: "msg_queue_length".to_string(),
            error_rate_metric: "rate_429_errors".to_string(),
            metrics_backend: MetricsBackend::Prometheus,
            compute_backend: ComputeBackend::Kubernetes,
            prometheus_endpoint: None,
            log_analytics_workspace_id: None,
            service_bus_resource_id: None,
            service_bus_queue_name: None,
            service_bus_topic_subscription: None,
            deployment_name: None,
            deployment_namespace: None,
            azure_subscription_id: None,
            resource_group: None,
            container_app: None,
            min_replicas: None,
            max_replicas: None,
        }
    }
}

impl Settings {
    /// Load settings from the environment.
    ///
    /// Unparsable numeric values log a warning and keep the default; an
    /// unknown backend identity is fatal, since every later poll would
    /// fail anyway.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut settings = Self {
            target_per_replica: env_u64(
                "QUEUE_MESSAGE_COUNT_PER_REPLICA",
                defaults.target_per_replica,
            ),
            error_rate_threshold: env_u64(
                "RATE_429_ERROR_THRESHOLD",
                defaults.error_rate_threshold,
            ),
            scale_down_cooldown: Duration::from_secs(
                env_u64("TIME_BETWEEN_SCALE_DOWN_REQUESTS_MINUTES", 1) * 60,
            ),
            queue_length_metric: env_string("MSG_QUEUE_LENGTH_METRIC_NAME")
                .unwrap_or(defaults.queue_length_metric),
            error_rate_metric: env_string("RATE_429_ERRORS_METRIC_NAME")
                .unwrap_or(defaults.error_rate_metric),
            metrics_backend: defaults.metrics_backend,
            compute_backend: defaults.compute_backend,
            prometheus_endpoint: env_string("PROMETHEUS_ENDPOINT"),
            log_analytics_workspace_id: env_string("LOG_ANALYTICS_WORKSPACE_ID"),
            service_bus_resource_id: env_string("SERVICE_BUS_RESOURCE_ID"),
            service_bus_queue_name: env_string("SERVICE_BUS_QUEUE_NAME"),
            service_bus_topic_subscription: env_string("SERVICE_BUS_TOPIC_SUBSCRIPTION_NAME"),
            deployment_name: env_string("DEPLOYMENT_NAME"),
            deployment_namespace: env_string("DEPLOYMENT_NAMESPACE"),
            azure_subscription_id: env_string("AZURE_SUBSCRIPTION_ID"),
            resource_group: env_string("RESOURCE_GROUP"),
            container_app: env_string("CONTAINER_APP"),
            min_replicas: env_u32("MIN_REPLICAS"),
            max_replicas: env_u32("MAX_REPLICAS"),
        };

        if let Some(backend) = env_string("METRICS_BACKEND") {
            settings.metrics_backend = backend.parse()?;
        }
        if let Some(backend) = env_string("INSTANCE_COMPUTE_BACKEND") {
            settings.compute_backend = backend.parse()?;
        }

        Ok(settings)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env_string(key) {
        None => default,
        Some(value) => value.parse().unwrap_or_else(|_| {
            warn!(key, %value, default, "unparsable numeric setting, using default");
            default
        }),
    }
}

fn env_u32(key: &str) -> Option<u32> {
    env_string(key).and_then(|value| match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, %value, "unparsable numeric setting, ignoring");
            None
        }
    })
}

/// A workload's validated configuration: the engine knobs plus the
/// backends selected for it, held as data for the workload's lifetime.
pub struct WorkloadConfig {
    pub scaling: ScalingConfig,
    pub bounds: ReplicaBounds,
    pub metrics: Arc<dyn MetricSource>,
    pub replicas: Arc<dyn ReplicaSource>,
}

impl std::fmt::Debug for WorkloadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadConfig")
            .field("scaling", &self.scaling)
            .field("bounds", &self.bounds)
            .field("metrics", &"<dyn MetricSource>")
            .field("replicas", &"<dyn ReplicaSource>")
            .finish()
    }
}

/// Validate settings plus scaler metadata and construct the backends.
pub async fn resolve(
    settings: &Settings,
    metadata: &HashMap<String, String>,
) -> Result<WorkloadConfig, ConfigError> {
    let scaling = ScalingConfig {
        target_per_replica: settings.target_per_replica,
        error_rate_threshold: settings.error_rate_threshold,
        scale_down_cooldown: settings.scale_down_cooldown,
    };
    scaling.validate()?;

    let bounds = ReplicaBounds {
        min: required_u32(settings.min_replicas, metadata, "minReplicas")?,
        max: required_u32(settings.max_replicas, metadata, "maxReplicas")?,
    };
    bounds.validate()?;

    let metrics: Arc<dyn MetricSource> = match settings.metrics_backend {
        MetricsBackend::Prometheus => {
            let endpoint = required_string(
                settings.prometheus_endpoint.as_deref(),
                metadata,
                "prometheusEndpoint",
            )?;
            Arc::new(PrometheusMetricSource::new(
                endpoint,
                &settings.queue_length_metric,
                &settings.error_rate_metric,
            ))
        }
        MetricsBackend::Azure => {
            let workspace_id = required_string(
                settings.log_analytics_workspace_id.as_deref(),
                metadata,
                "logAnalyticsWorkspaceId",
            )?;
            let resource_id = required_string(
                settings.service_bus_resource_id.as_deref(),
                metadata,
                "serviceBusResourceId",
            )?;
            let entity = required_string(
                settings.service_bus_queue_name.as_deref(),
                metadata,
                "serviceBusQueueName",
            )?;
            let subscription = optional_string(
                settings.service_bus_topic_subscription.as_deref(),
                metadata,
                "serviceBusTopicSubscriptionName",
            );
            Arc::new(AzureMetricSource::new(
                resource_id,
                entity,
                subscription,
                &settings.error_rate_metric,
                workspace_id,
                Arc::new(DefaultCredential::from_env()),
            ))
        }
    };

    let replicas: Arc<dyn ReplicaSource> = match settings.compute_backend {
        ComputeBackend::Kubernetes => {
            let name = required_string(
                settings.deployment_name.as_deref(),
                metadata,
                "deploymentName",
            )?;
            let namespace = required_string(
                settings.deployment_namespace.as_deref(),
                metadata,
                "deploymentNamespace",
            )?;
            let source = DeploymentReplicaSource::new(name, &namespace)
                .await
                .map_err(|e| ConfigError::Cluster(e.to_string()))?;
            Arc::new(source)
        }
        ComputeBackend::ContainerApps => {
            let subscription_id = required_string(
                settings.azure_subscription_id.as_deref(),
                metadata,
                "azureSubscriptionId",
            )?;
            let resource_group = required_string(
                settings.resource_group.as_deref(),
                metadata,
                "resourceGroup",
            )?;
            let app = required_string(
                settings.container_app.as_deref(),
                metadata,
                "containerApp",
            )?;
            Arc::new(ContainerAppReplicaSource::new(
                subscription_id,
                resource_group,
                app,
                Arc::new(DefaultCredential::from_env()),
            ))
        }
    };

    Ok(WorkloadConfig {
        scaling,
        bounds,
        metrics,
        replicas,
    })
}

fn required_string(
    preset: Option<&str>,
    metadata: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    if let Some(value) = preset {
        return Ok(value.to_string());
    }
    metadata
        .get(key)
        .filter(|value| !value.is_empty())
        .cloned()
        .ok_or(ConfigError::MissingField(key))
}

fn optional_string(
    preset: Option<&str>,
    metadata: &HashMap<String, String>,
    key: &str,
) -> Option<String> {
    preset
        .map(str::to_string)
        .or_else(|| metadata.get(key).filter(|value| !value.is_empty()).cloned())
}

fn required_u32(
    preset: Option<u32>,
    metadata: &HashMap<String, String>,
    key: &'static str,
) -> Result<u32, ConfigError> {
    if let Some(value) = preset {
        return Ok(value);
    }
    let raw = metadata
        .get(key)
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingField(key))?;
    raw.parse().map_err(|_| ConfigError::InvalidNumber {
        field: key,
        value: raw.clone(),
    })
}
