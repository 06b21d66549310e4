//! External-scaler gRPC service.
//!
//! Owns one decision engine and one set of resolved backends per scaled
//! workload. A poll cycle is: resolve (first contact only) → fetch replica
//! count, error rate, backlog → evaluate → respond. Any fetch failure
//! fails the whole cycle without advancing engine state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use qscale_backends::BackendError;
use qscale_engine::{DecisionEngine, WorkloadSample};

use crate::config::{self, Settings, WorkloadConfig};
use crate::proto;
use crate::proto::external_scaler_server::{ExternalScaler, ExternalScalerServer};

/// Metric name advertised to the polling controller.
const METRIC_NAME: &str = "qThreshold";

/// Emission interval of the liveness stream.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// A configured workload: its resolved backends plus its engine.
///
/// The surrounding mutex serializes polls for this workload; the engine
/// reads then writes its hysteresis state and must not see interleaved
/// calls.
struct Workload {
    config: WorkloadConfig,
    engine: DecisionEngine,
}

/// gRPC implementation of the external-scaler service.
pub struct ScalerService {
    settings: Settings,
    /// Active workloads, keyed by `namespace/name` of the scaled object.
    workloads: Mutex<HashMap<String, Arc<Mutex<Workload>>>>,
}

impl ScalerService {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            workloads: Mutex::new(HashMap::new()),
        }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> ExternalScalerServer<Self> {
        ExternalScalerServer::new(self)
    }

    /// Look up the workload entry, resolving its configuration on first
    /// contact.
    async fn workload(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<Arc<Mutex<Workload>>, Status> {
        let mut workloads = self.workloads.lock().await;

        if let Some(entry) = workloads.get(key) {
            return Ok(entry.clone());
        }

        let config = config::resolve(&self.settings, metadata).await.map_err(|e| {
            error!(workload = %key, error = %e, "configuration rejected");
            Status::invalid_argument(e.to_string())
        })?;

        info!(
            workload = %key,
            min_replicas = config.bounds.min,
            max_replicas = config.bounds.max,
            "workload configured"
        );

        let engine = DecisionEngine::new(config.scaling.clone());
        let entry = Arc::new(Mutex::new(Workload { config, engine }));
        workloads.insert(key.to_string(), entry.clone());
        Ok(entry)
    }
}

fn workload_key(scaled_object: &proto::ScaledObjectRef) -> String {
    format!("{}/{}", scaled_object.namespace, scaled_object.name)
}

fn unavailable(key: &str, what: &str, err: BackendError) -> Status {
    error!(workload = %key, error = %err, "{what} fetch failed");
    Status::unavailable(format!("{what}: {err}"))
}

#[tonic::async_trait]
impl ExternalScaler for ScalerService {
    async fn is_active(
        &self,
        _request: Request<proto::ScaledObjectRef>,
    ) -> Result<Response<proto::IsActiveResponse>, Status> {
        debug!("IsActive called");

        Ok(Response::new(proto::IsActiveResponse { result: true }))
    }

    async fn get_metric_spec(
        &self,
        _request: Request<proto::ScaledObjectRef>,
    ) -> Result<Response<proto::GetMetricSpecResponse>, Status> {
        info!(
            target = self.settings.target_per_replica,
            "GetMetricSpec called"
        );

        Ok(Response::new(proto::GetMetricSpecResponse {
            metric_specs: vec![proto::MetricSpec {
                metric_name: METRIC_NAME.to_string(),
                target_size: self.settings.target_per_replica as i64,
            }],
        }))
    }

    async fn get_metrics(
        &self,
        request: Request<proto::GetMetricsRequest>,
    ) -> Result<Response<proto::GetMetricsResponse>, Status> {
        let req = request.into_inner();
        let scaled_object = req
            .scaled_object_ref
            .ok_or_else(|| Status::invalid_argument("scaledObjectRef is required"))?;
        let key = workload_key(&scaled_object);

        debug!(workload = %key, "GetMetrics called");

        let entry = self.workload(&key, &scaled_object.scaler_metadata).await?;
        let mut workload = entry.lock().await;

        let replicas = workload
            .config
            .replicas
            .instance_count()
            .await
            .map_err(|e| unavailable(&key, "replica count", e))?;

        let error_rate = workload
            .config
            .metrics
            .error_rate()
            .await
            .map_err(|e| unavailable(&key, "error rate", e))?;

        let queue_length = workload
            .config
            .metrics
            .queue_length()
            .await
            .map_err(|e| unavailable(&key, "queue length", e))?;

        let sample = WorkloadSample {
            queue_length,
            error_rate,
            replicas,
        };
        let bounds = workload.config.bounds;
        let value = workload.engine.evaluate(&sample, bounds);

        info!(
            workload = %key,
            queue_length,
            error_rate,
            replicas,
            metric_value = value,
            "poll evaluated"
        );

        Ok(Response::new(proto::GetMetricsResponse {
            metric_values: vec![proto::MetricValue {
                metric_name: METRIC_NAME.to_string(),
                metric_value: value as i64,
            }],
        }))
    }

    type StreamIsActiveStream = ReceiverStream<Result<proto::IsActiveResponse, Status>>;

    async fn stream_is_active(
        &self,
        request: Request<proto::ScaledObjectRef>,
    ) -> Result<Response<Self::StreamIsActiveStream>, Status> {
        let key = workload_key(&request.into_inner());

        info!(workload = %key, "StreamIsActive called");

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
            // The first tick completes immediately; the stream should only
            // emit after a full interval.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx
                    .send(Ok(proto::IsActiveResponse { result: true }))
                    .await
                    .is_err()
                {
                    debug!(workload = %key, "liveness consumer disconnected");
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use tokio_stream::StreamExt;

    use qscale_backends::{MetricSource, ReplicaSource};
    use qscale_engine::{ReplicaBounds, ScalingConfig};

    struct StaticMetrics {
        queue_length: u64,
        error_rate: u64,
    }

    #[async_trait]
    impl MetricSource for StaticMetrics {
        async fn queue_length(&self) -> Result<u64, BackendError> {
            Ok(self.queue_length)
        }

        async fn error_rate(&self) -> Result<u64, BackendError> {
            Ok(self.error_rate)
        }
    }

    struct StaticReplicas(u32);

    #[async_trait]
    impl ReplicaSource for StaticReplicas {
        async fn instance_count(&self) -> Result<u32, BackendError> {
            Ok(self.0)
        }
    }

    struct FailingReplicas;

    #[async_trait]
    impl ReplicaSource for FailingReplicas {
        async fn instance_count(&self) -> Result<u32, BackendError> {
            Err(BackendError::Malformed("no status".into()))
        }
    }

    fn test_scaling() -> ScalingConfig {
        ScalingConfig {
            target_per_replica: 10,
            error_rate_threshold: 5,
            scale_down_cooldown: Duration::from_secs(60),
        }
    }

    async fn insert_workload(
        service: &ScalerService,
        key: &str,
        metrics: Arc<dyn MetricSource>,
        replicas: Arc<dyn ReplicaSource>,
        bounds: ReplicaBounds,
    ) {
        let config = WorkloadConfig {
            scaling: test_scaling(),
            bounds,
            metrics,
            replicas,
        };
        let engine = DecisionEngine::new(config.scaling.clone());
        service.workloads.lock().await.insert(
            key.to_string(),
            Arc::new(Mutex::new(Workload { config, engine })),
        );
    }

    fn metrics_request(namespace: &str, name: &str) -> Request<proto::GetMetricsRequest> {
        Request::new(proto::GetMetricsRequest {
            scaled_object_ref: Some(proto::ScaledObjectRef {
                name: name.to_string(),
                namespace: namespace.to_string(),
                scaler_metadata: HashMap::new(),
            }),
            metric_name: METRIC_NAME.to_string(),
        })
    }

    fn metric_value(resp: Response<proto::GetMetricsResponse>) -> i64 {
        let values = resp.into_inner().metric_values;
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].metric_name, METRIC_NAME);
        values[0].metric_value
    }

    #[tokio::test]
    async fn is_active_is_constant_true() {
        let service = ScalerService::new(Settings::default());

        let resp = service
            .is_active(Request::new(proto::ScaledObjectRef::default()))
            .await
            .unwrap();
        assert!(resp.into_inner().result);
    }

    #[tokio::test]
    async fn metric_spec_advertises_target() {
        let settings = Settings {
            target_per_replica: 25,
            ..Settings::default()
        };
        let service = ScalerService::new(settings);

        let resp = service
            .get_metric_spec(Request::new(proto::ScaledObjectRef::default()))
            .await
            .unwrap();

        let specs = resp.into_inner().metric_specs;
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].metric_name, "qThreshold");
        assert_eq!(specs[0].target_size, 25);
    }

    #[tokio::test]
    async fn healthy_poll_returns_backlog() {
        let service = ScalerService::new(Settings::default());
        insert_workload(
            &service,
            "default/subscriber",
            Arc::new(StaticMetrics {
                queue_length: 20,
                error_rate: 0,
            }),
            Arc::new(StaticReplicas(1)),
            ReplicaBounds { min: 1, max: 7 },
        )
        .await;

        let resp = service
            .get_metrics(metrics_request("default", "subscriber"))
            .await
            .unwrap();
        assert_eq!(metric_value(resp), 20);
    }

    #[tokio::test]
    async fn throttled_poll_pins_to_floor() {
        let service = ScalerService::new(Settings::default());
        insert_workload(
            &service,
            "default/subscriber",
            Arc::new(StaticMetrics {
                queue_length: 70,
                error_rate: 10,
            }),
            Arc::new(StaticReplicas(2)),
            ReplicaBounds { min: 2, max: 7 },
        )
        .await;

        let resp = service
            .get_metrics(metrics_request("default", "subscriber"))
            .await
            .unwrap();
        assert_eq!(metric_value(resp), 20);
    }

    #[tokio::test]
    async fn backend_failure_fails_the_poll() {
        let service = ScalerService::new(Settings::default());
        insert_workload(
            &service,
            "default/subscriber",
            Arc::new(StaticMetrics {
                queue_length: 20,
                error_rate: 0,
            }),
            Arc::new(FailingReplicas),
            ReplicaBounds { min: 1, max: 7 },
        )
        .await;

        let err = service
            .get_metrics(metrics_request("default", "subscriber"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn missing_scaled_object_ref_is_invalid() {
        let service = ScalerService::new(Settings::default());

        let err = service
            .get_metrics(Request::new(proto::GetMetricsRequest {
                scaled_object_ref: None,
                metric_name: METRIC_NAME.to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn missing_metadata_is_invalid() {
        let service = ScalerService::new(Settings::default());

        // Fresh workload, empty metadata: resolution fails on the first
        // required field.
        let err = service
            .get_metrics(metrics_request("default", "subscriber"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert!(err.message().contains("minReplicas"), "{}", err.message());
    }

    #[tokio::test]
    async fn workloads_do_not_share_hysteresis_state() {
        let service = ScalerService::new(Settings::default());

        // Both workloads are throttled and above their floor; each engine
        // was just constructed, so the cooldown window is still open and
        // each poll re-asserts that workload's own seeded replica count.
        insert_workload(
            &service,
            "default/big",
            Arc::new(StaticMetrics {
                queue_length: 70,
                error_rate: 10,
            }),
            Arc::new(StaticReplicas(5)),
            ReplicaBounds { min: 1, max: 7 },
        )
        .await;
        insert_workload(
            &service,
            "default/small",
            Arc::new(StaticMetrics {
                queue_length: 70,
                error_rate: 10,
            }),
            Arc::new(StaticReplicas(2)),
            ReplicaBounds { min: 1, max: 7 },
        )
        .await;

        let resp = service
            .get_metrics(metrics_request("default", "big"))
            .await
            .unwrap();
        assert_eq!(metric_value(resp), 50);

        let resp = service
            .get_metrics(metrics_request("default", "small"))
            .await
            .unwrap();
        assert_eq!(metric_value(resp), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_stream_emits_on_the_interval() {
        let service = ScalerService::new(Settings::default());

        let resp = service
            .stream_is_active(Request::new(proto::ScaledObjectRef::default()))
            .await
            .unwrap();
        let mut stream = resp.into_inner();

        // Paused clock auto-advances to the first full interval.
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.result);

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.result);

        // Dropping the stream disconnects the consumer; the emitter stops
        // on its next send.
        drop(stream);
    }
}
