//! qscale-server — the polling surface of the decision service.
//!
//! Implements the external-scaler gRPC protocol over the decision engine:
//!
//! - `GetMetricSpec` advertises the `qThreshold` metric and its
//!   per-replica target.
//! - `GetMetrics` resolves the workload's configuration on first contact
//!   (validating metadata and constructing the metric/replica backends,
//!   held thereafter as data), fetches the three signals, and runs the
//!   engine.
//! - `IsActive` / `StreamIsActive` report constant liveness.
//!
//! Each scaled workload owns its own engine and backends, keyed by the
//! scaled object's `namespace/name`; polls for the same workload are
//! serialized, polls for different workloads run in parallel.

pub mod config;
pub mod server;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("externalscaler");
}

pub use config::{ComputeBackend, ConfigError, MetricsBackend, Settings};
pub use server::ScalerService;
