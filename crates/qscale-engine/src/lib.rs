//! qscale-engine — the scale-controlling metric computation.
//!
//! Converts a work-queue backlog, an observed 429 error rate, and the
//! current replica count of a workload into one synthetic metric value.
//! A polling controller divides that value by the per-replica target to
//! obtain its desired replica count, so the engine steers scaling without
//! ever actuating it.
//!
//! # Decision order
//!
//! ```text
//! errors below threshold          → backlog passes through unchanged
//! replicas at or below the floor  → target * min_replicas   (pin)
//! scale-down cooldown still open  → held_replicas * target  (anti-flap)
//! otherwise                       → (replicas - 1) * target (scale down by one)
//! ```
//!
//! The engine owns its hysteresis state: the timestamp of its last
//! scale-down decision and the replica count it asked for. Elapsed time is
//! always measured against the engine's own clock, never taken from the
//! caller.

pub mod engine;

pub use engine::{
    DecisionEngine, InvalidConfig, ReplicaBounds, ScalingConfig, WorkloadSample,
};
