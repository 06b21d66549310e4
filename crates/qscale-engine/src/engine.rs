//! Decision engine — backlog-driven scaling with error-rate hysteresis.
//!
//! While the 429 rate stays below the configured threshold the raw backlog
//! drives proportional scaling directly. Once the rate crosses the
//! threshold the engine starts walking the workload down one replica at a
//! time, holding each decision for a cooldown interval so the controller
//! cannot flap between sizes.

use std::time::{Duration, Instant};

use tracing::debug;

/// Scaling knobs, immutable per engine instance.
#[derive(Debug, Clone)]
pub struct ScalingConfig {
    /// Desired backlog per replica. Doubles as the steady-state metric
    /// divisor and the scale-down decrement unit.
    pub target_per_replica: u64,
    /// 429 rate at or above which scale-down throttling activates.
    pub error_rate_threshold: u64,
    /// Minimum interval between successive scale-down decisions.
    pub scale_down_cooldown: Duration,
}

/// Configuration rejected by [`ScalingConfig::validate`] or
/// [`ReplicaBounds::validate`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidConfig {
    #[error("target_per_replica must be positive")]
    ZeroTarget,

    #[error("min_replicas must be positive")]
    ZeroMinReplicas,

    #[error("min_replicas ({min}) exceeds max_replicas ({max})")]
    BoundsInverted { min: u32, max: u32 },
}

impl ScalingConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.target_per_replica == 0 {
            return Err(InvalidConfig::ZeroTarget);
        }
        Ok(())
    }
}

/// Replica floor and ceiling for a workload.
///
/// `max` is carried and validated but never read by the engine: the
/// polling controller applies its own max-replica clamp downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaBounds {
    pub min: u32,
    pub max: u32,
}

impl ReplicaBounds {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.min == 0 {
            return Err(InvalidConfig::ZeroMinReplicas);
        }
        if self.min > self.max {
            return Err(InvalidConfig::BoundsInverted {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

/// One poll's worth of observed signals.
///
/// The three values are sampled independently and may reflect slightly
/// different instants.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadSample {
    /// Pending units of work in the queue.
    pub queue_length: u64,
    /// Observed rate of 429 (throttled) responses.
    pub error_rate: u64,
    /// Current replica count of the workload.
    pub replicas: u32,
}

/// Stateful decision engine for a single workload.
///
/// One engine exists per scaled workload. Callers must serialize
/// [`evaluate`](Self::evaluate) calls for the same workload: the algorithm
/// reads then writes its hysteresis state.
pub struct DecisionEngine {
    config: ScalingConfig,
    /// When the engine last decided to scale down.
    last_scale_down_at: Instant,
    /// Replica count requested by the last scale-down decision.
    /// `None` until the first evaluation seeds it.
    last_scale_down_replicas: Option<u32>,
}

impl DecisionEngine {
    pub fn new(config: ScalingConfig) -> Self {
        Self {
            config,
            last_scale_down_at: Instant::now(),
            last_scale_down_replicas: None,
        }
    }

    /// Evaluate one poll and return the metric value.
    ///
    /// The returned value is interpreted downstream as
    /// `desired_replicas * target_per_replica`.
    pub fn evaluate(&mut self, sample: &WorkloadSample, bounds: ReplicaBounds) -> u64 {
        self.evaluate_at(sample, bounds, Instant::now())
    }

    /// The replica count held by the last scale-down decision, if any.
    pub fn held_replicas(&self) -> Option<u32> {
        self.last_scale_down_replicas
    }

    fn evaluate_at(
        &mut self,
        sample: &WorkloadSample,
        bounds: ReplicaBounds,
        now: Instant,
    ) -> u64 {
        let elapsed = now.saturating_duration_since(self.last_scale_down_at);

        debug!(
            queue_length = sample.queue_length,
            error_rate = sample.error_rate,
            replicas = sample.replicas,
            min_replicas = bounds.min,
            max_replicas = bounds.max,
            since_scale_down = ?elapsed,
            "evaluating"
        );

        // First evaluation seeds the held count with the live replica count.
        let held = *self.last_scale_down_replicas.get_or_insert(sample.replicas);

        if sample.error_rate < self.config.error_rate_threshold {
            debug!(
                value = sample.queue_length,
                "error rate below threshold, backlog passes through"
            );
            return sample.queue_length;
        }

        if sample.replicas <= bounds.min {
            let value = self.config.target_per_replica * u64::from(bounds.min);
            debug!(value, min = bounds.min, "at replica floor, pinning");
            return value;
        }

        if elapsed < self.config.scale_down_cooldown {
            let value = u64::from(held) * self.config.target_per_replica;
            debug!(value, held, "cooldown open, holding previous decision");
            return value;
        }

        // Errors at/above threshold, above the floor, cooldown elapsed:
        // ask for exactly one replica fewer than observed.
        self.last_scale_down_at = now;
        let requested = sample.replicas - 1;
        self.last_scale_down_replicas = Some(requested);
        let value = u64::from(requested) * self.config.target_per_replica;
        debug!(value, requested, "scaling down by one replica");
        value
    }
}
