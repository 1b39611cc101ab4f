//! Controller configuration.

use std::time::Duration;

use crate::machine::MachinePolicy;

/// Consecutive failures that move the controller to `Error`.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Time between status polls while waiting.
    pub poll_interval: Duration,
    /// Pause before re-joining after the backend reports `idle`.
    pub rejoin_delay: Duration,
    pub failure_threshold: u32,
    /// Persisted records older than this are ignored on start.
    pub resume_max_age: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            poll_interval: secs_from_env("WAITROOM_POLL_INTERVAL", Duration::from_secs(5)),
            rejoin_delay: secs_from_env("WAITROOM_REJOIN_DELAY", Duration::from_secs(1)),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            resume_max_age: secs_from_env("WAITROOM_RESUME_MAX_AGE", Duration::from_secs(3600)),
        }
    }
}

impl AdmissionConfig {
    pub(crate) fn policy(&self) -> MachinePolicy {
        MachinePolicy {
            failure_threshold: self.failure_threshold.max(1),
            rejoin_delay: self.rejoin_delay,
        }
    }
}

fn secs_from_env(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}
