//! Control loop settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings of the capacity reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub interval_secs: u64,
    /// Nodes of over-allocation tolerated before a warning is logged.
    pub oscillation_slack: u32,
    /// Seed for the weighted balancer; entropy when unset.
    pub rng_seed: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            oscillation_slack: 3,
            rng_seed: None,
        }
    }
}

impl ControllerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Settings of the drain task scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskSchedulerConfig {
    pub interval_secs: u64,
    /// Upper bound on concurrent readiness checks and completion traces.
    pub concurrency: usize,
    /// Report the IPs of finished tasks back to the resource broker.
    pub report_consumed_ips: bool,
    pub rng_seed: Option<u64>,
}

impl Default for TaskSchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            concurrency: 10,
            report_consumed_ips: true,
            rng_seed: None,
        }
    }
}

impl TaskSchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

pub(crate) fn seeded_rng(seed: Option<u64>) -> rand::rngs::StdRng {
    use rand::SeedableRng;
    match seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_entropy(),
    }
}
