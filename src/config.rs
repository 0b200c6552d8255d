//! Engine configuration.
//!
//! Plain data with defaults; tune with the `with_*` setters.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a sluice engine instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Period of the coordinator's repeating barrier timer.
    pub barrier_interval: Duration,
    /// Every `checkpoint_interval`-th committed batch is persisted as a full
    /// state snapshot instead of an incremental delta. Must be at least 1.
    pub checkpoint_interval: i64,
    /// Period of the error detector's liveness poll loop.
    pub probe_interval: Duration,
    /// Timeout for a single liveness probe.
    pub probe_timeout: Duration,
    /// Directory for per-unit durable state logs. `None` keeps logs in memory.
    pub log_dir: Option<PathBuf>,
    /// Number of stateless units in the middle tier.
    pub stateless_units: usize,
    /// Number of stateful units in the terminal tier.
    pub stateful_units: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            barrier_interval: Duration::from_secs(10),
            checkpoint_interval: 5,
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            log_dir: None,
            stateless_units: 1,
            stateful_units: 1,
        }
    }
}

impl EngineConfig {
    /// Sets the barrier timer period.
    pub fn with_barrier_interval(mut self, d: Duration) -> Self {
        self.barrier_interval = d;
        self
    }

    /// Sets the checkpoint interval (full snapshot every n-th batch).
    pub fn with_checkpoint_interval(mut self, n: i64) -> Self {
        self.checkpoint_interval = n;
        self
    }

    /// Sets the liveness poll period.
    pub fn with_probe_interval(mut self, d: Duration) -> Self {
        self.probe_interval = d;
        self
    }

    /// Sets the liveness probe timeout.
    pub fn with_probe_timeout(mut self, d: Duration) -> Self {
        self.probe_timeout = d;
        self
    }

    /// Sets the durable log directory.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Sets the number of stateless units.
    pub fn with_stateless_units(mut self, n: usize) -> Self {
        self.stateless_units = n;
        self
    }

    /// Sets the number of stateful units.
    pub fn with_stateful_units(mut self, n: usize) -> Self {
        self.stateful_units = n;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.checkpoint_interval < 1 {
            return Err(format!(
                "checkpoint_interval must be at least 1, got {}",
                self.checkpoint_interval
            ));
        }
        if self.stateful_units == 0 {
            return Err("at least one stateful unit is required".to_string());
        }
        Ok(())
    }
}
