//! Node configuration.
//!
//! Three timeouts live at different layers and are tuned independently:
//! barrier staleness, task-loop inactivity, and the notifier attempt budget.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{GridError, GridResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Notifier tick period.
    pub tick_interval_ms: u64,
    /// Longest silence between two heartbeats of a running node.
    pub max_notify_interval_ms: u64,
    /// Notifier attempt budget once done; `-1` retries forever.
    pub notify_max_attempts: i64,
    /// A non-terminal node silent for longer is excluded from a barrier.
    pub node_stale_timeout_ms: u64,
    /// Periodic aggregate re-check while a barrier waits.
    pub barrier_recheck_interval_ms: u64,
    pub task_poll_interval_ms: u64,
    /// Task loop stops after this long without any task request.
    pub inactive_coord_timeout_ms: u64,
    /// Reply timeout of wait-all remote calls.
    pub dispatch_timeout_ms: u64,
    pub task_progress_poll_interval_ms: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            max_notify_interval_ms: 5_000,
            notify_max_attempts: -1,
            node_stale_timeout_ms: 30_000,
            barrier_recheck_interval_ms: 1_000,
            task_poll_interval_ms: 5_000,
            inactive_coord_timeout_ms: 120_000,
            dispatch_timeout_ms: 2_000,
            task_progress_poll_interval_ms: 1_000,
        }
    }
}

impl GridConfig {
    pub fn from_json_str(s: &str) -> GridResult<Self> {
        let cfg: GridConfig = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> GridResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GridError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> GridResult<()> {
        let durations = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("max_notify_interval_ms", self.max_notify_interval_ms),
            ("node_stale_timeout_ms", self.node_stale_timeout_ms),
            ("barrier_recheck_interval_ms", self.barrier_recheck_interval_ms),
            ("task_poll_interval_ms", self.task_poll_interval_ms),
            ("inactive_coord_timeout_ms", self.inactive_coord_timeout_ms),
            ("dispatch_timeout_ms", self.dispatch_timeout_ms),
            ("task_progress_poll_interval_ms", self.task_progress_poll_interval_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, v)| *v == 0) {
            return Err(GridError::Config(format!("{name} must be greater than zero")));
        }
        if self.notify_max_attempts == 0 || self.notify_max_attempts < -1 {
            return Err(GridError::Config(format!(
                "notify_max_attempts must be -1 or positive, got {}",
                self.notify_max_attempts
            )));
        }
        if self.notify_max_attempts > i64::from(u32::MAX) {
            return Err(GridError::Config(format!(
                "notify_max_attempts must be at most {}, got {}",
                u32::MAX,
                self.notify_max_attempts
            )));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn max_notify_interval(&self) -> Duration {
        Duration::from_millis(self.max_notify_interval_ms)
    }

    /// `None` when unbounded.
    pub fn notify_max_attempts(&self) -> Option<u32> {
        u32::try_from(self.notify_max_attempts).ok()
    }

    pub fn node_stale_timeout(&self) -> Duration {
        Duration::from_millis(self.node_stale_timeout_ms)
    }

    pub fn barrier_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.barrier_recheck_interval_ms)
    }

    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }

    pub fn inactive_coord_timeout(&self) -> Duration {
        Duration::from_millis(self.inactive_coord_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn task_progress_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_progress_poll_interval_ms)
    }
}
