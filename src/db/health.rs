use serde::{Deserialize, Serialize};

use crate::types::{Result, SealError};

/// Overall verdict of a [`HealthCheck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Every check passed.
    Healthy,
    /// Something needs attention but data is safe.
    Degraded,
    /// Writes failed or data is damaged.
    Unhealthy,
}

/// One check and its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Check {
    /// A WAL flush failed and the log rejects further commits.
    WalFailure {
        /// Table owning the log.
        table: String,
        /// Failure message, if any.
        message: Option<String>,
        /// Whether the log is usable.
        healthy: bool,
    },
    /// Checksum or authentication failures seen so far.
    CorruptionErrors {
        /// Number of damaged units.
        count: u64,
        /// Whether none were seen.
        healthy: bool,
    },
    /// Crypto scratch buffers not returned to the pool.
    OutstandingBuffers {
        /// Buffers rented and not yet returned.
        count: u64,
        /// Whether every buffer was returned.
        healthy: bool,
    },
    /// Hybrid overlay entries waiting for compaction.
    OverlayBacklog {
        /// Table owning the overlay.
        table: String,
        /// Entries not yet folded into pages.
        entries: usize,
        /// Backlog size considered healthy.
        threshold: usize,
        /// Whether the backlog is within the threshold.
        healthy: bool,
    },
}

impl Check {
    fn healthy(&self) -> bool {
        match self {
            Check::WalFailure { healthy, .. }
            | Check::CorruptionErrors { healthy, .. }
            | Check::OutstandingBuffers { healthy, .. }
            | Check::OverlayBacklog { healthy, .. } => *healthy,
        }
    }

    fn is_fatal(&self) -> bool {
        matches!(
            self,
            Check::WalFailure { .. } | Check::CorruptionErrors { .. }
        )
    }
}

/// Aggregated result of the health checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Worst status among the checks.
    pub status: HealthStatus,
    /// Individual results in the order they ran.
    pub checks: Vec<Check>,
}

impl HealthCheck {
    /// Starts out healthy with no checks.
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
        }
    }

    /// Records a check, downgrading the status when it failed.
    pub fn add_check(&mut self, check: Check) {
        if !check.healthy() {
            self.status = if check.is_fatal() {
                HealthStatus::Unhealthy
            } else {
                match self.status {
                    HealthStatus::Unhealthy => HealthStatus::Unhealthy,
                    _ => HealthStatus::Degraded,
                }
            };
        }
        self.checks.push(check);
    }

    /// Whether every check passed.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Pretty-printed JSON report.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| SealError::InvalidOwned(format!("health report: {err}")))
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
