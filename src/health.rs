//! Backend health tracking and filtering.
//!
//! [`HealthMonitor`] keeps per-backend status records fed by request outcomes.
//! [`filter_healthy_backends`] narrows a backend list before discovery using
//! whichever [`HealthStatusProvider`] is configured.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::vmcp::{Backend, BackendHealthStatus};
use crate::{Error, Result};

/// Consecutive failures before a backend is marked unhealthy
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

/// Reports a backend's current operational state
pub trait HealthStatusProvider: Send + Sync {
    /// Current status. Errors when the backend is not tracked.
    fn status(&self, backend_id: &str) -> Result<BackendHealthStatus>;
}

/// How strictly discovery treats unhealthy backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum HealthFilterMode {
    /// Only healthy and unknown backends
    #[default]
    Fail,
    /// Degraded backends are included too
    BestEffort,
}

impl HealthFilterMode {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::BestEffort => "best_effort",
        }
    }

    fn includes(self, status: BackendHealthStatus) -> bool {
        match status {
            BackendHealthStatus::Healthy | BackendHealthStatus::Unknown => true,
            BackendHealthStatus::Degraded => self == Self::BestEffort,
            BackendHealthStatus::Unhealthy | BackendHealthStatus::Unauthenticated => false,
        }
    }
}

impl FromStr for HealthFilterMode {
    type Err = std::convert::Infallible;

    /// Unrecognized strings fall back to [`HealthFilterMode::Fail`].
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "best_effort" => Self::BestEffort,
            _ => Self::Fail,
        })
    }
}

impl From<String> for HealthFilterMode {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl fmt::Display for HealthFilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Narrow `backends` to those usable under `mode`.
///
/// Without a provider every backend is kept. A backend whose status lookup
/// fails (not yet tracked) is kept as well.
#[must_use]
pub fn filter_healthy_backends(
    backends: &[Backend],
    provider: Option<&dyn HealthStatusProvider>,
    mode: HealthFilterMode,
) -> Vec<Backend> {
    let Some(provider) = provider else {
        return backends.to_vec();
    };

    backends
        .iter()
        .filter(|backend| match provider.status(&backend.id) {
            Err(e) => {
                debug!(backend = %backend.id, error = %e, "No health status, including backend");
                true
            }
            Ok(status) => {
                let keep = mode.includes(status);
                if !keep {
                    debug!(
                        backend = %backend.id,
                        status = %status,
                        mode = %mode,
                        "Excluding backend from discovery"
                    );
                }
                keep
            }
        })
        .cloned()
        .collect()
}

// ============================================================================
// In-memory monitor
// ============================================================================

#[derive(Debug, Clone)]
struct HealthRecord {
    status: BackendHealthStatus,
    consecutive_failures: u32,
    success_count: u64,
    failure_count: u64,
    last_checked: DateTime<Utc>,
    last_error: Option<String>,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            status: BackendHealthStatus::Unknown,
            consecutive_failures: 0,
            success_count: 0,
            failure_count: 0,
            last_checked: Utc::now(),
            last_error: None,
        }
    }
}

/// Snapshot of one backend's health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    /// Backend ID
    pub backend_id: String,
    /// Current status
    pub status: BackendHealthStatus,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Total successes
    pub success_count: u64,
    /// Total failures
    pub failure_count: u64,
    /// When the status last changed or was confirmed
    pub last_checked: DateTime<Utc>,
    /// Most recent failure message
    pub last_error: Option<String>,
}

/// In-memory [`HealthStatusProvider`] driven by request outcomes.
pub struct HealthMonitor {
    records: RwLock<HashMap<String, HealthRecord>>,
    unhealthy_threshold: u32,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_UNHEALTHY_THRESHOLD)
    }
}

impl HealthMonitor {
    /// Monitor that marks a backend unhealthy after `unhealthy_threshold`
    /// consecutive failures (minimum 1).
    #[must_use]
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Start tracking a backend with status `unknown`
    pub fn track(&self, backend_id: &str) {
        self.records
            .write()
            .entry(backend_id.to_string())
            .or_insert_with(HealthRecord::new);
    }

    /// Stop tracking a backend
    pub fn untrack(&self, backend_id: &str) {
        self.records.write().remove(backend_id);
    }

    /// Record a successful call. Recovers unhealthy or degraded backends.
    pub fn record_success(&self, backend_id: &str) {
        let mut records = self.records.write();
        let record = records
            .entry(backend_id.to_string())
            .or_insert_with(HealthRecord::new);

        record.success_count += 1;
        record.consecutive_failures = 0;
        record.last_checked = Utc::now();
        if record.status != BackendHealthStatus::Healthy {
            if record.status != BackendHealthStatus::Unknown {
                info!(backend = %backend_id, "Backend recovered");
            }
            record.status = BackendHealthStatus::Healthy;
        }
    }

    /// Record a failed call. The first failure degrades a healthy backend;
    /// reaching the threshold marks it unhealthy.
    pub fn record_failure(&self, backend_id: &str, error: &str) {
        let mut records = self.records.write();
        let record = records
            .entry(backend_id.to_string())
            .or_insert_with(HealthRecord::new);

        record.failure_count += 1;
        record.consecutive_failures += 1;
        record.last_checked = Utc::now();
        record.last_error = Some(error.to_string());

        if record.consecutive_failures >= self.unhealthy_threshold {
            if record.status != BackendHealthStatus::Unhealthy {
                warn!(
                    backend = %backend_id,
                    consecutive_failures = record.consecutive_failures,
                    "Backend marked unhealthy"
                );
            }
            record.status = BackendHealthStatus::Unhealthy;
        } else if record.status == BackendHealthStatus::Healthy {
            record.status = BackendHealthStatus::Degraded;
        }
    }

    /// Force a status (e.g. `unauthenticated` after a 401 from the backend)
    pub fn set_status(&self, backend_id: &str, status: BackendHealthStatus) {
        let mut records = self.records.write();
        let record = records
            .entry(backend_id.to_string())
            .or_insert_with(HealthRecord::new);
        record.status = status;
        record.last_checked = Utc::now();
        debug!(backend = %backend_id, status = %status, "Health status set");
    }

    /// Snapshot of every tracked backend, sorted by ID
    #[must_use]
    pub fn summary(&self) -> Vec<HealthSummary> {
        let mut summary: Vec<HealthSummary> = self
            .records
            .read()
            .iter()
            .map(|(id, r)| HealthSummary {
                backend_id: id.clone(),
                status: r.status,
                consecutive_failures: r.consecutive_failures,
                success_count: r.success_count,
                failure_count: r.failure_count,
                last_checked: r.last_checked,
                last_error: r.last_error.clone(),
            })
            .collect();
        summary.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        summary
    }
}

impl HealthStatusProvider for HealthMonitor {
    fn status(&self, backend_id: &str) -> Result<BackendHealthStatus> {
        self.records
            .read()
            .get(backend_id)
            .map(|r| r.status)
            .ok_or_else(|| Error::BackendNotFound(format!("{backend_id} is not monitored")))
    }
}
