//! Snapshots exposed by the session manager.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Health of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Passed its last probe (or was just created).
    Healthy,
    /// Failed a probe or a request; disposed at the next opportunity.
    Unhealthy,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    /// Opaque session id.
    pub id: Uuid,
    /// Model the session is bound to.
    pub model: String,
    /// When the session was opened.
    pub created_at: DateTime<Utc>,
    /// When the session was last returned.
    pub last_used_at: DateTime<Utc>,
    /// Current health.
    pub state: SessionState,
    /// Whether the session is currently loaned out.
    pub on_loan: bool,
    /// Loans served so far.
    pub request_count: u64,
    /// Accumulated time spent on loan.
    pub busy_duration: Duration,
}

/// Result of a health check pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct HealthStatus {
    /// Sessions probed.
    pub total: usize,
    /// Sessions that answered in time.
    pub healthy: usize,
    /// Sessions that failed or timed out.
    pub unhealthy: usize,
    /// One line per failed probe.
    pub issues: Vec<String>,
}

impl HealthStatus {
    /// Returns `true` if every probed session is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.unhealthy == 0
    }
}

/// Aggregate pool statistics.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SessionStatistics {
    /// Sessions currently tracked.
    pub active_sessions: usize,
    /// Of those, how many are on loan.
    pub sessions_on_loan: usize,
    /// Sessions opened since the manager was created.
    pub total_created: u64,
    /// Loans completed since the manager was created.
    pub total_requests: u64,
    /// Mean age of the tracked sessions.
    pub average_session_duration: Duration,
    /// Tracked sessions per model.
    pub sessions_per_model: BTreeMap<String, usize>,
}
