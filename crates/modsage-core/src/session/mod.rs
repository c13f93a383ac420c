//! Session pooling against the model server.
//!
//! A session is one client bound to one model. Sessions move through
//! `Created -> Healthy <-> Unhealthy -> Evicted`: they are opened on first
//! unmet demand, marked unhealthy by a failed probe or request, and disposed
//! after an idle threshold or once unhealthy.

mod manager;
mod types;

pub use manager::{SessionLease, SessionManager};
pub use types::{HealthStatus, SessionInfo, SessionState, SessionStatistics};
