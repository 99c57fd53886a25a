//! Scan Lifecycle: the state machine over a scan and its service rows.
//! Spec §4.F.
//!
//! ```text
//! pending   -> running                (orchestrator starts fan-out)
//! pending   -> failed                 (pre-dispatch fatal error)
//! running   -> completed              (every service success)
//! running   -> partial                (>=1 success and >=1 failed)
//! running   -> failed                 (every service failed)
//! completed/partial/failed -> running (explicit retry admitted)
//! ```
//!
//! Any other transition is rejected. The terminal status is always computed
//! from the service row set, never trusted from ambient memory.

pub mod dispatch;

use scanorch_db::models::{ScanStatus, ServiceExecution, ServiceStatus};
use scanorch_db::queries::scans::TransitionScanError;

/// Whether `from -> to` is a legal edge in the scan state graph.
pub fn is_valid_scan_transition(from: ScanStatus, to: ScanStatus) -> bool {
    use ScanStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Failed)
            | (Running, Completed)
            | (Running, Partial)
            | (Running, Failed)
            | (Completed, Running)
            | (Partial, Running)
            | (Failed, Running)
    )
}

/// Compute the terminal scan status from a fully-settled service row set
/// (every row in `{success, failed}`). Spec §4.F / §4.H step 6.
///
/// Panics if any row is not yet terminal; callers must only invoke this
/// once all dispatched work has settled.
pub fn terminal_status(services: &[ServiceExecution]) -> ScanStatus {
    debug_assert!(
        services.iter().all(|s| s.status.is_terminal()),
        "terminal_status called with non-terminal service rows"
    );

    let success = services
        .iter()
        .filter(|s| s.status == ServiceStatus::Success)
        .count();
    let failed = services
        .iter()
        .filter(|s| s.status == ServiceStatus::Failed)
        .count();

    match (success > 0, failed > 0) {
        (true, false) => ScanStatus::Completed,
        (true, true) => ScanStatus::Partial,
        (false, true) => ScanStatus::Failed,
        (false, false) => ScanStatus::Failed,
    }
}

/// Progress projection over a service row set: spec §3/§4.J.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn from_services(services: &[ServiceExecution]) -> Self {
        let total = services.len();
        let completed = services.iter().filter(|s| s.status.is_terminal()).count();
        Self { completed, total }
    }

    /// `floor(100 * completed / total)`, clamped to `[0, 100]`.
    pub fn percentage(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        let pct = (100 * self.completed) / self.total;
        pct.min(100) as u32
    }
}

/// Re-exported so callers can match on the repository's transition error
/// without importing `scanorch_db` directly.
pub type TransitionError = TransitionScanError;
