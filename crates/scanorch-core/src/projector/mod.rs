//! Status Projector: a pure transform from a scan bundle into the locked
//! polling response shape. Spec §4.J / §6.
//!
//! No writes, no I/O: every function here is a total, side-effect-free
//! projection over already-loaded rows.

use std::collections::BTreeMap;

use serde::Serialize;

use scanorch_db::models::{ScanStatus, ServiceExecution, ServiceStatus};
use scanorch_db::queries::scans::ScanBundle;

use crate::plan::SERVICE_CATALOGUE;
use crate::state::Progress;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressView {
    #[serde(rename = "completedServices")]
    pub completed_services: usize,
    #[serde(rename = "totalServices")]
    pub total_services: usize,
    pub percentage: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorView {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryView {
    pub attempts: i32,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: i32,
    #[serde(rename = "canRetry")]
    pub can_retry: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub error: Option<ErrorView>,
    pub retry: RetryView,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetaView {
    pub version: &'static str,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanView {
    #[serde(rename = "scanId")]
    pub scan_id: String,
    pub status: ScanStatus,
    pub url: String,
    #[serde(rename = "startedAt")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub progress: ProgressView,
    pub services: BTreeMap<String, ServiceView>,
    pub meta: MetaView,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResponse {
    pub success: bool,
    pub data: ScanView,
}

/// Project a `failed` service's row into its error and retry view.
fn project_service(svc: Option<&ServiceExecution>) -> ServiceView {
    match svc {
        None => ServiceView {
            status: ServiceStatus::Pending,
            data: None,
            error: None,
            retry: RetryView {
                attempts: 0,
                max_attempts: 0,
                can_retry: false,
            },
        },
        Some(row) => {
            let data = (row.status == ServiceStatus::Success)
                .then(|| row.result.clone())
                .flatten();
            let error = (row.status == ServiceStatus::Failed).then(|| ErrorView {
                code: row.error_code.clone().unwrap_or_default(),
                message: row.error_message.clone().unwrap_or_default(),
                retryable: row.error_retryable.unwrap_or(false),
            });
            ServiceView {
                status: row.status,
                data,
                error,
                retry: RetryView {
                    attempts: row.attempts,
                    max_attempts: row.max_attempts,
                    can_retry: row.can_retry(),
                },
            }
        }
    }
}

/// Project a scan bundle into the locked polling response shape. Every
/// catalogue service appears as a key, whether or not it was requested.
pub fn project(bundle: &ScanBundle) -> ScanResponse {
    let progress = Progress::from_services(&bundle.services);

    let mut services = BTreeMap::new();
    for name in SERVICE_CATALOGUE {
        let row = bundle
            .services
            .iter()
            .find(|s| s.service_name == *name);
        services.insert(name.to_string(), project_service(row));
    }

    ScanResponse {
        success: true,
        data: ScanView {
            scan_id: bundle.scan.id.clone(),
            status: bundle.scan.status,
            url: bundle.scan.submitted_url.clone(),
            started_at: bundle.scan.started_at,
            completed_at: bundle.scan.completed_at,
            progress: ProgressView {
                completed_services: progress.completed,
                total_services: progress.total,
                percentage: progress.percentage(),
            },
            services,
            meta: MetaView {
                version: "1.0",
                cached: bundle.scan.cached,
            },
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressResponse {
    #[serde(rename = "scanId")]
    pub scan_id: String,
    pub status: ScanStatus,
    pub progress: ProgressView,
}

/// Project the lightweight progress-only view (`GET /scan/:id/progress`).
pub fn project_progress(bundle: &ScanBundle) -> ProgressResponse {
    let progress = Progress::from_services(&bundle.services);
    ProgressResponse {
        scan_id: bundle.scan.id.clone(),
        status: bundle.scan.status,
        progress: ProgressView {
            completed_services: progress.completed,
            total_services: progress.total,
            percentage: progress.percentage(),
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryEligibilityEntry {
    pub eligible: bool,
    pub retry: RetryView,
}

/// Project per-service retry eligibility (`GET /scan/:id/retry/status`).
pub fn project_retry_status(bundle: &ScanBundle) -> BTreeMap<String, RetryEligibilityEntry> {
    let mut out = BTreeMap::new();
    for name in SERVICE_CATALOGUE {
        let row = bundle.services.iter().find(|s| s.service_name == *name);
        let view = project_service(row);
        out.insert(
            name.to_string(),
            RetryEligibilityEntry {
                eligible: view.retry.can_retry,
                retry: view.retry,
            },
        );
    }
    out
}
