use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
}

impl ScanStatus {
    /// Terminal scan states: completed, partial, failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Failed)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ScanStatus {
    type Err = ScanStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            other => Err(ScanStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ScanStatus`] string.
#[derive(Debug, Clone)]
pub struct ScanStatusParseError(pub String);

impl fmt::Display for ScanStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid scan status: {:?}", self.0)
    }
}

impl std::error::Error for ScanStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single service execution within a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl ServiceStatus {
    /// Terminal per-service states, the ones that count toward progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ServiceStatus {
    type Err = ServiceStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(ServiceStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ServiceStatus`] string.
#[derive(Debug, Clone)]
pub struct ServiceStatusParseError(pub String);

impl fmt::Display for ServiceStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid service status: {:?}", self.0)
    }
}

impl std::error::Error for ServiceStatusParseError {}

// ---------------------------------------------------------------------------

/// A subscriber's plan tier, as recognized by the Plan Registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Guest,
    Free,
    Pro,
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Guest => "guest",
            Self::Free => "free",
            Self::Pro => "pro",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanTier {
    type Err = PlanTierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guest" => Ok(Self::Guest),
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            other => Err(PlanTierParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlanTier`] string.
#[derive(Debug, Clone)]
pub struct PlanTierParseError(pub String);

impl fmt::Display for PlanTierParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid plan tier: {:?}", self.0)
    }
}

impl std::error::Error for PlanTierParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// The owning identity of a scan or usage counter: either a registered user
/// or, for anonymous callers, their IP address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    User(Uuid),
    Ip(String),
}

impl Identity {
    /// The key used for usage-counter and scan ownership lookups.
    pub fn key(&self) -> String {
        match self {
            Self::User(id) => id.to_string(),
            Self::Ip(ip) => ip.clone(),
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }
}

/// A scan row. Exactly one of `user_id` / `owner_ip` is non-null.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Scan {
    pub id: String,
    pub submitted_url: String,
    pub normalized_url: String,
    pub fingerprint: String,
    pub user_id: Option<Uuid>,
    pub owner_ip: Option<String>,
    pub plan: PlanTier,
    pub status: ScanStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cached: bool,
    pub total_execution_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Scan {
    pub fn identity(&self) -> Identity {
        match (self.user_id, &self.owner_ip) {
            (Some(id), _) => Identity::User(id),
            (None, Some(ip)) => Identity::Ip(ip.clone()),
            (None, None) => unreachable!("scan row violates user_id/owner_ip invariant"),
        }
    }
}

/// A single service's execution row within a scan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ServiceExecution {
    pub scan_id: String,
    pub service_name: String,
    pub status: ServiceStatus,
    pub result: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_retryable: Option<bool>,
    pub execution_ms: Option<i64>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ServiceExecution {
    /// Whether this service is eligible for another retry attempt.
    pub fn can_retry(&self) -> bool {
        self.status == ServiceStatus::Failed
            && self.error_retryable == Some(true)
            && self.attempts < self.max_attempts
    }
}

/// A cache entry keyed by URL+service-set fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub scan_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A registered user. Guest callers (identified by IP) have no row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub plan: PlanTier,
    pub subscription_active: bool,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Daily usage counters for a (user-or-ip, date) pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageCounter {
    pub identity_key: String,
    pub usage_date: NaiveDate,
    pub scans_used: i32,
    pub retries_used: i32,
    pub downloads_used: i32,
}

/// Append-only analytical row for a finalized scan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScanMetric {
    pub id: i64,
    pub scan_id: String,
    pub user_type: String,
    pub plan: PlanTier,
    pub url: String,
    pub status: ScanStatus,
    pub cached: bool,
    pub total_execution_ms: Option<i64>,
    pub services_executed: i32,
    pub services_failed: i32,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only analytical row for a single service execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ServiceMetric {
    pub id: i64,
    pub scan_id: String,
    pub service_name: String,
    pub status: ServiceStatus,
    pub execution_ms: Option<i64>,
    pub retry_attempts: i32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
