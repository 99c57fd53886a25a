use std::env;
use std::time::Duration;

/// Database configuration.
///
/// Reads from the `SCANORCH_DATABASE_URL` environment variable, falling back
/// to `postgresql://localhost:5432/scanorch` when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
}

impl DbConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/scanorch";

    /// Build a config from the environment.
    ///
    /// Priority: `SCANORCH_DATABASE_URL` env var, then the compile-time default.
    pub fn from_env() -> Self {
        let database_url = env::var("SCANORCH_DATABASE_URL")
            .unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        Self { database_url }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Extract the database name from the URL.
    ///
    /// Returns `None` if the URL cannot be parsed or has no path component.
    pub fn database_name(&self) -> Option<&str> {
        // URLs look like: postgresql://host:port/dbname or postgres://host:port/dbname
        self.database_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    /// Return a URL pointing at the `postgres` maintenance database on the
    /// same host. Used to issue `CREATE DATABASE` when the target DB does not
    /// yet exist.
    pub fn maintenance_url(&self) -> String {
        match self.database_url.rfind('/') {
            Some(pos) => {
                let mut url = self.database_url[..pos].to_owned();
                url.push_str("/postgres");
                url
            }
            None => self.database_url.clone(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Per-service timeout overrides, keyed by catalogue service name.
#[derive(Debug, Clone, Default)]
pub struct ServiceTimeouts {
    overrides: Vec<(String, Duration)>,
}

impl ServiceTimeouts {
    /// Resolve the timeout for a given service, falling back to `default`.
    pub fn resolve(&self, service: &str, default: Duration) -> Duration {
        self.overrides
            .iter()
            .find(|(name, _)| name == service)
            .map(|(_, d)| *d)
            .unwrap_or(default)
    }

    fn from_env(catalogue: &[&str]) -> Self {
        let mut overrides = Vec::new();
        for name in catalogue {
            let env_name = format!(
                "SCANORCH_SERVICE_TIMEOUT_{}",
                name.to_uppercase().replace('-', "_")
            );
            if let Ok(raw) = env::var(&env_name) {
                if let Ok(secs) = raw.parse::<u64>() {
                    overrides.push((name.to_string(), Duration::from_secs(secs)));
                }
            }
        }
        Self { overrides }
    }
}

/// Cache TTL per plan tier, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtlConfig {
    pub guest: Duration,
    pub free: Duration,
    pub pro: Duration,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            guest: Duration::from_secs(6 * 3600),
            free: Duration::from_secs(12 * 3600),
            pro: Duration::from_secs(24 * 3600),
        }
    }
}

impl CacheTtlConfig {
    fn from_env() -> Self {
        let default = Self::default();
        Self {
            guest: env_secs("SCANORCH_CACHE_TTL_GUEST_SECS", default.guest),
            free: env_secs("SCANORCH_CACHE_TTL_FREE_SECS", default.free),
            pro: env_secs("SCANORCH_CACHE_TTL_PRO_SECS", default.pro),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}

/// Fully resolved runtime configuration for the orchestrator process.
///
/// Every knob is environment-driven, resolved once at startup. See
/// `SPEC_FULL.md` §[AMBIENT] D for the full list of variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub scan_timeout: Duration,
    pub default_service_timeout: Duration,
    pub service_timeouts: ServiceTimeouts,
    pub cache_ttl: CacheTtlConfig,
    pub cache_sweep_interval: Duration,
    pub normalize_force_https: bool,
    pub strip_tracking_params: bool,
    pub cors_origins: Vec<String>,
}

/// The deployment-fixed catalogue of recognized service names.
pub const SERVICE_CATALOGUE: &[&str] = &[
    "accessibility",
    "duplicateContent",
    "backlinks",
    "schema",
    "multiLanguage",
    "rankTracker",
];

impl Config {
    pub fn from_env() -> Self {
        Self {
            db: DbConfig::from_env(),
            scan_timeout: env_secs("SCANORCH_SCAN_TIMEOUT_SECS", Duration::from_secs(120)),
            default_service_timeout: env_secs(
                "SCANORCH_SERVICE_TIMEOUT_SECS",
                Duration::from_secs(30),
            ),
            service_timeouts: ServiceTimeouts::from_env(SERVICE_CATALOGUE),
            cache_ttl: CacheTtlConfig::from_env(),
            cache_sweep_interval: env_secs("SCANORCH_CACHE_SWEEP_SECS", Duration::from_secs(1800)),
            normalize_force_https: env_bool("SCANORCH_NORMALIZE_FORCE_HTTPS", true),
            strip_tracking_params: env_bool("SCANORCH_STRIP_TRACKING_PARAMS", true),
            cors_origins: env::var("SCANORCH_CORS_ORIGINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
