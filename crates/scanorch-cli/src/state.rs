//! Shared application state handed to every HTTP handler: the pool, the
//! service registry, the observability sink, and the resolved runtime
//! configuration.

use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use scanorch_core::cache::SweeperHandle;
use scanorch_core::observability::ObservabilitySink;
use scanorch_core::orchestrator::OrchestratorConfig;
use scanorch_core::service::{FakeService, ServiceRegistry};
use scanorch_db::config::Config;

pub struct AppState {
    pub pool: PgPool,
    pub registry: ServiceRegistry,
    pub sink: Arc<ObservabilitySink>,
    pub orchestrator_config: OrchestratorConfig,
    pub cache_ttl: scanorch_db::config::CacheTtlConfig,
    pub normalize_opts: scanorch_core::normalize::NormalizeOptions,
    pub cors_origins: Vec<String>,
    pub sweeper: SweeperHandle,
    pub environment: String,
}

/// Build the service registry that backs a running orchestrator process.
///
/// Real collaborator implementations (the actual accessibility auditor,
/// backlink crawler, and so on) are out of scope here; each catalogue name
/// is backed by a deterministic [`FakeService`] until pluggable real
/// adapters are wired in. See `DESIGN.md`.
pub fn bootstrap_registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    for name in scanorch_core::plan::SERVICE_CATALOGUE {
        registry.register(FakeService::succeeding(name));
    }
    registry
}

/// Assemble `AppState` from resolved configuration and an open pool, and
/// spawn the background cache sweeper.
pub fn build(
    pool: PgPool,
    config: &Config,
    cancel: CancellationToken,
) -> (Arc<AppState>, tokio::task::JoinHandle<()>) {
    let sink = Arc::new(ObservabilitySink::with_pool("production", pool.clone()));

    let (sweeper_join, sweeper) = scanorch_core::cache::spawn_sweeper(
        pool.clone(),
        config.cache_sweep_interval,
        cancel,
    );

    let state = Arc::new(AppState {
        pool,
        registry: bootstrap_registry(),
        sink,
        orchestrator_config: OrchestratorConfig {
            scan_timeout: config.scan_timeout,
            default_service_timeout: config.default_service_timeout,
            service_timeouts: config.service_timeouts.clone(),
        },
        cache_ttl: config.cache_ttl,
        normalize_opts: scanorch_core::normalize::NormalizeOptions {
            force_https: config.normalize_force_https,
            strip_tracking_params: config.strip_tracking_params,
        },
        cors_origins: config.cors_origins.clone(),
        sweeper,
        environment: "production".to_string(),
    });

    (state, sweeper_join)
}
