//! Transactional data access for the scan orchestrator: connection pool
//! setup, runtime migrations, row models, and one `queries::*` module per
//! entity. No business logic lives in this crate — see `scanorch-core`.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
