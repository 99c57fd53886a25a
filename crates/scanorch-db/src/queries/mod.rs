//! Database query functions, one module per entity. No business logic lives
//! here: callers (in `scanorch-core`) are responsible for interpreting
//! results and enforcing invariants.

pub mod cache;
pub mod metrics;
pub mod scans;
pub mod services;
pub mod usage;
pub mod users;
