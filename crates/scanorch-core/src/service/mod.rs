//! Service collaborator interface -- the contract the orchestrator requires
//! of each analysis plugin (accessibility, backlinks, schema, ...).
//!
//! # Architecture
//!
//! ```text
//! Executor
//!     |
//!     v
//! ServiceRegistry --get("accessibility")--> &dyn Service
//!     |
//!     |   run(normalizedUrl, config) -> Result<ServiceOutcome, ServiceError>
//! ```
//!
//! Concrete service bodies (the actual accessibility checker, backlinks
//! scraper, etc.) are out of scope; this crate only defines the interface
//! and in-memory fakes for testing the executor/orchestrator around it.

pub mod fakes;
pub mod registry;
pub mod trait_def;

pub use fakes::{FakeService, FlakyService, SlowService};
pub use registry::ServiceRegistry;
pub use trait_def::{ErrorKind, Service, ServiceConfig, ServiceError, ServiceOutcome};
