//! Core orchestration logic for the scan service: plan limits, URL
//! normalization, the service collaborator interface, the scan lifecycle
//! state machine, plan enforcement, caching, retries, the async
//! orchestrator, the status projector, and observability.
//!
//! `scanorch-db` owns persistence; everything here is pure logic or
//! thin coordination over that repository layer.

pub mod cache;
pub mod enforcement;
pub mod executor;
pub mod normalize;
pub mod observability;
pub mod orchestrator;
pub mod plan;
pub mod projector;
pub mod retry;
pub mod service;
pub mod state;
