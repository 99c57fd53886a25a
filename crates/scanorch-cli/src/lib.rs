//! Library surface exposing the HTTP layer and shared state so integration
//! tests under `tests/` can drive `build_router` directly.

pub mod serve_cmd;
pub mod state;
