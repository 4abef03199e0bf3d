//! Builder extensions layered on the core step chain.
//!
//! Each module adds `PipelineBuilder` methods (and, where needed, filters or
//! inspectors) for one feature.

pub mod actions;
pub mod branching;
pub mod diagnostics;
pub mod filter;
pub mod idempotency;
pub mod middleware;
pub mod options;
pub mod scope;
pub mod skip;
pub mod stream;
