//! Conduit: an in-process async pipeline engine.
//!
//! A pipeline is an ordered chain of asynchronous steps. Each step receives
//! the step that follows it and decides whether and when to call it. Steps
//! can be observed by inspectors, decorated by per-step filters, skipped by
//! conditions, and forked into branches that run sequentially, concurrently
//! over a set of inputs, or as producer/consumer groups around a channel.
//!
//! ## Architectural Layer
//!
//! **Library.** No process wiring lives here: logging subscribers and
//! configuration loading belong to the binary that embeds the engine. The
//! crate only emits `tracing` events.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`StepId`, `StepIndex`, `RunId`, `PipelineName`) |
//! | [`types`] | Settings and value types (`ConcurrencyOptions`, `ChannelOptions`, `Timestamp`) |
//! | [`errors`] | `PipelineError` and the `StepResult` alias |
//! | [`resolver`] | Resource resolver boundary and the bundled `ServiceProvider` |
//! | [`context`] | `ExecutionContext`, step state, `PipelineStep` |
//! | [`inspector`] | Inspector protocol and per-dispatch `StepContext` |
//! | [`builder`] | `PipelineBuilder` and chain compilation |
//! | [`pipeline`] | Compiled `Pipeline` and its run entry points |
//! | [`channel`] | MPMC channel used by channel topologies |
//! | [`registry`] | Named, lazily built pipelines |
//! | [`features`] | Filters, skip conditions, options, branching, scopes, middleware, streams, idempotency, diagnostics |

pub mod builder;
pub mod channel;
pub mod context;
pub mod errors;
pub mod features;
pub mod identifiers;
pub mod inspector;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use builder::{PipelineBuilder, StepFactory};
pub use channel::{channel, ChannelError, ChannelReader, ChannelWriter};
pub use context::{step, ExecutionContext, PipelineStep};
pub use errors::{BoxError, PipelineError, StepResult};
pub use features::branching::per_input::{chunk_items, AwaitingInput, AwaitingInputs};
pub use features::branching::{fan_out, run_branch, ConfigureBranch, ConfigureBranchWith};
pub use features::diagnostics::{
    ConcurrencyMonitorInspector, ConcurrencyReport, ExecutionEvent, LoggingInspector, StepConcurrency, StepTiming,
    TimelineEntry, TimingInspector,
};
pub use features::filter::{
    FilterCallback, FilterExecutionInspector, FilterFactory, FilterRegistry, StepFilter, StepFilters,
};
pub use features::idempotency::{
    IdempotencyFilter, IdempotencyStore, InMemoryIdempotencyStore, SharedIdempotencyStore,
};
pub use features::middleware::{Job, PipelineMiddleware};
pub use features::options::StepOptions;
pub use features::skip::SkipConditionFilter;
pub use identifiers::{PipelineName, RunId, StepId, StepIndex};
pub use inspector::{PipelineInspector, StepContext};
pub use pipeline::Pipeline;
pub use registry::PipelineRegistry;
pub use resolver::{AnyResource, Lifetime, ResourceResolver, ResourceScope, ServiceCollection, ServiceProvider};
pub use types::{ChannelOptions, ConcurrencyOptions, FullMode, Timestamp};

// Used by async trait implementations downstream (inspectors, filters, middleware, jobs).
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
