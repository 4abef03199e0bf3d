//! Step instrumentation.
//!
//! Every compiled step is wrapped by [`instrument`], which runs the
//! pipeline's inspectors around the step body:
//!
//! 1. `before_step` on each inspector in registration order, stopping as soon
//!    as one marks the step as skipped.
//! 2. The step body, or the downstream continuation directly when skipped.
//! 3. On failure, `on_exception` on every inspector.
//! 4. `after_step` on every inspector, in registration order, whether the step
//!    ran, was skipped, or failed.
//!
//! Inspectors registered on a root pipeline are shared by reference with all
//! of its branches, so a single inspector instance observes the whole run.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

use crate::context::{step, ExecutionContext, PipelineStep};
use crate::errors::{PipelineError, StepResult};
use crate::features::filter::StepFilter;
use crate::identifiers::{StepId, StepIndex};

// ---------------------------------------------------------------------------
// Inspector contract
// ---------------------------------------------------------------------------

/// Observer of every step dispatch in a pipeline and its branches.
///
/// All hooks default to doing nothing. A hook returning an error from
/// `before_step` fails the step; errors from `on_exception` are logged and
/// ignored; the first error from `after_step` fails an otherwise successful
/// step.
#[async_trait]
pub trait PipelineInspector: Send + Sync + 'static {
    /// Called before the step body. Call [`StepContext::skip`] to suppress
    /// the body.
    async fn before_step(&self, _step: &mut StepContext) -> StepResult {
        Ok(())
    }

    /// Called after the step, including skipped and failed steps.
    async fn after_step(&self, _step: &mut StepContext) -> StepResult {
        Ok(())
    }

    /// Called when the step (or anything downstream of it) failed.
    async fn on_exception(&self, _step: &mut StepContext, _error: &PipelineError) -> StepResult {
        Ok(())
    }

    /// Pipeline-local inspectors are not copied into branch pipelines.
    fn is_pipeline_local(&self) -> bool {
        false
    }
}

/// A registered inspector, kept both as a trait object and as `Any` so it can
/// be looked up by concrete type.
#[derive(Clone)]
pub(crate) struct InspectorEntry {
    pub(crate) inspector: Arc<dyn PipelineInspector>,
    any: Arc<dyn Any + Send + Sync>,
}

impl InspectorEntry {
    pub(crate) fn new<I: PipelineInspector>(inspector: Arc<I>) -> Self {
        Self {
            any: Arc::clone(&inspector) as Arc<dyn Any + Send + Sync>,
            inspector,
        }
    }

    pub(crate) fn downcast<I: PipelineInspector>(&self) -> Option<Arc<I>> {
        Arc::clone(&self.any).downcast::<I>().ok()
    }
}

// ---------------------------------------------------------------------------
// Per-dispatch context
// ---------------------------------------------------------------------------

/// Static description of a step, fixed when the step is added.
#[derive(Debug, Clone)]
pub(crate) struct StepDescriptor {
    pub(crate) index: StepIndex,
    pub(crate) id: StepId,
    pub(crate) type_name: &'static str,
}

/// What inspectors and filters see for one step dispatch.
pub struct StepContext {
    descriptor: StepDescriptor,
    context: ExecutionContext,
    started: Instant,
    duration: Duration,
    should_skip: bool,
    failed: bool,
    downstream_failed: bool,
    pub(crate) filters: Option<Vec<Arc<dyn StepFilter>>>,
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("step_index", &self.descriptor.index)
            .field("step_id", &self.descriptor.id)
            .field("step_type", &self.descriptor.type_name)
            .field("should_skip", &self.should_skip)
            .field("failed", &self.failed)
            .field("downstream_failed", &self.downstream_failed)
            .finish()
    }
}

impl StepContext {
    pub(crate) fn new(descriptor: StepDescriptor, context: ExecutionContext) -> Self {
        Self {
            descriptor,
            context,
            started: Instant::now(),
            duration: Duration::ZERO,
            should_skip: false,
            failed: false,
            downstream_failed: false,
            filters: None,
        }
    }

    /// Ordinal index of the step.
    pub fn step_index(&self) -> StepIndex {
        self.descriptor.index
    }

    /// Id of the step.
    pub fn step_id(&self) -> &StepId {
        &self.descriptor.id
    }

    /// Name of the type that produced the step.
    pub fn step_type(&self) -> &'static str {
        self.descriptor.type_name
    }

    /// The run's execution context.
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Time since the dispatch started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Duration of the dispatch, available from `on_exception` and
    /// `after_step` onwards.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Suppresses the step body. Downstream steps still run.
    pub fn skip(&mut self) {
        self.should_skip = true;
    }

    /// Sets or clears the skip flag.
    pub fn set_skip(&mut self, skip: bool) {
        self.should_skip = skip;
    }

    /// Whether an inspector has asked for the step body to be suppressed.
    pub fn should_skip(&self) -> bool {
        self.should_skip
    }

    /// Whether the dispatch ended in an error, raised either by the step
    /// itself or by a step downstream of it.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Whether the error that ended the dispatch came from a later step.
    pub fn failed_downstream(&self) -> bool {
        self.failed && self.downstream_failed
    }

    /// Whether the dispatch failed for a reason of its own: a hook, a
    /// filter, cancellation or the step body. Downstream errors do not count.
    pub fn step_failed(&self) -> bool {
        self.failed && !self.downstream_failed
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Wraps `body` with the inspector protocol.
///
/// `continuation` is the step that follows; it is called directly when an
/// inspector skips the body.
pub(crate) fn instrument(
    descriptor: StepDescriptor,
    body: PipelineStep,
    continuation: PipelineStep,
    inspectors: Arc<[Arc<dyn PipelineInspector>]>,
) -> PipelineStep {
    step(move |ctx| {
        let descriptor = descriptor.clone();
        let body = Arc::clone(&body);
        let continuation = Arc::clone(&continuation);
        let inspectors = Arc::clone(&inspectors);
        async move {
            ctx.set_position(descriptor.index, &descriptor.id);
            ctx.take_downstream_failed(descriptor.index);
            let mut step_ctx = StepContext::new(descriptor, ctx.clone());

            let outcome = dispatch(&mut step_ctx, &inspectors, &body, &continuation).await;
            step_ctx.duration = step_ctx.started.elapsed();
            step_ctx.downstream_failed = ctx.take_downstream_failed(step_ctx.descriptor.index);

            if let Err(error) = &outcome {
                step_ctx.failed = true;
                for inspector in inspectors.iter() {
                    if let Err(hook_error) = inspector.on_exception(&mut step_ctx, error).await {
                        warn!(
                            step_id = %step_ctx.step_id(),
                            error = %hook_error,
                            "on_exception hook failed"
                        );
                    }
                }
            }

            let mut after_error = None;
            for inspector in inspectors.iter() {
                if let Err(hook_error) = inspector.after_step(&mut step_ctx).await {
                    if after_error.is_none() {
                        after_error = Some(hook_error);
                    } else {
                        warn!(step_id = %step_ctx.step_id(), error = %hook_error, "after_step hook failed");
                    }
                }
            }

            match (outcome, after_error) {
                (Ok(()), None) => Ok(()),
                (Ok(()), Some(hook_error)) => Err(hook_error),
                (Err(error), hook_error) => {
                    if let Some(hook_error) = hook_error {
                        warn!(step_id = %step_ctx.step_id(), error = %hook_error, "after_step hook failed");
                    }
                    Err(error)
                }
            }
        }
    })
}

async fn dispatch(
    step_ctx: &mut StepContext,
    inspectors: &[Arc<dyn PipelineInspector>],
    body: &PipelineStep,
    continuation: &PipelineStep,
) -> StepResult {
    step_ctx.context.check_cancelled()?;

    for inspector in inspectors {
        inspector.before_step(step_ctx).await?;
        if step_ctx.should_skip {
            break;
        }
    }

    let ctx = step_ctx.context.clone();
    if step_ctx.should_skip {
        continuation(ctx).await
    } else {
        body(ctx).await
    }
}
