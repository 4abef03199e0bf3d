//! One-shot actions that run inside a step and then continue the chain.
//!
//! The `try_*` forms report failures to a callback and carry on; they never
//! swallow [`PipelineError::Cancelled`].

use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use crate::builder::PipelineBuilder;
use crate::context::{step, ExecutionContext, PipelineStep};
use crate::errors::{PipelineError, StepResult};

/// Routes a failed action outcome: cancellation propagates, anything else is
/// logged and handed to `on_error`.
pub(crate) fn report_or_propagate(
    ctx: &ExecutionContext,
    outcome: StepResult,
    on_error: &(dyn Fn(&PipelineError) + Send + Sync),
) -> StepResult {
    match outcome {
        Err(err) if !err.is_cancelled() => {
            warn!(
                step_id = %ctx.current_step_id(),
                error = %err,
                "error handled by try construct; continuing"
            );
            on_error(&err);
            Ok(())
        }
        other => other,
    }
}

impl PipelineBuilder {
    /// Runs `action`, then the rest of the chain.
    pub fn run<A>(&mut self, action: A) -> &mut Self
    where
        A: Fn(&ExecutionContext) + Send + Sync + 'static,
    {
        let action = Arc::new(action);
        self.push_step("Run", move |next: PipelineStep| {
            step(move |ctx| {
                action(&ctx);
                next(ctx)
            })
        })
    }

    /// Awaits `action`, then runs the rest of the chain.
    pub fn run_async<A, Fut>(&mut self, action: A) -> &mut Self
    where
        A: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        let action = Arc::new(action);
        self.push_step("RunAsync", move |next: PipelineStep| {
            step(move |ctx| {
                let action = Arc::clone(&action);
                let next = Arc::clone(&next);
                async move {
                    action(ctx.clone()).await?;
                    next(ctx).await
                }
            })
        })
    }

    /// Runs a fallible `action`; a failure goes to `on_error` and the chain
    /// continues.
    pub fn try_run<A, E>(&mut self, action: A, on_error: E) -> &mut Self
    where
        A: Fn(&ExecutionContext) -> StepResult + Send + Sync + 'static,
        E: Fn(&PipelineError) + Send + Sync + 'static,
    {
        let action = Arc::new(action);
        let on_error = Arc::new(on_error);
        self.push_step("TryRun", move |next: PipelineStep| {
            step(move |ctx| {
                let outcome = report_or_propagate(&ctx, action(&ctx), on_error.as_ref());
                let next = Arc::clone(&next);
                async move {
                    outcome?;
                    next(ctx).await
                }
            })
        })
    }

    /// Async form of [`try_run`](Self::try_run).
    pub fn try_run_async<A, Fut, E>(&mut self, action: A, on_error: E) -> &mut Self
    where
        A: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
        E: Fn(&PipelineError) + Send + Sync + 'static,
    {
        let action = Arc::new(action);
        let on_error = Arc::new(on_error);
        self.push_step("TryRunAsync", move |next: PipelineStep| {
            step(move |ctx| {
                let action = Arc::clone(&action);
                let on_error = Arc::clone(&on_error);
                let next = Arc::clone(&next);
                async move {
                    let outcome = action(ctx.clone()).await;
                    report_or_propagate(&ctx, outcome, on_error.as_ref())?;
                    next(ctx).await
                }
            })
        })
    }

    /// Runs `action` only when `predicate` holds; the chain always continues.
    pub fn when<P, A>(&mut self, predicate: P, action: A) -> &mut Self
    where
        P: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
        A: Fn(&ExecutionContext) + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        let action = Arc::new(action);
        self.push_step("When", move |next: PipelineStep| {
            step(move |ctx| {
                if predicate(&ctx) {
                    action(&ctx);
                }
                next(ctx)
            })
        })
    }

    /// Like [`when`](Self::when) with a fallible action whose failure goes to
    /// `on_error`.
    pub fn try_when<P, A, E>(&mut self, predicate: P, action: A, on_error: E) -> &mut Self
    where
        P: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
        A: Fn(&ExecutionContext) -> StepResult + Send + Sync + 'static,
        E: Fn(&PipelineError) + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        let action = Arc::new(action);
        let on_error = Arc::new(on_error);
        self.push_step("TryWhen", move |next: PipelineStep| {
            step(move |ctx| {
                let outcome = if predicate(&ctx) { action(&ctx) } else { Ok(()) };
                let outcome = report_or_propagate(&ctx, outcome, on_error.as_ref());
                let next = Arc::clone(&next);
                async move {
                    outcome?;
                    next(ctx).await
                }
            })
        })
    }
}
