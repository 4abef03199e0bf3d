//! Middleware and job units resolved from the resource resolver.
//!
//! Both are looked up from the context's *current* resolver on every
//! execution, so a preceding [`PipelineBuilder::use_new_scope`] step changes
//! which instance is used.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::builder::PipelineBuilder;
use crate::context::{step, ExecutionContext, PipelineStep};
use crate::errors::{PipelineError, StepResult};
use crate::features::actions::report_or_propagate;

/// A unit that wraps the rest of the chain.
#[async_trait]
pub trait PipelineMiddleware: Send + Sync + 'static {
    /// Does its work and decides whether (and when) to call `next`.
    async fn execute(&self, next: PipelineStep, ctx: ExecutionContext) -> StepResult;
}

/// A unit of work that only needs the run's cancellation token.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn execute(&self, cancellation: CancellationToken) -> StepResult;
}

impl PipelineBuilder {
    /// Adds a step that resolves middleware `M` and runs it.
    pub fn use_middleware<M: PipelineMiddleware>(&mut self) -> &mut Self {
        self.push_step(std::any::type_name::<M>(), |next: PipelineStep| {
            step(move |ctx| {
                let next = Arc::clone(&next);
                async move {
                    let middleware = ctx.resolve::<M>()?;
                    middleware.execute(next, ctx).await
                }
            })
        })
    }

    /// Adds a step that runs the given middleware instance.
    pub fn use_middleware_instance<M: PipelineMiddleware>(&mut self, middleware: M) -> &mut Self {
        let middleware = Arc::new(middleware);
        self.push_step(std::any::type_name::<M>(), move |next: PipelineStep| {
            step(move |ctx| {
                let middleware = Arc::clone(&middleware);
                let next = Arc::clone(&next);
                async move { middleware.execute(next, ctx).await }
            })
        })
    }

    /// Adds a step that resolves job `J`, runs it, then continues the chain.
    pub fn run_job<J: Job>(&mut self) -> &mut Self {
        self.push_step(std::any::type_name::<J>(), |next: PipelineStep| {
            step(move |ctx| {
                let next = Arc::clone(&next);
                async move {
                    let job = ctx.resolve::<J>()?;
                    job.execute(ctx.cancellation_token().clone()).await?;
                    next(ctx).await
                }
            })
        })
    }

    /// Like [`run_job`](Self::run_job), but a failing job is reported to
    /// `on_error` and the chain continues. Resolution failures still fail the
    /// step.
    pub fn try_run_job<J, E>(&mut self, on_error: E) -> &mut Self
    where
        J: Job,
        E: Fn(&PipelineError) + Send + Sync + 'static,
    {
        let on_error = Arc::new(on_error);
        self.push_step(std::any::type_name::<J>(), move |next: PipelineStep| {
            step(move |ctx| {
                let on_error = Arc::clone(&on_error);
                let next = Arc::clone(&next);
                async move {
                    let job = ctx.resolve::<J>()?;
                    let outcome = job.execute(ctx.cancellation_token().clone()).await;
                    report_or_propagate(&ctx, outcome, on_error.as_ref())?;
                    next(ctx).await
                }
            })
        })
    }
}
