//! Branches: sub-pipelines created and compiled while a step runs.
//!
//! Every branch follows the same recipe:
//!
//! 1. a fresh [`PipelineBuilder`] bound to the running context's resolver,
//!    carrying every shared inspector of the running pipeline;
//! 2. the caller's configuration callback populates it;
//! 3. it is compiled and run against a new context derived from the parent
//!    (same run id, cancellation and resolver; empty step state).
//!
//! Branches are rebuilt on every execution of the enclosing step; nothing is
//! cached between executions.
//!
//! Fan-out runs one branch per input on a [`tokio::task::JoinSet`], at most
//! [`ConcurrencyOptions::limit`] at a time. The first failure is returned and
//! the remaining branches are detached, unless
//! [`ConcurrencyOptions::wait_for_all`] asks to join every branch first.

pub mod channel;
pub mod per_input;

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::{JoinError, JoinSet};
use tracing::debug;

use crate::builder::PipelineBuilder;
use crate::context::{step, ExecutionContext, PipelineStep};
use crate::errors::{PipelineError, StepResult};
use crate::features::actions::report_or_propagate;
use crate::types::ConcurrencyOptions;

/// Populates a branch builder.
pub type ConfigureBranch = Arc<dyn Fn(&mut PipelineBuilder) + Send + Sync>;

/// Populates a branch builder for one input.
pub type ConfigureBranchWith<T> = Arc<dyn Fn(&mut PipelineBuilder, T) + Send + Sync>;

type AsyncCondition = Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, Result<bool, PipelineError>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Branch execution
// ---------------------------------------------------------------------------

/// Builds a branch with `configure` and runs it to completion as a child of
/// `ctx`.
pub async fn run_branch<F>(ctx: &ExecutionContext, configure: F) -> StepResult
where
    F: FnOnce(&mut PipelineBuilder),
{
    let pipeline = {
        let mut builder = PipelineBuilder::for_branch(ctx);
        configure(&mut builder);
        builder.build()?
    };
    debug!(depth = ctx.depth() + 1, "running branch");
    pipeline.run_branch(ctx).await
}

/// Runs one branch per item, at most `options.limit()` at a time.
pub async fn fan_out<T>(
    ctx: &ExecutionContext,
    items: Vec<T>,
    options: &ConcurrencyOptions,
    configure: ConfigureBranchWith<T>,
) -> StepResult
where
    T: Send + 'static,
{
    let limit = options.limit();
    let total = items.len();
    debug!(branches = total, limit, wait_for_all = options.wait_for_all, "fan-out starting");

    let mut pending = items.into_iter();
    let mut running = JoinSet::new();
    let mut first_error: Option<PipelineError> = None;

    loop {
        let launching = first_error.is_none() || options.wait_for_all;
        while launching && running.len() < limit {
            if ctx.is_cancelled() {
                first_error.get_or_insert(PipelineError::Cancelled);
                break;
            }
            let Some(item) = pending.next() else {
                break;
            };
            let ctx = ctx.clone();
            let configure = Arc::clone(&configure);
            running.spawn(async move { run_branch(&ctx, |builder| configure(builder, item)).await });
        }

        let Some(joined) = running.join_next().await else {
            break;
        };
        if let Err(err) = joined.unwrap_or_else(|join_err| Err(branch_panicked(join_err))) {
            debug!(error = %err, "fan-out branch failed");
            first_error.get_or_insert(err);
        }
        if first_error.is_some() && !options.wait_for_all {
            running.detach_all();
            break;
        }
        if ctx.is_cancelled() && !options.wait_for_all {
            first_error.get_or_insert(PipelineError::Cancelled);
            running.detach_all();
            break;
        }
    }

    debug!(branches = total, failed = first_error.is_some(), "fan-out joined");
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn branch_panicked(err: JoinError) -> PipelineError {
    let message = if err.is_panic() {
        let payload = err.into_panic();
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string())
    } else {
        "branch task was cancelled".to_string()
    };
    PipelineError::BranchPanicked { message }
}

// ---------------------------------------------------------------------------
// Builder surface
// ---------------------------------------------------------------------------

impl PipelineBuilder {
    /// Runs a branch on every execution, then continues the chain.
    pub fn use_branch<C>(&mut self, configure: C) -> &mut Self
    where
        C: Fn(&mut PipelineBuilder) + Send + Sync + 'static,
    {
        let configure: ConfigureBranch = Arc::new(configure);
        self.push_step("Branch", move |next: PipelineStep| {
            step(move |ctx| {
                let configure = Arc::clone(&configure);
                let next = Arc::clone(&next);
                async move {
                    run_branch(&ctx, |builder| configure(builder)).await?;
                    next(ctx).await
                }
            })
        })
    }

    /// Runs a branch only when `predicate` holds, then continues the chain.
    pub fn use_branch_when<P, C>(&mut self, predicate: P, configure: C) -> &mut Self
    where
        P: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
        C: Fn(&mut PipelineBuilder) + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.use_branch_when_async(
            move |ctx| futures::future::ready(Ok(predicate(&ctx))),
            configure,
        )
    }

    /// Async form of [`use_branch_when`](Self::use_branch_when). Predicate
    /// failures fail the step.
    pub fn use_branch_when_async<P, Fut, C>(&mut self, predicate: P, configure: C) -> &mut Self
    where
        P: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, PipelineError>> + Send + 'static,
        C: Fn(&mut PipelineBuilder) + Send + Sync + 'static,
    {
        let predicate: AsyncCondition = Arc::new(move |ctx| predicate(ctx).boxed());
        let configure: ConfigureBranch = Arc::new(configure);
        self.push_step("ConditionalBranch", move |next: PipelineStep| {
            step(move |ctx| {
                let predicate = Arc::clone(&predicate);
                let configure = Arc::clone(&configure);
                let next = Arc::clone(&next);
                async move {
                    if evaluate(&predicate, &ctx).await? {
                        run_branch(&ctx, |builder| configure(builder)).await?;
                    }
                    next(ctx).await
                }
            })
        })
    }

    /// Conditional branch whose predicate or branch failure is reported to
    /// `on_error` instead of failing the run.
    pub fn try_branch<P, Fut, C, E>(&mut self, predicate: P, configure: C, on_error: E) -> &mut Self
    where
        P: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, PipelineError>> + Send + 'static,
        C: Fn(&mut PipelineBuilder) + Send + Sync + 'static,
        E: Fn(&PipelineError) + Send + Sync + 'static,
    {
        let predicate: AsyncCondition = Arc::new(move |ctx| predicate(ctx).boxed());
        let configure: ConfigureBranch = Arc::new(configure);
        let on_error = Arc::new(on_error);
        self.push_step("TryBranch", move |next: PipelineStep| {
            step(move |ctx| {
                let predicate = Arc::clone(&predicate);
                let configure = Arc::clone(&configure);
                let on_error = Arc::clone(&on_error);
                let next = Arc::clone(&next);
                async move {
                    let outcome = match evaluate(&predicate, &ctx).await {
                        Ok(true) => run_branch(&ctx, |builder| configure(builder)).await,
                        Ok(false) => Ok(()),
                        Err(err) => Err(err),
                    };
                    report_or_propagate(&ctx, outcome, on_error.as_ref())?;
                    next(ctx).await
                }
            })
        })
    }

    /// Runs one branch per item, all at once, then continues the chain.
    pub fn use_parallel_branches<T, C>(&mut self, items: Vec<T>, configure: C) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        C: Fn(&mut PipelineBuilder, T) + Send + Sync + 'static,
    {
        let items = Arc::new(items);
        self.use_parallel_branches_from_async(
            move |_| futures::future::ready(Ok(items.as_ref().clone())),
            configure,
        )
    }

    /// Like [`use_parallel_branches`](Self::use_parallel_branches), with the
    /// items produced by `source` on every execution.
    pub fn use_parallel_branches_from<T, S, C>(&mut self, source: S, configure: C) -> &mut Self
    where
        T: Send + 'static,
        S: Fn(&ExecutionContext) -> Vec<T> + Send + Sync + 'static,
        C: Fn(&mut PipelineBuilder, T) + Send + Sync + 'static,
    {
        let source = Arc::new(source);
        self.use_parallel_branches_from_async(
            move |ctx| futures::future::ready(Ok(source(&ctx))),
            configure,
        )
    }

    /// Like [`use_parallel_branches_from`](Self::use_parallel_branches_from)
    /// with an async, fallible item source.
    pub fn use_parallel_branches_from_async<T, S, Fut, C>(&mut self, source: S, configure: C) -> &mut Self
    where
        T: Send + 'static,
        S: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, PipelineError>> + Send + 'static,
        C: Fn(&mut PipelineBuilder, T) + Send + Sync + 'static,
    {
        let source = Arc::new(source);
        let configure: ConfigureBranchWith<T> = Arc::new(configure);
        self.push_step("ParallelBranches", move |next: PipelineStep| {
            step(move |ctx| {
                let source = Arc::clone(&source);
                let configure = Arc::clone(&configure);
                let next = Arc::clone(&next);
                async move {
                    let items = source(ctx.clone()).await?;
                    fan_out(&ctx, items, &ConcurrencyOptions::unbounded(), configure).await?;
                    next(ctx).await
                }
            })
        })
    }
}

async fn evaluate(predicate: &AsyncCondition, ctx: &ExecutionContext) -> Result<bool, PipelineError> {
    predicate(ctx.clone()).await.map_err(|err| match err {
        PipelineError::PredicateEvaluation { .. } | PipelineError::Cancelled => err,
        other => PipelineError::predicate(other),
    })
}
