//! Skip conditions: filters that suppress a step body when a predicate holds.
//!
//! Conditions stack on one step in registration order; the first one that
//! holds skips the step and later ones are not evaluated.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use crate::builder::PipelineBuilder;
use crate::context::ExecutionContext;
use crate::errors::{PipelineError, StepResult};
use crate::features::filter::StepFilter;
use crate::inspector::StepContext;

type SyncPredicate = Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>;
type AsyncPredicate = Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, Result<bool, PipelineError>> + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&PipelineError) + Send + Sync>;

enum Predicate {
    Sync(SyncPredicate),
    Async(AsyncPredicate),
}

impl Predicate {
    async fn evaluate(&self, ctx: &ExecutionContext) -> Result<bool, PipelineError> {
        match self {
            Self::Sync(predicate) => Ok(predicate(ctx)),
            Self::Async(predicate) => predicate(ctx.clone()).await.map_err(|err| match err {
                PipelineError::PredicateEvaluation { .. } | PipelineError::Cancelled => err,
                other => PipelineError::predicate(other),
            }),
        }
    }
}

/// Skips its step when the predicate returns `true`.
///
/// With an error callback attached, a failing predicate is reported to the
/// callback and the step is skipped instead of failing the run.
pub struct SkipConditionFilter {
    predicate: Predicate,
    on_error: Option<ErrorCallback>,
}

impl SkipConditionFilter {
    pub fn new<P>(predicate: P) -> Self
    where
        P: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Predicate::Sync(Arc::new(predicate)),
            on_error: None,
        }
    }

    pub fn new_async<P, Fut>(predicate: P) -> Self
    where
        P: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, PipelineError>> + Send + 'static,
    {
        Self {
            predicate: Predicate::Async(Arc::new(move |ctx| predicate(ctx).boxed())),
            on_error: None,
        }
    }

    /// Reports predicate failures to `on_error` and skips instead of failing.
    #[must_use]
    pub fn or_skip_on_error<E>(mut self, on_error: E) -> Self
    where
        E: Fn(&PipelineError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }
}

#[async_trait]
impl StepFilter for SkipConditionFilter {
    async fn before_step(&self, step: &mut StepContext) -> StepResult {
        let outcome = self.predicate.evaluate(step.context()).await;
        match outcome {
            Ok(true) => step.skip(),
            Ok(false) => {}
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => match &self.on_error {
                Some(on_error) => {
                    warn!(step_id = %step.step_id(), error = %err, "skip condition failed; skipping step");
                    on_error(&err);
                    step.skip();
                }
                None => return Err(err),
            },
        }
        Ok(())
    }
}

impl PipelineBuilder {
    /// Skips the most recently added step when `predicate` holds.
    pub fn with_skip_condition<P>(&mut self, predicate: P) -> &mut Self
    where
        P: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.add_filters(|filters| {
            filters.add(SkipConditionFilter::new(predicate));
        })
    }

    /// Async form of [`with_skip_condition`](Self::with_skip_condition).
    /// Predicate errors fail the step.
    pub fn with_skip_condition_async<P, Fut>(&mut self, predicate: P) -> &mut Self
    where
        P: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, PipelineError>> + Send + 'static,
    {
        self.add_filters(|filters| {
            filters.add(SkipConditionFilter::new_async(predicate));
        })
    }

    /// Like [`with_skip_condition_async`](Self::with_skip_condition_async),
    /// but a failing predicate is reported to `on_error` and skips the step.
    pub fn with_try_skip_condition<P, Fut, E>(&mut self, predicate: P, on_error: E) -> &mut Self
    where
        P: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, PipelineError>> + Send + 'static,
        E: Fn(&PipelineError) + Send + Sync + 'static,
    {
        self.add_filters(|filters| {
            filters.add(SkipConditionFilter::new_async(predicate).or_skip_on_error(on_error));
        })
    }
}
