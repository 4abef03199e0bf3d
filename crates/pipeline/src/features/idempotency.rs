//! Skipping steps whose work has already been done.
//!
//! An [`IdempotencyFilter`] consults the [`SharedIdempotencyStore`] resolved
//! from the context's resolver. If the step's key is already recorded as
//! completed (or the optional custom check says so) the step is skipped;
//! otherwise, once the step has run without failing, its key is recorded.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use crate::builder::PipelineBuilder;
use crate::context::ExecutionContext;
use crate::errors::{PipelineError, StepResult};
use crate::features::filter::StepFilter;
use crate::inspector::StepContext;

/// Records which operation keys have completed.
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    async fn is_completed(&self, key: &str) -> Result<bool, PipelineError>;

    async fn mark_completed(&self, key: &str) -> StepResult;
}

/// The store type resolved from the resource resolver.
pub type SharedIdempotencyStore = Arc<dyn IdempotencyStore>;

/// Process-local [`IdempotencyStore`].
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    completed: Mutex<HashSet<String>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_completed(&self, key: &str) -> Result<bool, PipelineError> {
        Ok(self.completed.lock().contains(key))
    }

    async fn mark_completed(&self, key: &str) -> StepResult {
        self.completed.lock().insert(key.to_string());
        Ok(())
    }
}

type CompletionCheck = Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, Result<bool, PipelineError>> + Send + Sync>;

/// Skips a step whose key has already completed.
pub struct IdempotencyFilter {
    key: String,
    check_completed: Option<CompletionCheck>,
}

impl IdempotencyFilter {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            check_completed: None,
        }
    }

    /// Adds a custom completion check, consulted when the store has no
    /// record of the key.
    #[must_use]
    pub fn with_check<C, Fut>(mut self, check: C) -> Self
    where
        C: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, PipelineError>> + Send + 'static,
    {
        self.check_completed = Some(Arc::new(move |ctx| check(ctx).boxed()));
        self
    }
}

#[async_trait]
impl StepFilter for IdempotencyFilter {
    async fn before_step(&self, step: &mut StepContext) -> StepResult {
        let store = step.context().resolve::<SharedIdempotencyStore>()?;
        let mut completed = store.is_completed(&self.key).await?;
        if !completed {
            if let Some(check) = &self.check_completed {
                completed = check(step.context().clone()).await?;
            }
        }
        if completed {
            debug!(key = %self.key, step_id = %step.step_id(), "operation already completed; skipping step");
            step.skip();
        }
        Ok(())
    }

    async fn after_step(&self, step: &mut StepContext) -> StepResult {
        // A failure further down the chain does not undo this step's work.
        if step.should_skip() || step.step_failed() {
            return Ok(());
        }
        let store = step.context().resolve::<SharedIdempotencyStore>()?;
        store.mark_completed(&self.key).await
    }
}

impl PipelineBuilder {
    /// Skips the most recently added step if `key` has already completed, and
    /// records `key` once the step itself succeeds, even if a later step
    /// fails.
    pub fn with_idempotency(&mut self, key: impl Into<String>) -> &mut Self {
        let filter = IdempotencyFilter::new(key);
        self.add_filters(|filters| {
            filters.add(filter);
        })
    }

    /// Like [`with_idempotency`](Self::with_idempotency) with an extra
    /// completion check.
    pub fn with_idempotency_check<C, Fut>(&mut self, key: impl Into<String>, check: C) -> &mut Self
    where
        C: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, PipelineError>> + Send + 'static,
    {
        let filter = IdempotencyFilter::new(key).with_check(check);
        self.add_filters(|filters| {
            filters.add(filter);
        })
    }
}
