//! Per-step filters.
//!
//! A filter is a before/after decorator bound to one step index. Filters are
//! kept in a [`FilterRegistry`] and executed by a single
//! [`FilterExecutionInspector`] attached to the pipeline:
//!
//! - `before_step` runs the step's filters in registration order and stops at
//!   the first one that skips the step;
//! - `after_step` runs all of them in reverse registration order.
//!
//! Filters are attached to the step added immediately before
//! [`PipelineBuilder::add_filters`] is called.
//!
//! The filter inspector is local to its pipeline: branches get their own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;

use crate::builder::PipelineBuilder;
use crate::context::{ExecutionContext, PipelineStep};
use crate::errors::{PipelineError, StepResult};
use crate::identifiers::StepIndex;
use crate::inspector::{PipelineInspector, StepContext};

/// A before/after decorator for one step.
#[async_trait]
pub trait StepFilter: Send + Sync + 'static {
    async fn before_step(&self, _step: &mut StepContext) -> StepResult {
        Ok(())
    }

    async fn after_step(&self, _step: &mut StepContext) -> StepResult {
        Ok(())
    }
}

/// Produces the filter instance used for one dispatch.
pub type FilterFactory = Arc<dyn Fn(&ExecutionContext) -> Result<Arc<dyn StepFilter>, PipelineError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Filter factories keyed by the index of the step they decorate.
#[derive(Default)]
pub struct FilterRegistry {
    filters: HashMap<StepIndex, Vec<FilterFactory>>,
}

impl FilterRegistry {
    /// Registration handle for the step at `index`.
    pub fn for_step(&mut self, index: StepIndex) -> StepFilters<'_> {
        StepFilters { registry: self, index }
    }

    /// Number of filters registered for `index`.
    pub fn count(&self, index: StepIndex) -> usize {
        self.filters.get(&index).map_or(0, Vec::len)
    }

    fn factories(&self, index: StepIndex) -> Vec<FilterFactory> {
        self.filters.get(&index).cloned().unwrap_or_default()
    }
}

/// Adds filters to one step.
pub struct StepFilters<'a> {
    registry: &'a mut FilterRegistry,
    index: StepIndex,
}

impl StepFilters<'_> {
    /// The step these filters decorate.
    pub fn step_index(&self) -> StepIndex {
        self.index
    }

    /// Adds a factory that creates the filter for each dispatch.
    pub fn add_factory(&mut self, factory: FilterFactory) -> &mut Self {
        self.registry.filters.entry(self.index).or_default().push(factory);
        self
    }

    /// Adds a filter instance shared by every dispatch of the step.
    pub fn add<F: StepFilter>(&mut self, filter: F) -> &mut Self {
        self.add_shared(Arc::new(filter))
    }

    /// Adds a shared filter instance.
    pub fn add_shared(&mut self, filter: Arc<dyn StepFilter>) -> &mut Self {
        self.add_factory(Arc::new(move |_: &ExecutionContext| Ok(Arc::clone(&filter))))
    }

    /// Adds a filter created by `factory` on every dispatch.
    pub fn add_with<F, C>(&mut self, factory: C) -> &mut Self
    where
        F: StepFilter,
        C: Fn() -> F + Send + Sync + 'static,
    {
        self.add_factory(Arc::new(move |_: &ExecutionContext| {
            Ok(Arc::new(factory()) as Arc<dyn StepFilter>)
        }))
    }

    /// Adds the filter of type `F`, resolved from the context's current
    /// resolver on every dispatch.
    pub fn add_from_services<F: StepFilter>(&mut self) -> &mut Self {
        self.add_factory(Arc::new(|ctx: &ExecutionContext| {
            ctx.resolve::<F>().map(|filter| filter as Arc<dyn StepFilter>)
        }))
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Bridges the filter registry into the inspector protocol.
#[derive(Default)]
pub struct FilterExecutionInspector {
    registry: RwLock<FilterRegistry>,
}

impl FilterExecutionInspector {
    /// Runs `f` against the registry.
    pub fn with_registry<R>(&self, f: impl FnOnce(&mut FilterRegistry) -> R) -> R {
        f(&mut self.registry.write())
    }

    fn instantiate(&self, step: &StepContext) -> Result<Vec<Arc<dyn StepFilter>>, PipelineError> {
        let factories = self.registry.read().factories(step.step_index());
        factories.iter().map(|factory| factory(step.context())).collect()
    }
}

#[async_trait]
impl PipelineInspector for FilterExecutionInspector {
    async fn before_step(&self, step: &mut StepContext) -> StepResult {
        let filters = self.instantiate(step)?;
        step.filters = Some(filters.clone());
        for filter in &filters {
            filter.before_step(step).await?;
            if step.should_skip() {
                break;
            }
        }
        Ok(())
    }

    async fn after_step(&self, step: &mut StepContext) -> StepResult {
        let filters = match step.filters.take() {
            Some(filters) => filters,
            None => self.instantiate(step)?,
        };
        for filter in filters.iter().rev() {
            filter.after_step(step).await?;
        }
        Ok(())
    }

    fn is_pipeline_local(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Filter callbacks
// ---------------------------------------------------------------------------

/// A callback a filter leaves in step state for the step body to execute.
#[derive(Clone)]
pub struct FilterCallback(PipelineStep);

impl FilterCallback {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        Self(crate::context::step(f))
    }

    fn call(&self, ctx: ExecutionContext) -> BoxFuture<'static, StepResult> {
        (self.0)(ctx)
    }
}

impl ExecutionContext {
    /// Stores `callback` for the current step.
    pub fn set_filter_callback(&self, callback: FilterCallback) {
        self.set_step_state(callback);
    }

    /// Executes the current step's filter callback.
    ///
    /// Fails with a configuration error when no filter set one.
    pub async fn execute_filter_callback(&self) -> StepResult {
        match self.step_state::<FilterCallback>() {
            Some(callback) => callback.call(self.clone()).await,
            None => Err(PipelineError::configuration(
                "no filter callback set; did you forget to supply the item source?",
            )),
        }
    }

    /// Executes the current step's filter callback if there is one. Returns
    /// `false` when there was nothing to execute.
    pub async fn try_execute_filter_callback(&self) -> Result<bool, PipelineError> {
        match self.step_state::<FilterCallback>() {
            Some(callback) => callback.call(self.clone()).map(|r| r.map(|()| true)).await,
            None => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder surface
// ---------------------------------------------------------------------------

impl PipelineBuilder {
    /// Attaches this pipeline's filter chain. Attaching twice is a
    /// configuration error.
    pub fn use_filters(&mut self) -> &mut Self {
        if self.extension::<FilterExecutionInspector>().is_some() {
            self.record_error(PipelineError::configuration(
                "a filter execution inspector is already attached to this pipeline",
            ));
            return self;
        }
        let inspector = Arc::new(FilterExecutionInspector::default());
        self.insert_extension(Arc::clone(&inspector));
        self.add_inspector(inspector)
    }

    /// Registers filters for the most recently added step, attaching the
    /// filter chain on first use.
    pub fn add_filters<F>(&mut self, register: F) -> &mut Self
    where
        F: FnOnce(&mut StepFilters<'_>),
    {
        let Some(index) = self.last_step_index() else {
            self.record_error(PipelineError::configuration(
                "filters must follow the step they decorate",
            ));
            return self;
        };
        let inspector = match self.extension::<FilterExecutionInspector>() {
            Some(inspector) => inspector,
            None => {
                self.use_filters();
                match self.extension::<FilterExecutionInspector>() {
                    Some(inspector) => inspector,
                    None => return self,
                }
            }
        };
        inspector.with_registry(|registry| register(&mut registry.for_step(index)));
        self
    }
}
