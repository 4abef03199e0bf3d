//! Pipeline construction and compilation.
//!
//! A [`PipelineBuilder`] accumulates step factories in insertion order. Each
//! step gets its [`StepIndex`] when it is added; wrapping the step later (see
//! [`PipelineBuilder::wrap_last_component`]) replaces its factory but never
//! its index.
//!
//! [`PipelineBuilder::build`] folds the factories right-to-left, starting
//! from a terminal no-op, so each compiled step closes over the one after it.
//! Every compiled step is then wrapped by the inspector protocol.
//!
//! Builder methods return `&mut Self` for chaining. Misconfiguration detected
//! while chaining is recorded and reported by `build`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::context::{step, terminal, ExecutionContext, PipelineShared, PipelineStep};
use crate::errors::{PipelineError, StepResult};
use crate::identifiers::{StepId, StepIndex};
use crate::inspector::{instrument, InspectorEntry, PipelineInspector, StepDescriptor};
use crate::pipeline::Pipeline;
use crate::resolver::{AnyResource, ResourceResolver, ServiceProvider};

/// Turns the step that follows into the compiled step.
pub type StepFactory = Box<dyn FnOnce(PipelineStep) -> PipelineStep + Send>;

struct StepRegistration {
    descriptor: StepDescriptor,
    factory: StepFactory,
}

/// Accumulates steps, inspectors and extension state, then compiles them
/// into a [`Pipeline`].
pub struct PipelineBuilder {
    steps: Vec<StepRegistration>,
    inspectors: Vec<InspectorEntry>,
    extensions: HashMap<TypeId, AnyResource>,
    resolver: Arc<dyn ResourceResolver>,
    depth: usize,
    built: bool,
    error: Option<PipelineError>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::with_resolver(ServiceProvider::empty())
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("steps", &self.steps.len())
            .field("inspectors", &self.inspectors.len())
            .field("depth", &self.depth)
            .field("built", &self.built)
            .finish()
    }
}

impl PipelineBuilder {
    /// Creates a builder backed by an empty [`ServiceProvider`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder whose pipeline resolves resources from `resolver`.
    pub fn with_resolver(resolver: Arc<dyn ResourceResolver>) -> Self {
        Self {
            steps: Vec::new(),
            inspectors: Vec::new(),
            extensions: HashMap::new(),
            resolver,
            depth: 0,
            built: false,
            error: None,
        }
    }

    /// Builder for a branch started from `ctx`: same resolver, and every
    /// shared (non-local) inspector of the running pipeline.
    pub(crate) fn for_branch(ctx: &ExecutionContext) -> Self {
        let mut builder = Self::with_resolver(ctx.resolver());
        builder.depth = ctx.depth() + 1;
        builder.inspectors = ctx
            .shared()
            .inspectors
            .iter()
            .filter(|entry| !entry.inspector.is_pipeline_local())
            .cloned()
            .collect();
        builder
    }

    /// The resolver the built pipeline will use.
    pub fn resolver(&self) -> Arc<dyn ResourceResolver> {
        Arc::clone(&self.resolver)
    }

    /// Branch nesting depth: `0` for root builders.
    pub fn depth(&self) -> usize {
        self.depth
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Appends a step built from `factory`, which receives the step that
    /// follows it.
    pub fn use_step<F>(&mut self, factory: F) -> &mut Self
    where
        F: FnOnce(PipelineStep) -> PipelineStep + Send + 'static,
    {
        self.push_step("Inline", factory)
    }

    /// Appends a step from an async function of the context and the next
    /// step. The function decides whether to call `next`.
    pub fn use_fn<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(ExecutionContext, PipelineStep) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        let f = Arc::new(f);
        self.use_step(move |next| {
            step(move |ctx| {
                let f = Arc::clone(&f);
                let next = Arc::clone(&next);
                async move { f(ctx, next).await }
            })
        })
    }

    pub(crate) fn push_step<F>(&mut self, type_name: &'static str, factory: F) -> &mut Self
    where
        F: FnOnce(PipelineStep) -> PipelineStep + Send + 'static,
    {
        let index = StepIndex::new(self.steps.len());
        self.steps.push(StepRegistration {
            descriptor: StepDescriptor {
                index,
                id: StepId::anonymous(),
                type_name,
            },
            factory: Box::new(factory),
        });
        self
    }

    /// Names the most recently added step.
    pub fn with_step_id(&mut self, id: impl Into<String>) -> &mut Self {
        match self.steps.last_mut() {
            Some(last) => last.descriptor.id = StepId::or_anonymous(id),
            None => self.record_error(PipelineError::configuration(
                "with_step_id called before any step was added",
            )),
        }
        self
    }

    /// Replaces the factory of the most recently added step with
    /// `wrapper(previous_factory)`. The step keeps its index and id.
    pub fn wrap_last_component<W>(&mut self, wrapper: W) -> &mut Self
    where
        W: FnOnce(StepFactory) -> StepFactory,
    {
        match self.steps.pop() {
            Some(last) => self.steps.push(StepRegistration {
                descriptor: last.descriptor,
                factory: wrapper(last.factory),
            }),
            None => self.record_error(PipelineError::configuration(
                "cannot wrap the last component: no step has been added",
            )),
        }
        self
    }

    /// Number of steps added so far.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Index of the most recently added step.
    pub fn last_step_index(&self) -> Option<StepIndex> {
        self.steps.last().map(|s| s.descriptor.index)
    }

    // -----------------------------------------------------------------------
    // Inspectors
    // -----------------------------------------------------------------------

    /// Registers an inspector instance. Registration order is call order.
    pub fn add_inspector<I: PipelineInspector>(&mut self, inspector: Arc<I>) -> &mut Self {
        self.inspectors.push(InspectorEntry::new(inspector));
        self
    }

    /// Registers an inspector created by `factory`.
    pub fn add_inspector_with<I, F>(&mut self, factory: F) -> &mut Self
    where
        I: PipelineInspector,
        F: FnOnce(&dyn ResourceResolver) -> I,
    {
        let inspector = factory(self.resolver.as_ref());
        self.add_inspector(Arc::new(inspector))
    }

    /// Registers the inspector of type `I` resolved from the builder's
    /// resolver.
    pub fn add_inspector_from_services<I: PipelineInspector>(&mut self) -> &mut Self {
        match self.resolver.resolve::<I>() {
            Ok(inspector) => self.add_inspector(inspector),
            Err(err) => {
                self.record_error(err);
                self
            }
        }
    }

    /// Returns the first registered inspector of type `I`.
    pub fn find_inspector<I: PipelineInspector>(&self) -> Option<Arc<I>> {
        self.inspectors.iter().find_map(InspectorEntry::downcast::<I>)
    }

    // -----------------------------------------------------------------------
    // Extension state
    // -----------------------------------------------------------------------

    /// Attaches type-keyed state to the pipeline being built, replacing any
    /// previous value of the same type.
    pub fn insert_extension<T: Any + Send + Sync>(&mut self, value: Arc<T>) -> &mut Self {
        self.extensions.insert(TypeId::of::<T>(), value);
        self
    }

    /// Returns the extension state of type `T`.
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|ext| Arc::clone(ext).downcast::<T>().ok())
    }

    /// Records a configuration problem to be reported by `build`. Only the
    /// first one is kept.
    pub(crate) fn record_error(&mut self, error: PipelineError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    // -----------------------------------------------------------------------
    // Compilation
    // -----------------------------------------------------------------------

    /// Compiles the accumulated steps. Fails if the builder was already built
    /// or if an earlier builder call was misconfigured.
    pub fn build(&mut self) -> Result<Pipeline, PipelineError> {
        if self.built {
            return Err(PipelineError::configuration("pipeline has already been built"));
        }
        self.built = true;
        if let Some(error) = self.error.take() {
            return Err(error);
        }

        let steps = std::mem::take(&mut self.steps);
        let entries = std::mem::take(&mut self.inspectors);
        let inspectors: Arc<[Arc<dyn PipelineInspector>]> =
            entries.iter().map(|entry| Arc::clone(&entry.inspector)).collect();

        debug!(
            steps = steps.len(),
            inspectors = inspectors.len(),
            depth = self.depth,
            "compiling pipeline"
        );

        let mut next = terminal();
        for registration in steps.into_iter().rev() {
            let continuation = restore_position(next, &registration.descriptor);
            let body = (registration.factory)(Arc::clone(&continuation));
            next = instrument(registration.descriptor, body, continuation, Arc::clone(&inspectors));
        }

        let shared = Arc::new(PipelineShared {
            inspectors: entries,
            extensions: std::mem::take(&mut self.extensions),
        });
        Ok(Pipeline::new(next, shared, Arc::clone(&self.resolver)))
    }
}

/// Calls `next`, then puts the context's current position back on the step
/// described by `descriptor`, so code running after `next` returns observes
/// its own step again. A failing `next` is recorded so the step's inspectors
/// can tell a downstream error from one raised by the step itself.
fn restore_position(next: PipelineStep, descriptor: &StepDescriptor) -> PipelineStep {
    let index = descriptor.index;
    let id = descriptor.id.clone();
    step(move |ctx| {
        let next = Arc::clone(&next);
        let id = id.clone();
        async move {
            let outcome = next(ctx.clone()).await;
            ctx.set_position(index, &id);
            if outcome.is_err() {
                ctx.mark_downstream_failed(index);
            }
            outcome
        }
    })
}
