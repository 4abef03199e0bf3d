//! Per-run execution context.
//!
//! An [`ExecutionContext`] is created for every root run and for every branch
//! run. It is a cheap, cloneable handle: clones refer to the same run, so a
//! step can hand its context to spawned helpers. Two concurrently running
//! branches never share a context.
//!
//! The context carries:
//!
//! - the run's [`RunId`] and cancellation token (inherited by branches),
//! - the resource resolver currently in effect (replaced while a scope is
//!   active),
//! - the index and id of the step currently executing,
//! - the step-state store, keyed by `(StepIndex, type)`,
//! - the current-item slot used by stream and channel readers.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::errors::{PipelineError, StepResult};
use crate::identifiers::{RunId, StepId, StepIndex};
use crate::inspector::InspectorEntry;
use crate::resolver::{AnyResource, ResourceResolver};

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A compiled step: takes the run's context and completes asynchronously.
///
/// Every step factory receives the step that follows it (`next`) and returns
/// a new `PipelineStep` that decides whether and when to call it.
pub type PipelineStep = Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, StepResult> + Send + Sync>;

/// Turns an async closure into a [`PipelineStep`].
pub fn step<F, Fut>(f: F) -> PipelineStep
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// The terminal continuation: completes immediately.
pub(crate) fn terminal() -> PipelineStep {
    Arc::new(|_| futures::future::ready(Ok(())).boxed())
}

// ---------------------------------------------------------------------------
// Pipeline-wide shared state
// ---------------------------------------------------------------------------

/// Inspector snapshot plus type-keyed extension state of one compiled
/// pipeline. Shared by every run of that pipeline.
pub(crate) struct PipelineShared {
    pub(crate) inspectors: Vec<InspectorEntry>,
    pub(crate) extensions: HashMap<TypeId, AnyResource>,
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StepPosition {
    index: StepIndex,
    id: StepId,
}

struct ContextInner {
    run_id: RunId,
    depth: usize,
    cancellation: CancellationToken,
    resolver: RwLock<Arc<dyn ResourceResolver>>,
    position: Mutex<StepPosition>,
    downstream_failures: Mutex<HashSet<StepIndex>>,
    step_state: Mutex<HashMap<(StepIndex, TypeId), AnyResource>>,
    current_item: Mutex<HashMap<TypeId, AnyResource>>,
    shared: Arc<PipelineShared>,
}

/// Mutable record of one pipeline or branch run.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let position = self.inner.position.lock().clone();
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.inner.run_id)
            .field("depth", &self.inner.depth)
            .field("step_index", &position.index)
            .field("step_id", &position.id)
            .field("cancelled", &self.inner.cancellation.is_cancelled())
            .finish()
    }
}

impl ExecutionContext {
    pub(crate) fn root(
        run_id: RunId,
        resolver: Arc<dyn ResourceResolver>,
        cancellation: CancellationToken,
        shared: Arc<PipelineShared>,
    ) -> Self {
        Self::create(run_id, 0, resolver, cancellation, shared)
    }

    /// Derives the context for a branch run: same run id, cancellation and
    /// resolver; empty step state.
    pub(crate) fn branch(&self, shared: Arc<PipelineShared>) -> Self {
        Self::create(
            self.inner.run_id,
            self.inner.depth + 1,
            self.resolver(),
            self.inner.cancellation.clone(),
            shared,
        )
    }

    fn create(
        run_id: RunId,
        depth: usize,
        resolver: Arc<dyn ResourceResolver>,
        cancellation: CancellationToken,
        shared: Arc<PipelineShared>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                run_id,
                depth,
                cancellation,
                resolver: RwLock::new(resolver),
                position: Mutex::new(StepPosition {
                    index: StepIndex::new(0),
                    id: StepId::anonymous(),
                }),
                downstream_failures: Mutex::new(HashSet::new()),
                step_state: Mutex::new(HashMap::new()),
                current_item: Mutex::new(HashMap::new()),
                shared,
            }),
        }
    }

    /// Identifier of the root run this context belongs to.
    pub fn run_id(&self) -> RunId {
        self.inner.run_id
    }

    /// Branch nesting depth: `0` for the root run.
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    pub(crate) fn shared(&self) -> &Arc<PipelineShared> {
        &self.inner.shared
    }

    /// Returns the extension state of type `T` attached to the running
    /// pipeline, if any.
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner
            .shared
            .extensions
            .get(&TypeId::of::<T>())
            .and_then(|ext| Arc::clone(ext).downcast::<T>().ok())
    }

    // -----------------------------------------------------------------------
    // Current step
    // -----------------------------------------------------------------------

    /// Index of the step currently executing.
    pub fn current_step_index(&self) -> StepIndex {
        self.inner.position.lock().index
    }

    /// Id of the step currently executing.
    pub fn current_step_id(&self) -> StepId {
        self.inner.position.lock().id.clone()
    }

    pub(crate) fn set_position(&self, index: StepIndex, id: &StepId) {
        let mut position = self.inner.position.lock();
        position.index = index;
        position.id.clone_from(id);
    }

    /// Records that the continuation of step `index` returned an error.
    pub(crate) fn mark_downstream_failed(&self, index: StepIndex) {
        self.inner.downstream_failures.lock().insert(index);
    }

    /// Clears and returns the downstream-failure mark of step `index`.
    pub(crate) fn take_downstream_failed(&self, index: StepIndex) -> bool {
        self.inner.downstream_failures.lock().remove(&index)
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    /// The resolver currently in effect.
    pub fn resolver(&self) -> Arc<dyn ResourceResolver> {
        Arc::clone(&self.inner.resolver.read())
    }

    /// Installs `resolver` and returns the one it replaced.
    pub(crate) fn replace_resolver(&self, resolver: Arc<dyn ResourceResolver>) -> Arc<dyn ResourceResolver> {
        std::mem::replace(&mut *self.inner.resolver.write(), resolver)
    }

    /// Resolves a resource of type `T` from the current resolver.
    pub fn resolve<T: Any + Send + Sync>(&self) -> Result<Arc<T>, PipelineError> {
        self.resolver().resolve::<T>()
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// The run's cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Returns `true` once the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Fails with [`PipelineError::Cancelled`] if the run has been cancelled.
    pub fn check_cancelled(&self) -> StepResult {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Completes when the run is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancellation.cancelled().await;
    }

    /// Sleeps for `duration`, failing early with
    /// [`PipelineError::Cancelled`] if the run is cancelled first.
    pub async fn delay(&self, duration: Duration) -> StepResult {
        tokio::select! {
            _ = self.inner.cancellation.cancelled() => Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Step state
    // -----------------------------------------------------------------------

    /// Stores `value` for the current step, replacing any previous value of
    /// the same type.
    pub fn set_step_state<T: Any + Send + Sync>(&self, value: T) {
        self.set_step_state_arc(Arc::new(value));
    }

    /// Stores a shared value for the current step.
    pub fn set_step_state_arc<T: Any + Send + Sync>(&self, value: Arc<T>) {
        let index = self.current_step_index();
        self.set_step_state_at(index, value);
    }

    /// Stores a shared value for the step at `index`.
    pub fn set_step_state_at<T: Any + Send + Sync>(&self, index: StepIndex, value: Arc<T>) {
        self.inner
            .step_state
            .lock()
            .insert((index, TypeId::of::<T>()), value);
    }

    /// Returns the current step's value of type `T`, or `None` if absent.
    pub fn step_state<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.step_state_at(self.current_step_index())
    }

    /// Returns the value of type `T` stored for the step at `index`.
    pub fn step_state_at<T: Any + Send + Sync>(&self, index: StepIndex) -> Option<Arc<T>> {
        let value = self
            .inner
            .step_state
            .lock()
            .get(&(index, TypeId::of::<T>()))
            .cloned()?;
        value.downcast::<T>().ok()
    }

    /// Removes and returns the current step's value of type `T`.
    pub fn take_step_state<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.take_step_state_at(self.current_step_index())
    }

    /// Removes and returns the value of type `T` stored for the step at
    /// `index`.
    pub fn take_step_state_at<T: Any + Send + Sync>(&self, index: StepIndex) -> Option<Arc<T>> {
        let value = self
            .inner
            .step_state
            .lock()
            .remove(&(index, TypeId::of::<T>()))?;
        value.downcast::<T>().ok()
    }

    // -----------------------------------------------------------------------
    // Current item
    // -----------------------------------------------------------------------

    /// Publishes the item being processed by a stream or channel reader.
    pub fn set_current_item<T: Any + Send + Sync>(&self, item: T) {
        self.inner
            .current_item
            .lock()
            .insert(TypeId::of::<T>(), Arc::new(item));
    }

    /// The item most recently published with type `T`.
    pub fn current_item<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let item = self.inner.current_item.lock().get(&TypeId::of::<T>()).cloned()?;
        item.downcast::<T>().ok()
    }

    /// Like [`current_item`](Self::current_item) but fails with a
    /// configuration error when no item of type `T` is available.
    pub fn require_current_item<T: Any + Send + Sync>(&self) -> Result<Arc<T>, PipelineError> {
        self.current_item::<T>().ok_or_else(|| {
            PipelineError::configuration(format!(
                "no current item of type {} is available",
                std::any::type_name::<T>()
            ))
        })
    }
}
