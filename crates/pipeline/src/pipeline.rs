//! Compiled pipelines.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::context::{ExecutionContext, PipelineShared, PipelineStep};
use crate::errors::{PipelineError, StepResult};
use crate::identifiers::RunId;
use crate::inspector::{InspectorEntry, PipelineInspector};
use crate::resolver::ResourceResolver;

/// An immutable compiled step chain plus the inspector snapshot and
/// extension state it was built with.
///
/// A pipeline can be run any number of times; every run gets a fresh
/// [`ExecutionContext`].
pub struct Pipeline {
    entry: PipelineStep,
    shared: Arc<PipelineShared>,
    resolver: Arc<dyn ResourceResolver>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("inspectors", &self.shared.inspectors.len())
            .field("extensions", &self.shared.extensions.len())
            .finish()
    }
}

impl Pipeline {
    pub(crate) fn new(entry: PipelineStep, shared: Arc<PipelineShared>, resolver: Arc<dyn ResourceResolver>) -> Self {
        Self {
            entry,
            shared,
            resolver,
        }
    }

    /// Runs the pipeline with a fresh, never-cancelled token.
    pub async fn run(&self) -> StepResult {
        self.run_with_cancellation(CancellationToken::new()).await
    }

    /// Runs the pipeline under `cancellation`.
    ///
    /// Any failure observed after the token was cancelled is reported as
    /// [`PipelineError::Cancelled`].
    pub async fn run_with_cancellation(&self, cancellation: CancellationToken) -> StepResult {
        let run_id = RunId::new_random();
        let ctx = ExecutionContext::root(
            run_id,
            Arc::clone(&self.resolver),
            cancellation.clone(),
            Arc::clone(&self.shared),
        );
        let span = info_span!("pipeline_run", %run_id);

        let outcome = (self.entry)(ctx).instrument(span).await;
        match outcome {
            Err(error) if cancellation.is_cancelled() && !error.is_cancelled() => {
                debug!(%run_id, %error, "failure after cancellation reported as cancelled");
                Err(PipelineError::Cancelled)
            }
            other => other,
        }
    }

    /// Runs the pipeline as a branch of `parent`.
    pub(crate) async fn run_branch(&self, parent: &ExecutionContext) -> StepResult {
        let ctx = parent.branch(Arc::clone(&self.shared));
        (self.entry)(ctx).await
    }

    /// Inspectors registered on this pipeline, in registration order.
    pub fn inspectors(&self) -> Vec<Arc<dyn PipelineInspector>> {
        self.shared
            .inspectors
            .iter()
            .map(|entry| Arc::clone(&entry.inspector))
            .collect()
    }

    /// Returns the first registered inspector of type `I`.
    pub fn find_inspector<I: PipelineInspector>(&self) -> Option<Arc<I>> {
        self.shared.inspectors.iter().find_map(InspectorEntry::downcast::<I>)
    }
}
