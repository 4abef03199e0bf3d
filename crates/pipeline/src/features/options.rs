//! Typed per-step options.
//!
//! [`PipelineBuilder::configure`] builds one options value at build time and
//! wraps the most recently added step so the value is placed in step state
//! right before the step body runs. The body reads it back with
//! [`ExecutionContext::step_options`].

use std::sync::Arc;

use crate::builder::{PipelineBuilder, StepFactory};
use crate::context::{step, ExecutionContext, PipelineStep};

/// Marker for settings types that can be attached to a step.
pub trait StepOptions: Default + Send + Sync + 'static {}

impl PipelineBuilder {
    /// Attaches options of type `T` to the most recently added step.
    ///
    /// `configure` runs once, now. Two steps configuring the same `T` get
    /// independent values.
    pub fn configure<T, F>(&mut self, configure: F) -> &mut Self
    where
        T: StepOptions,
        F: FnOnce(&mut T),
    {
        let mut options = T::default();
        configure(&mut options);
        let options = Arc::new(options);

        self.wrap_last_component(move |factory: StepFactory| -> StepFactory {
            Box::new(move |next: PipelineStep| {
                let body = factory(next);
                step(move |ctx| {
                    ctx.set_step_state_arc(Arc::clone(&options));
                    body(ctx)
                })
            })
        })
    }
}

impl ExecutionContext {
    /// Options of type `T` attached to the current step, if any.
    pub fn step_options<T: StepOptions>(&self) -> Option<Arc<T>> {
        self.step_state::<T>()
    }
}
