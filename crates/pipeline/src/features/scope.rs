//! Scoped resources for the remainder of a run.

use std::sync::Arc;

use tracing::debug;

use crate::builder::PipelineBuilder;
use crate::context::{step, ExecutionContext, PipelineStep};
use crate::resolver::{ResourceResolver, ResourceScope};

/// Restores the previous resolver and releases the scope when dropped, so
/// both happen on success, failure, and when the run is abandoned.
struct ScopeGuard {
    ctx: ExecutionContext,
    previous: Option<Arc<dyn ResourceResolver>>,
    scope: Option<ResourceScope>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.ctx.replace_resolver(previous);
        }
        if let Some(scope) = self.scope.take() {
            scope.release();
        }
        debug!(step_id = %self.ctx.current_step_id(), "resource scope released");
    }
}

impl PipelineBuilder {
    /// Creates a resource scope from the current resolver and uses it for
    /// every later step in this run, including branches started from them.
    pub fn use_new_scope(&mut self) -> &mut Self {
        self.push_step("NewScope", |next: PipelineStep| {
            step(move |ctx| {
                let next = Arc::clone(&next);
                async move {
                    let scope = ctx.resolver().create_scope();
                    let previous = ctx.replace_resolver(scope.resolver());
                    let _guard = ScopeGuard {
                        ctx: ctx.clone(),
                        previous: Some(previous),
                        scope: Some(scope),
                    };
                    next(ctx).await
                }
            })
        })
    }
}
