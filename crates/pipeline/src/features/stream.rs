//! Repeating the rest of the chain once per element of an async stream.

use std::any::Any;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;

use crate::builder::PipelineBuilder;
use crate::context::{step, ExecutionContext, PipelineStep};
use crate::errors::PipelineError;

impl PipelineBuilder {
    /// Runs the rest of the chain once per element produced by `source`,
    /// in order. Each element is published as the context's current item of
    /// type `T`. Cancellation is checked between elements.
    pub fn use_async_stream<T, S>(&mut self, source: S) -> &mut Self
    where
        T: Any + Send + Sync,
        S: Fn(&ExecutionContext) -> BoxStream<'static, T> + Send + Sync + 'static,
    {
        let source = Arc::new(source);
        self.push_step("AsyncStream", move |next: PipelineStep| {
            step(move |ctx| {
                let mut items = source(&ctx);
                let next = Arc::clone(&next);
                async move {
                    loop {
                        let item = tokio::select! {
                            biased;
                            _ = ctx.cancelled() => return Err(PipelineError::Cancelled),
                            item = items.next() => item,
                        };
                        let Some(item) = item else {
                            return Ok(());
                        };
                        ctx.set_current_item(item);
                        next(ctx.clone()).await?;
                    }
                }
            })
        })
    }
}
