//! Per-item and per-chunk fan-out.
//!
//! `use_branch_per_input` adds a step whose body executes the step's filter
//! callback. The callback is supplied by a filter attached through
//! [`AwaitingInput::with_inputs`] (or [`AwaitingInputs::with_chunks`]), which
//! fans the inputs out over branches. Forgetting the `with_*` call leaves the
//! step without a callback and fails the run with a configuration error.

use std::sync::Arc;

use async_trait::async_trait;

use crate::builder::PipelineBuilder;
use crate::context::{step, PipelineStep};
use crate::errors::{PipelineError, StepResult};
use crate::features::branching::{fan_out, ConfigureBranchWith};
use crate::features::filter::{FilterCallback, StepFilter};
use crate::inspector::StepContext;
use crate::types::ConcurrencyOptions;

/// Splits `items` into consecutive chunks of `size`; the last chunk may be
/// shorter. A `size` of zero is treated as one.
pub fn chunk_items<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        chunks.push(items.by_ref().take(size).collect());
    }
    chunks
}

/// Leaves a fan-out callback in step state for the per-input step body.
struct BranchPerInputFilter<T> {
    inputs: Arc<Vec<T>>,
    options: ConcurrencyOptions,
    configure: ConfigureBranchWith<T>,
}

#[async_trait]
impl<T> StepFilter for BranchPerInputFilter<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn before_step(&self, step: &mut StepContext) -> StepResult {
        let inputs = Arc::clone(&self.inputs);
        let options = self.options.clone();
        let configure = Arc::clone(&self.configure);
        step.context().set_filter_callback(FilterCallback::new(move |ctx| {
            let inputs = inputs.as_ref().clone();
            let options = options.clone();
            let configure = Arc::clone(&configure);
            async move { fan_out(&ctx, inputs, &options, configure).await }
        }));
        Ok(())
    }
}

/// A per-item fan-out step waiting for its inputs.
#[must_use = "call with_inputs to supply the items to fan out over"]
pub struct AwaitingInput<'a, T> {
    builder: &'a mut PipelineBuilder,
    configure: ConfigureBranchWith<T>,
}

impl<'a, T> AwaitingInput<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Runs one branch per item under `options`.
    pub fn with_inputs(self, items: Vec<T>, options: ConcurrencyOptions) -> &'a mut PipelineBuilder {
        let Self { builder, configure } = self;
        let filter = BranchPerInputFilter {
            inputs: Arc::new(items),
            options,
            configure,
        };
        builder.add_filters(|filters| {
            filters.add(filter);
        })
    }
}

/// A per-chunk fan-out step waiting for its inputs.
#[must_use = "call with_chunks to supply the items to fan out over"]
pub struct AwaitingInputs<'a, T> {
    builder: &'a mut PipelineBuilder,
    configure: ConfigureBranchWith<Vec<T>>,
}

impl<'a, T> AwaitingInputs<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Splits `items` into chunks of `chunk_size` and runs one branch per
    /// chunk under `options`. A zero chunk size is a configuration error.
    pub fn with_chunks(self, items: Vec<T>, chunk_size: usize, options: ConcurrencyOptions) -> &'a mut PipelineBuilder {
        let Self { builder, configure } = self;
        if chunk_size == 0 {
            builder.record_error(PipelineError::configuration("chunk size must be greater than zero"));
            return builder;
        }
        let filter = BranchPerInputFilter {
            inputs: Arc::new(chunk_items(items, chunk_size)),
            options,
            configure,
        };
        builder.add_filters(|filters| {
            filters.add(filter);
        })
    }
}

impl PipelineBuilder {
    /// Adds a step that runs one branch per input item. Supply the items with
    /// [`AwaitingInput::with_inputs`].
    pub fn use_branch_per_input<T, C>(&mut self, configure: C) -> AwaitingInput<'_, T>
    where
        T: Clone + Send + Sync + 'static,
        C: Fn(&mut PipelineBuilder, T) + Send + Sync + 'static,
    {
        self.push_fan_out_step("BranchPerInput");
        AwaitingInput {
            builder: self,
            configure: Arc::new(configure),
        }
    }

    /// Adds a step that runs one branch per chunk of input items. Supply the
    /// items with [`AwaitingInputs::with_chunks`].
    pub fn use_branch_per_inputs<T, C>(&mut self, configure: C) -> AwaitingInputs<'_, T>
    where
        T: Clone + Send + Sync + 'static,
        C: Fn(&mut PipelineBuilder, Vec<T>) + Send + Sync + 'static,
    {
        self.push_fan_out_step("BranchPerInputs");
        AwaitingInputs {
            builder: self,
            configure: Arc::new(configure),
        }
    }

    fn push_fan_out_step(&mut self, type_name: &'static str) {
        self.push_step(type_name, |next: PipelineStep| {
            step(move |ctx| {
                let next = Arc::clone(&next);
                async move {
                    ctx.execute_filter_callback().await?;
                    next(ctx).await
                }
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_have_fixed_size_except_the_last() {
        let items: Vec<String> = ["1", "2", "3", "4", "5"].iter().map(|s| s.to_string()).collect();
        let chunks = chunk_items(items, 2);
        assert_eq!(
            chunks,
            vec![
                vec!["1".to_string(), "2".to_string()],
                vec!["3".to_string(), "4".to_string()],
                vec!["5".to_string()],
            ]
        );
    }

    #[test]
    fn a_chunk_size_larger_than_the_input_yields_one_chunk() {
        assert_eq!(chunk_items(vec![1, 2, 3], 10), vec![vec![1, 2, 3]]);
        assert_eq!(chunk_items(vec![1, 2, 3], usize::MAX / 2), vec![vec![1, 2, 3]]);
        assert_eq!(chunk_items(vec![1, 2, 3], usize::MAX), vec![vec![1, 2, 3]]);
        assert!(chunk_items(Vec::<u8>::new(), usize::MAX).is_empty());
    }

    #[test]
    fn chunk_count_is_rounded_up() {
        for (len, size) in [(0_usize, 3_usize), (1, 3), (6, 3), (7, 3), (10, 1)] {
            let chunks = chunk_items((0..len).collect::<Vec<usize>>(), size);
            assert_eq!(chunks.len(), len.div_ceil(size));
            assert!(chunks.iter().rev().skip(1).all(|c| c.len() == size));
        }
    }
}
