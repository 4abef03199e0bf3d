//! Producer/consumer channel topologies.
//!
//! Each execution of a channel step creates one channel and runs two branch
//! groups against it at the same time:
//!
//! - a reader group of `reader_count` branches, each receiving a
//!   [`ChannelReader`];
//! - a writer group of `writer_count` branches, each receiving a
//!   [`ChannelWriter`].
//!
//! With `auto_complete`, the write side is completed exactly once, after every
//! writer branch has finished (successfully or not). If the reader group
//! fails, the channel is closed so that writers waiting for room fail instead
//! of blocking forever.

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use crate::builder::PipelineBuilder;
use crate::channel::{channel, ChannelError, ChannelReader, ChannelWriter};
use crate::context::{step, ExecutionContext, PipelineStep};
use crate::errors::{PipelineError, StepResult};
use crate::features::branching::{fan_out, ConfigureBranchWith};
use crate::types::{ChannelOptions, ConcurrencyOptions};

type ConfigureReader<T> = Arc<dyn Fn(&mut PipelineBuilder, ChannelReader<T>) + Send + Sync>;
type ConfigureWriter<T> = Arc<dyn Fn(&mut PipelineBuilder, ChannelWriter<T>) + Send + Sync>;

async fn run_topology<T>(
    ctx: &ExecutionContext,
    options: &ChannelOptions,
    configure_reader: ConfigureReader<T>,
    configure_writer: ConfigureWriter<T>,
) -> StepResult
where
    T: Send + 'static,
{
    if options.reader_count == 0 && options.writer_count == 0 {
        return Ok(());
    }

    let (writer, reader) = channel::<T>(options.capacity, options.full_mode);
    debug!(
        readers = options.reader_count,
        writers = options.writer_count,
        capacity = ?options.capacity,
        full_mode = ?options.full_mode,
        "channel topology starting"
    );

    let readers: ConfigureBranchWith<usize> = {
        let reader = reader.clone();
        Arc::new(move |builder: &mut PipelineBuilder, _: usize| configure_reader(builder, reader.clone()))
    };
    let writers: ConfigureBranchWith<usize> = {
        let writer = writer.clone();
        Arc::new(move |builder: &mut PipelineBuilder, _: usize| configure_writer(builder, writer.clone()))
    };

    let reader_group = async {
        let outcome = fan_out(
            ctx,
            (0..options.reader_count).collect(),
            &ConcurrencyOptions::max(options.reader_count),
            readers,
        )
        .await;
        if outcome.is_err() {
            writer.close();
        }
        outcome
    };
    let writer_group = async {
        let outcome = fan_out(
            ctx,
            (0..options.writer_count).collect(),
            &ConcurrencyOptions::max(options.writer_count).waiting_for_all(),
            writers,
        )
        .await;
        if options.auto_complete && writer.complete() {
            debug!(dropped = writer.dropped(), "channel completed after all writers finished");
        }
        if outcome.is_err() {
            writer.close();
        }
        outcome
    };

    let (read_outcome, write_outcome) = tokio::join!(reader_group, writer_group);
    read_outcome.and(write_outcome)
}

impl PipelineBuilder {
    /// Adds a step that reads `reader` until the channel is completed and
    /// drained, running the rest of the chain once per item. Each item is
    /// published as the context's current item of type `T`.
    pub fn use_channel_reader<T>(&mut self, reader: ChannelReader<T>) -> &mut Self
    where
        T: Any + Send + Sync,
    {
        self.push_step("ChannelReader", move |next: PipelineStep| {
            step(move |ctx| {
                let reader = reader.clone();
                let next = Arc::clone(&next);
                async move {
                    loop {
                        let received = tokio::select! {
                            biased;
                            _ = ctx.cancelled() => return Err(PipelineError::Cancelled),
                            received = reader.read() => received,
                        };
                        match received {
                            Ok(item) => {
                                ctx.set_current_item(item);
                                next(ctx.clone()).await?;
                            }
                            Err(ChannelError::Completed) => return Ok(()),
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
            })
        })
    }

    /// Adds a channel topology step. Every reader branch starts with a
    /// [`use_channel_reader`](Self::use_channel_reader) loop followed by the
    /// steps added by `configure_reader`; every writer branch is given a
    /// [`ChannelWriter`].
    pub fn use_channel<T, R, W>(&mut self, configure_reader: R, configure_writer: W, options: ChannelOptions) -> &mut Self
    where
        T: Any + Send + Sync,
        R: Fn(&mut PipelineBuilder) + Send + Sync + 'static,
        W: Fn(&mut PipelineBuilder, ChannelWriter<T>) + Send + Sync + 'static,
    {
        let configure_reader: ConfigureReader<T> = Arc::new(move |builder: &mut PipelineBuilder, reader: ChannelReader<T>| {
            builder.use_channel_reader(reader);
            configure_reader(builder);
        });
        self.push_topology_step("Channel", configure_reader, Arc::new(configure_writer), options)
    }

    /// Adds a channel topology step where reader branches are handed the
    /// [`ChannelReader`] directly.
    pub fn use_producer_consumer<T, R, W>(
        &mut self,
        configure_reader: R,
        configure_writer: W,
        options: ChannelOptions,
    ) -> &mut Self
    where
        T: Send + 'static,
        R: Fn(&mut PipelineBuilder, ChannelReader<T>) + Send + Sync + 'static,
        W: Fn(&mut PipelineBuilder, ChannelWriter<T>) + Send + Sync + 'static,
    {
        self.push_topology_step(
            "ProducerConsumer",
            Arc::new(configure_reader),
            Arc::new(configure_writer),
            options,
        )
    }

    fn push_topology_step<T>(
        &mut self,
        type_name: &'static str,
        configure_reader: ConfigureReader<T>,
        configure_writer: ConfigureWriter<T>,
        options: ChannelOptions,
    ) -> &mut Self
    where
        T: Send + 'static,
    {
        let options = Arc::new(options);
        self.push_step(type_name, move |next: PipelineStep| {
            step(move |ctx| {
                let options = Arc::clone(&options);
                let configure_reader = Arc::clone(&configure_reader);
                let configure_writer = Arc::clone(&configure_writer);
                let next = Arc::clone(&next);
                async move {
                    run_topology(&ctx, &options, configure_reader, configure_writer).await?;
                    next(ctx).await
                }
            })
        })
    }
}
