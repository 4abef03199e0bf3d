use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pipeline::{ChannelError, ChannelOptions, ChannelWriter, FullMode, PipelineBuilder, PipelineError};

type Received = Arc<Mutex<Vec<u32>>>;

fn write_range(branch: &mut PipelineBuilder, writer: ChannelWriter<u32>, range: std::ops::Range<u32>) {
    branch.run_async(move |_| {
        let writer = writer.clone();
        let range = range.clone();
        async move {
            for item in range {
                writer.write(item).await?;
            }
            Ok(())
        }
    });
}

fn record_current_item(branch: &mut PipelineBuilder, received: &Received) {
    let received = Arc::clone(received);
    branch.run_async(move |ctx| {
        let received = Arc::clone(&received);
        async move {
            let item = ctx.require_current_item::<u32>()?;
            received.lock().push(*item);
            Ok(())
        }
    });
}

fn counts(received: &Received) -> BTreeMap<u32, usize> {
    let mut counts = BTreeMap::new();
    for item in received.lock().iter() {
        *counts.entry(*item).or_insert(0) += 1;
    }
    counts
}

#[tokio::test]
async fn one_writer_and_one_reader_move_every_item_in_order() {
    let received: Received = Arc::default();
    let mut builder = PipelineBuilder::new();
    {
        let received = Arc::clone(&received);
        builder.use_channel::<u32, _, _>(
            move |reader| record_current_item(reader, &received),
            |writer, channel| write_range(writer, channel, 0..100),
            ChannelOptions::default(),
        );
    }

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(*received.lock(), (0..100).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_writers_and_readers_deliver_each_item_exactly_once() {
    let received: Received = Arc::default();
    let next_range = Arc::new(AtomicUsize::new(0));
    let mut builder = PipelineBuilder::new();
    {
        let received = Arc::clone(&received);
        let next_range = Arc::clone(&next_range);
        builder.use_channel::<u32, _, _>(
            move |reader| record_current_item(reader, &received),
            move |writer, channel| {
                // Each writer branch claims its own block of 50 items.
                let start = next_range.fetch_add(1, Ordering::SeqCst) as u32 * 50;
                write_range(writer, channel, start..start + 50);
            },
            ChannelOptions::default().writers(3).readers(4),
        );
    }

    builder.build().expect("build").run().await.expect("run");

    let counts = counts(&received);
    assert_eq!(counts.len(), 150);
    assert!(counts.values().all(|&n| n == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn the_channel_completes_only_after_the_slowest_writer() {
    let received: Received = Arc::default();
    let writer_slot = Arc::new(AtomicUsize::new(0));
    let mut builder = PipelineBuilder::new();
    {
        let received = Arc::clone(&received);
        let writer_slot = Arc::clone(&writer_slot);
        builder.use_channel::<u32, _, _>(
            move |reader| record_current_item(reader, &received),
            move |branch, channel| {
                let slow = writer_slot.fetch_add(1, Ordering::SeqCst) == 0;
                branch.run_async(move |ctx| {
                    let channel = channel.clone();
                    async move {
                        if slow {
                            ctx.delay(Duration::from_millis(50)).await?;
                            channel.write(1000).await?;
                        } else {
                            channel.write(1).await?;
                        }
                        Ok(())
                    }
                });
            },
            ChannelOptions::default().writers(2),
        );
    }

    builder.build().expect("build").run().await.expect("run");

    let mut received = received.lock().clone();
    received.sort_unstable();
    assert_eq!(received, vec![1, 1000]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn the_topology_completes_the_channel_once_after_every_writer() {
    let received: Received = Arc::default();
    let completed_while_writing = Arc::new(AtomicUsize::new(0));
    let writers: Arc<Mutex<Vec<ChannelWriter<u32>>>> = Arc::default();
    let writer_slot = Arc::new(AtomicUsize::new(0));
    let mut builder = PipelineBuilder::new();
    {
        let received = Arc::clone(&received);
        let completed_while_writing = Arc::clone(&completed_while_writing);
        let writers = Arc::clone(&writers);
        builder.use_channel::<u32, _, _>(
            move |reader| record_current_item(reader, &received),
            move |branch, channel| {
                writers.lock().push(channel.clone());
                let slot = writer_slot.fetch_add(1, Ordering::SeqCst) as u32;
                let completed_while_writing = Arc::clone(&completed_while_writing);
                branch.run_async(move |ctx| {
                    let channel = channel.clone();
                    let completed_while_writing = Arc::clone(&completed_while_writing);
                    async move {
                        ctx.delay(Duration::from_millis(u64::from(slot) * 10)).await?;
                        channel.write(slot).await?;
                        if channel.is_completed() {
                            completed_while_writing.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(())
                    }
                });
            },
            ChannelOptions::default().writers(3).readers(2),
        );
    }

    builder.build().expect("build").run().await.expect("run");

    let writers = writers.lock().clone();
    assert_eq!(writers.len(), 3);
    assert_eq!(completed_while_writing.load(Ordering::SeqCst), 0);
    assert!(writers.iter().all(ChannelWriter::is_completed));
    // The topology already made the single successful completion.
    assert!(writers.iter().all(|writer| !writer.complete()));
    let mut received = received.lock().clone();
    received.sort_unstable();
    assert_eq!(received, vec![0, 1, 2]);
}

#[tokio::test]
async fn producer_consumer_hands_the_reader_to_the_branch() {
    let received: Received = Arc::default();
    let mut builder = PipelineBuilder::new();
    {
        let received = Arc::clone(&received);
        builder.use_producer_consumer::<u32, _, _>(
            move |branch, reader| {
                let received = Arc::clone(&received);
                branch.run_async(move |_| {
                    let reader = reader.clone();
                    let received = Arc::clone(&received);
                    async move {
                        loop {
                            match reader.read().await {
                                Ok(item) => received.lock().push(item),
                                Err(ChannelError::Completed) => return Ok(()),
                                Err(err) => return Err(err.into()),
                            }
                        }
                    }
                });
            },
            |writer, channel| write_range(writer, channel, 0..10),
            ChannelOptions::default(),
        );
    }

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(*received.lock(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn bounded_channels_apply_backpressure() {
    let received: Received = Arc::default();
    let peak_queued = Arc::new(AtomicUsize::new(0));
    let mut builder = PipelineBuilder::new();
    {
        let received = Arc::clone(&received);
        let peak_queued = Arc::clone(&peak_queued);
        builder.use_producer_consumer::<u32, _, _>(
            move |branch, reader| {
                let received = Arc::clone(&received);
                let peak_queued = Arc::clone(&peak_queued);
                branch.run_async(move |ctx| {
                    let reader = reader.clone();
                    let received = Arc::clone(&received);
                    let peak_queued = Arc::clone(&peak_queued);
                    async move {
                        loop {
                            ctx.delay(Duration::from_millis(2)).await?;
                            peak_queued.fetch_max(reader.len(), Ordering::SeqCst);
                            match reader.read().await {
                                Ok(item) => received.lock().push(item),
                                Err(_) => return Ok(()),
                            }
                        }
                    }
                });
            },
            |writer, channel| write_range(writer, channel, 0..20),
            ChannelOptions::default().bounded(2, FullMode::Wait),
        );
    }

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(*received.lock(), (0..20).collect::<Vec<_>>());
    assert!(peak_queued.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn a_failing_reader_closes_the_channel_and_its_error_is_returned() {
    let mut builder = PipelineBuilder::new();
    builder.use_channel::<u32, _, _>(
        |reader| {
            reader.run_async(|ctx| async move {
                let item = ctx.require_current_item::<u32>()?;
                if *item == 3 {
                    return Err(PipelineError::step("reader rejected item 3"));
                }
                Ok(())
            });
        },
        |writer, channel| write_range(writer, channel, 0..1000),
        ChannelOptions::default().bounded(1, FullMode::Wait),
    );

    let err = builder.build().expect("build").run().await.expect_err("reader fails");

    assert_eq!(err.to_string(), "Step execution failed: reader rejected item 3");
}

#[tokio::test]
async fn a_topology_without_readers_or_writers_is_a_no_op() {
    let after = Arc::new(AtomicUsize::new(0));
    let mut builder = PipelineBuilder::new();
    builder.use_channel::<u32, _, _>(
        |_| panic!("no reader branch should be built"),
        |_, _| panic!("no writer branch should be built"),
        ChannelOptions::default().readers(0).writers(0),
    );
    {
        let after = Arc::clone(&after);
        builder.run(move |_| {
            after.fetch_add(1, Ordering::SeqCst);
        });
    }

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn the_topology_step_runs_on_every_execution() {
    let received: Received = Arc::default();
    let mut builder = PipelineBuilder::new();
    {
        let received = Arc::clone(&received);
        builder.use_channel::<u32, _, _>(
            move |reader| record_current_item(reader, &received),
            |writer, channel| write_range(writer, channel, 0..3),
            ChannelOptions::default(),
        );
    }
    let pipeline = builder.build().expect("build");

    pipeline.run().await.expect("first");
    pipeline.run().await.expect("second");

    assert_eq!(*received.lock(), vec![0, 1, 2, 0, 1, 2]);
}
