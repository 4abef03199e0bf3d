use std::sync::Arc;

use parking_lot::Mutex;
use pipeline::{
    CancellationToken, PipelineBuilder, PipelineError, StepIndex, StepOptions,
};

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn append(builder: &mut PipelineBuilder, log: &Log, name: &'static str) {
    let log = Arc::clone(log);
    builder
        .run(move |_| log.lock().push(name.to_string()))
        .with_step_id(name);
}

#[derive(Default)]
struct Retries {
    attempts: u32,
}

impl StepOptions for Retries {}

#[tokio::test]
async fn steps_run_in_insertion_order() {
    let log = log();
    let mut builder = PipelineBuilder::new();
    append(&mut builder, &log, "A");
    append(&mut builder, &log, "B");
    append(&mut builder, &log, "C");
    let pipeline = builder.build().expect("build");

    pipeline.run().await.expect("run");

    assert_eq!(*log.lock(), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn an_empty_pipeline_runs() {
    let pipeline = PipelineBuilder::new().build().expect("build");
    pipeline.run().await.expect("run");
}

#[tokio::test]
async fn step_indices_follow_insertion_and_survive_wrapping() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut builder = PipelineBuilder::new();
    for _ in 0..4 {
        let seen = Arc::clone(&seen);
        builder.run(move |ctx| seen.lock().push(ctx.current_step_index()));
    }
    let before = builder.last_step_index();
    builder.configure::<Retries, _>(|r| r.attempts = 3);
    assert_eq!(builder.last_step_index(), before);

    builder.build().expect("build").run().await.expect("run");

    let expected: Vec<StepIndex> = (0..4).map(StepIndex::new).collect();
    assert_eq!(*seen.lock(), expected);
}

#[tokio::test]
async fn building_twice_is_a_configuration_error() {
    let mut builder = PipelineBuilder::new();
    builder.run(|_| {});
    builder.build().expect("first build");

    let err = builder.build().expect_err("second build");
    assert!(err.is_configuration());
}

#[tokio::test]
async fn wrapping_without_a_step_is_a_configuration_error() {
    let mut builder = PipelineBuilder::new();
    builder.wrap_last_component(|factory| factory);

    let err = builder.build().expect_err("nothing to wrap");
    assert!(err.is_configuration());
}

#[tokio::test]
async fn a_step_observes_its_own_position_after_downstream_returns() {
    let observed = Arc::new(Mutex::new(None));
    let mut builder = PipelineBuilder::new();
    {
        let observed = Arc::clone(&observed);
        builder
            .use_fn(move |ctx, next| {
                let observed = Arc::clone(&observed);
                async move {
                    next(ctx.clone()).await?;
                    *observed.lock() = Some(ctx.current_step_id());
                    Ok(())
                }
            })
            .with_step_id("outer");
    }
    builder.run(|_| {}).with_step_id("inner");

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(observed.lock().as_ref().map(|id| id.as_str().to_string()), Some("outer".to_string()));
}

#[tokio::test]
async fn a_failing_step_stops_the_chain_and_reaches_the_caller() {
    let log = log();
    let mut builder = PipelineBuilder::new();
    append(&mut builder, &log, "A");
    builder
        .run_async(|_| async { Err(PipelineError::step("boom")) })
        .with_step_id("B");
    append(&mut builder, &log, "C");

    let err = builder.build().expect("build").run().await.expect_err("B fails");

    assert!(matches!(err, PipelineError::StepExecution { .. }));
    assert_eq!(*log.lock(), vec!["A"]);
}

#[tokio::test]
async fn cancelling_mid_run_stops_later_steps() {
    let log = log();
    let token = CancellationToken::new();
    let mut builder = PipelineBuilder::new();
    append(&mut builder, &log, "A");
    {
        let token = token.clone();
        builder.run(move |_| token.cancel());
    }
    append(&mut builder, &log, "C");

    let err = builder
        .build()
        .expect("build")
        .run_with_cancellation(token)
        .await
        .expect_err("cancelled");

    assert!(err.is_cancelled());
    assert_eq!(*log.lock(), vec!["A"]);
}

#[tokio::test]
async fn every_run_gets_a_fresh_context() {
    let runs = Arc::new(Mutex::new(Vec::new()));
    let mut builder = PipelineBuilder::new();
    {
        let runs = Arc::clone(&runs);
        builder.run(move |ctx| {
            let seen_before = ctx.step_state::<u8>().is_some();
            ctx.set_step_state(1_u8);
            runs.lock().push((ctx.run_id(), seen_before));
        });
    }
    let pipeline = builder.build().expect("build");

    pipeline.run().await.expect("first");
    pipeline.run().await.expect("second");

    let runs = runs.lock();
    assert_eq!(runs.len(), 2);
    assert_ne!(runs[0].0, runs[1].0);
    assert!(runs.iter().all(|(_, seen_before)| !seen_before));
}
