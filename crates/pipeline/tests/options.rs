use std::sync::Arc;

use parking_lot::Mutex;
use pipeline::{PipelineBuilder, StepOptions};

#[derive(Debug, Default)]
struct RetryOptions {
    attempts: u32,
    label: String,
}

impl StepOptions for RetryOptions {}

type Seen = Arc<Mutex<Vec<Option<(u32, String)>>>>;

fn record_options(builder: &mut PipelineBuilder, seen: &Seen) {
    let seen = Arc::clone(seen);
    builder.run(move |ctx| {
        let options = ctx
            .step_options::<RetryOptions>()
            .map(|o| (o.attempts, o.label.clone()));
        seen.lock().push(options);
    });
}

#[tokio::test]
async fn two_steps_configuring_the_same_type_get_independent_values() {
    let seen: Seen = Arc::default();
    let mut builder = PipelineBuilder::new();
    record_options(&mut builder, &seen);
    builder.configure::<RetryOptions, _>(|o| {
        o.attempts = 3;
        o.label = "fetch".to_string();
    });
    record_options(&mut builder, &seen);
    builder.configure::<RetryOptions, _>(|o| {
        o.attempts = 5;
        o.label = "store".to_string();
    });

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(
        *seen.lock(),
        vec![Some((3, "fetch".to_string())), Some((5, "store".to_string()))]
    );
}

#[tokio::test]
async fn a_step_without_options_sees_none() {
    let seen: Seen = Arc::default();
    let mut builder = PipelineBuilder::new();
    record_options(&mut builder, &seen);
    builder.configure::<RetryOptions, _>(|o| o.attempts = 1);
    record_options(&mut builder, &seen);

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(*seen.lock(), vec![Some((1, String::new())), None]);
}

#[tokio::test]
async fn untouched_fields_keep_their_defaults() {
    let seen: Seen = Arc::default();
    let mut builder = PipelineBuilder::new();
    record_options(&mut builder, &seen);
    builder.configure::<RetryOptions, _>(|o| o.label = "only label".to_string());

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(*seen.lock(), vec![Some((0, "only label".to_string()))]);
}

#[tokio::test]
async fn branch_steps_do_not_see_the_parent_options() {
    let seen: Seen = Arc::default();
    let mut builder = PipelineBuilder::new();
    {
        let seen = Arc::clone(&seen);
        builder.use_branch(move |branch| record_options(branch, &seen));
    }
    builder.configure::<RetryOptions, _>(|o| o.attempts = 9);

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(*seen.lock(), vec![None]);
}

#[tokio::test]
async fn configuring_without_a_step_is_a_configuration_error() {
    let mut builder = PipelineBuilder::new();
    builder.configure::<RetryOptions, _>(|o| o.attempts = 2);

    let err = builder.build().expect_err("nothing to configure");
    assert!(err.is_configuration());
}
