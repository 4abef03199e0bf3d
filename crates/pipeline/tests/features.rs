use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use pipeline::{
    async_trait, CancellationToken, ExecutionContext, InMemoryIdempotencyStore, Job, LoggingInspector,
    PipelineBuilder, PipelineError, PipelineMiddleware, PipelineName, PipelineRegistry, PipelineStep,
    ServiceCollection, SharedIdempotencyStore, StepResult, TimingInspector,
};

type Log = Arc<Mutex<Vec<String>>>;

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// A resource whose instances are numbered in creation order.
struct Connection(usize);

fn connection_services(created: &Arc<AtomicUsize>) -> ServiceCollection {
    let created = Arc::clone(created);
    let mut services = ServiceCollection::new();
    services.add_scoped(move |_| Connection(created.fetch_add(1, Ordering::SeqCst)));
    services
}

fn record_connection(builder: &mut PipelineBuilder, seen: &Arc<Mutex<Vec<usize>>>) {
    let seen = Arc::clone(seen);
    builder.run_async(move |ctx| {
        let seen = Arc::clone(&seen);
        async move {
            let connection = ctx.resolve::<Connection>()?;
            seen.lock().push(connection.0);
            Ok(())
        }
    });
}

#[tokio::test]
async fn a_new_scope_serves_its_own_scoped_instances_until_the_run_ends() {
    let created = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let provider = connection_services(&created).build();
    let mut builder = PipelineBuilder::with_resolver(Arc::clone(&provider) as Arc<dyn pipeline::ResourceResolver>);
    record_connection(&mut builder, &seen);
    builder.use_new_scope();
    record_connection(&mut builder, &seen);
    record_connection(&mut builder, &seen);
    let pipeline = builder.build().expect("build");

    pipeline.run().await.expect("first run");
    assert_eq!(provider.open_scopes(), 0);
    pipeline.run().await.expect("second run");
    assert_eq!(provider.open_scopes(), 0);

    // Root instance 0 is reused; every run gets a fresh scoped instance that
    // is shared by the steps after the scope step.
    assert_eq!(*seen.lock(), vec![0, 1, 1, 0, 2, 2]);
}

#[tokio::test]
async fn a_scope_is_released_when_a_later_step_fails() {
    let created = Arc::new(AtomicUsize::new(0));
    let observed_open = Arc::new(AtomicUsize::new(0));
    let provider = connection_services(&created).build();
    let mut builder = PipelineBuilder::with_resolver(Arc::clone(&provider) as Arc<dyn pipeline::ResourceResolver>);
    builder.use_new_scope();
    {
        let provider = Arc::clone(&provider);
        let observed_open = Arc::clone(&observed_open);
        builder.run_async(move |_| {
            observed_open.store(provider.open_scopes(), Ordering::SeqCst);
            async { Err(PipelineError::step("failed inside scope")) }
        });
    }

    builder.build().expect("build").run().await.expect_err("fails");

    assert_eq!(observed_open.load(Ordering::SeqCst), 1);
    assert_eq!(provider.open_scopes(), 0);
}

#[tokio::test]
async fn branches_started_inside_a_scope_resolve_from_it() {
    let created = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let provider = connection_services(&created).build();
    let mut builder = PipelineBuilder::with_resolver(provider);
    builder.use_new_scope();
    record_connection(&mut builder, &seen);
    {
        let seen = Arc::clone(&seen);
        builder.use_branch(move |branch| record_connection(branch, &seen));
    }

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(*seen.lock(), vec![0, 0]);
}

// ---------------------------------------------------------------------------
// Middleware and jobs
// ---------------------------------------------------------------------------

struct Bracket {
    log: Log,
}

#[async_trait]
impl PipelineMiddleware for Bracket {
    async fn execute(&self, next: PipelineStep, ctx: ExecutionContext) -> StepResult {
        self.log.lock().push("open".to_string());
        let outcome = next(ctx).await;
        self.log.lock().push("close".to_string());
        outcome
    }
}

/// Stops the chain without calling `next`.
struct Gate;

#[async_trait]
impl PipelineMiddleware for Gate {
    async fn execute(&self, _next: PipelineStep, _ctx: ExecutionContext) -> StepResult {
        Ok(())
    }
}

fn append(builder: &mut PipelineBuilder, log: &Log, name: &'static str) {
    let log = Arc::clone(log);
    builder.run(move |_| log.lock().push(name.to_string()));
}

#[tokio::test]
async fn resolved_middleware_wraps_the_rest_of_the_chain() {
    let log: Log = Arc::default();
    let mut services = ServiceCollection::new();
    services.add_instance(Bracket { log: Arc::clone(&log) });
    let mut builder = PipelineBuilder::with_resolver(services.build());
    builder.use_middleware::<Bracket>();
    append(&mut builder, &log, "inner");

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(*log.lock(), vec!["open", "inner", "close"]);
}

#[tokio::test]
async fn unregistered_middleware_fails_with_service_not_found() {
    let mut builder = PipelineBuilder::new();
    builder.use_middleware::<Bracket>();

    let err = builder.build().expect("build").run().await.expect_err("missing");

    assert!(matches!(err, PipelineError::ServiceNotFound { .. }));
}

#[tokio::test]
async fn middleware_instances_can_stop_the_chain() {
    let log: Log = Arc::default();
    let mut builder = PipelineBuilder::new();
    builder.use_middleware_instance(Gate);
    append(&mut builder, &log, "unreachable");

    builder.build().expect("build").run().await.expect("run");

    assert!(log.lock().is_empty());
}

struct CountingJob {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Job for CountingJob {
    async fn execute(&self, cancellation: CancellationToken) -> StepResult {
        if cancellation.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct BrokenJob;

#[async_trait]
impl Job for BrokenJob {
    async fn execute(&self, _cancellation: CancellationToken) -> StepResult {
        Err(PipelineError::step("job broke"))
    }
}

#[tokio::test]
async fn jobs_are_resolved_and_run_before_the_chain_continues() {
    let log: Log = Arc::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut services = ServiceCollection::new();
    services
        .add_instance(CountingJob { runs: Arc::clone(&runs) })
        .add_instance(BrokenJob);
    let reported: Log = Arc::default();
    let mut builder = PipelineBuilder::with_resolver(services.build());
    builder.run_job::<CountingJob>();
    {
        let reported = Arc::clone(&reported);
        builder.try_run_job::<BrokenJob, _>(move |err| reported.lock().push(err.to_string()));
    }
    append(&mut builder, &log, "after");

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(*reported.lock(), vec!["Step execution failed: job broke"]);
    assert_eq!(*log.lock(), vec!["after"]);
}

#[tokio::test]
async fn a_failing_job_fails_the_run() {
    let mut services = ServiceCollection::new();
    services.add_instance(BrokenJob);
    let mut builder = PipelineBuilder::with_resolver(services.build());
    builder.run_job::<BrokenJob>();

    let err = builder.build().expect("build").run().await.expect_err("job fails");
    assert_eq!(err.to_string(), "Step execution failed: job broke");
}

// ---------------------------------------------------------------------------
// Async streams
// ---------------------------------------------------------------------------

#[tokio::test]
async fn the_rest_of_the_chain_runs_once_per_stream_element() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let mut builder = PipelineBuilder::new();
    builder.use_async_stream(|_| futures::stream::iter(vec![10_u32, 20, 30]).boxed());
    {
        let received = Arc::clone(&received);
        builder.run(move |ctx| {
            if let Some(item) = ctx.current_item::<u32>() {
                received.lock().push(*item);
            }
        });
    }

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(*received.lock(), vec![10, 20, 30]);
}

#[tokio::test]
async fn a_stream_stops_at_the_first_failing_element() {
    let processed = Arc::new(AtomicUsize::new(0));
    let mut builder = PipelineBuilder::new();
    builder.use_async_stream(|_| futures::stream::iter(1_u32..=5).boxed());
    {
        let processed = Arc::clone(&processed);
        builder.run_async(move |ctx| {
            let processed = Arc::clone(&processed);
            async move {
                let item = ctx.require_current_item::<u32>()?;
                if *item == 2 {
                    return Err(PipelineError::step("element 2 rejected"));
                }
                processed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }

    builder.build().expect("build").run().await.expect_err("element 2");

    assert_eq!(processed.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

fn idempotency_services() -> ServiceCollection {
    let store: SharedIdempotencyStore = Arc::new(InMemoryIdempotencyStore::new());
    let mut services = ServiceCollection::new();
    services.add_instance(store);
    services
}

#[tokio::test]
async fn a_completed_operation_is_skipped_on_later_runs() {
    let executions = Arc::new(AtomicUsize::new(0));
    let mut builder = PipelineBuilder::with_resolver(idempotency_services().build());
    {
        let executions = Arc::clone(&executions);
        builder.run(move |_| {
            executions.fetch_add(1, Ordering::SeqCst);
        });
    }
    builder.with_idempotency("import-2024-01");
    let pipeline = builder.build().expect("build");

    pipeline.run().await.expect("first");
    pipeline.run().await.expect("second");

    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_failed_operation_is_not_marked_completed() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut builder = PipelineBuilder::with_resolver(idempotency_services().build());
    {
        let attempts = Arc::clone(&attempts);
        builder.run_async(move |_| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(PipelineError::step("transient"))
                } else {
                    Ok(())
                }
            }
        });
    }
    builder.with_idempotency("flaky");
    let pipeline = builder.build().expect("build");

    pipeline.run().await.expect_err("first attempt fails");
    pipeline.run().await.expect("second attempt succeeds");
    pipeline.run().await.expect("third run skips");

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_later_failure_does_not_undo_a_completed_operation() {
    let executions = Arc::new(AtomicUsize::new(0));
    let downstream_calls = Arc::new(AtomicUsize::new(0));
    let mut builder = PipelineBuilder::with_resolver(idempotency_services().build());
    {
        let executions = Arc::clone(&executions);
        builder.run(move |_| {
            executions.fetch_add(1, Ordering::SeqCst);
        });
    }
    builder.with_idempotency("upload-report");
    {
        let downstream_calls = Arc::clone(&downstream_calls);
        builder.run_async(move |_| {
            let call = downstream_calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(PipelineError::step("notify failed"))
                } else {
                    Ok(())
                }
            }
        });
    }
    let pipeline = builder.build().expect("build");

    pipeline.run().await.expect_err("downstream step fails");
    pipeline.run().await.expect("retry succeeds");

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(downstream_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_custom_check_can_declare_an_operation_completed() {
    let executions = Arc::new(AtomicUsize::new(0));
    let mut builder = PipelineBuilder::with_resolver(idempotency_services().build());
    {
        let executions = Arc::clone(&executions);
        builder.run(move |_| {
            executions.fetch_add(1, Ordering::SeqCst);
        });
    }
    builder.with_idempotency_check("already-done-elsewhere", |_| async { Ok(true) });

    builder.build().expect("build").run().await.expect("run");

    assert_eq!(executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn idempotency_without_a_store_fails_the_step() {
    let mut builder = PipelineBuilder::new();
    builder.run(|_| {});
    builder.with_idempotency("no store");

    let err = builder.build().expect("build").run().await.expect_err("no store");
    assert!(matches!(err, PipelineError::ServiceNotFound { .. }));
}

// ---------------------------------------------------------------------------
// Registry and built-in inspectors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registered_pipelines_are_built_once_and_cached() {
    let builds = Arc::new(AtomicUsize::new(0));
    let registry = PipelineRegistry::new(ServiceCollection::new().build());
    let name = PipelineName::new("nightly").expect("valid name");
    {
        let builds = Arc::clone(&builds);
        registry.register(name.clone(), move |builder| {
            builds.fetch_add(1, Ordering::SeqCst);
            builder.run(|_| {});
        });
    }

    let first = registry.get(&name).expect("first");
    let second = registry.get(&name).expect("second");
    registry.run(&name, CancellationToken::new()).await.expect("run");

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(registry.names(), vec![name]);
}

#[tokio::test]
async fn an_unknown_pipeline_name_is_a_configuration_error() {
    let registry = PipelineRegistry::new(ServiceCollection::new().build());
    let name = PipelineName::new("missing").expect("valid name");

    let err = registry.get(&name).expect_err("unknown");
    assert!(err.is_configuration());
}

#[tokio::test]
async fn built_in_inspectors_observe_every_step() {
    let timing = Arc::new(TimingInspector::new());
    let mut builder = PipelineBuilder::new();
    builder
        .add_inspector(Arc::new(LoggingInspector))
        .add_inspector(Arc::clone(&timing));
    builder.run(|_| {}).with_step_id("first");
    builder.run(|_| {}).with_step_id("second");

    builder.build().expect("build").run().await.expect("run");

    let ids: Vec<String> = timing
        .timings()
        .iter()
        .map(|t| t.step_id.as_str().to_string())
        .collect();
    // Timings are recorded as steps finish, innermost first.
    assert_eq!(ids, vec!["second", "first"]);
    assert!(timing.total_for("first") >= timing.total_for("second"));
}
