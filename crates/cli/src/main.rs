//! Conduit CLI entry point.
//!
//! This binary is the composition root:
//!
//! 1. **Wire observability**: `tracing-subscriber` with an `EnvFilter`
//!    (`RUST_LOG`, default `info`). Set `CONDUIT_LOG_FORMAT=json` for JSON
//!    lines instead of the human-readable format.
//! 2. **Load settings**: [`DemoSettings`] from the JSON file named by the
//!    first argument or by `CONDUIT_CONFIG`; defaults otherwise.
//! 3. **Run the demonstration pipeline**: a producer/consumer topology whose
//!    readers square every item, with a concurrency monitor attached. Ctrl-C
//!    cancels the run.
//! 4. **Report**: print the concurrency report.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pipeline::{
    ChannelOptions, ChannelWriter, ConcurrencyMonitorInspector, LoggingInspector, PipelineBuilder,
    PipelineError,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "CONDUIT_CONFIG";
const LOG_FORMAT_ENV: &str = "CONDUIT_LOG_FORMAT";

/// Settings for the demonstration pipeline.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct DemoSettings {
    /// Number of items each writer produces.
    items_per_writer: u64,
    /// Simulated per-item processing time in milliseconds.
    work_millis: u64,
    /// Emit a log event for every step dispatch.
    log_steps: bool,
    channel: ChannelOptions,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            items_per_writer: 25,
            work_millis: 5,
            log_steps: false,
            channel: ChannelOptions::default().readers(4).writers(2),
        }
    }
}

impl DemoSettings {
    fn load() -> Result<Self> {
        let path = std::env::args_os()
            .nth(1)
            .map(PathBuf::from)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid settings in {}", path.display()))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let result = if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing already initialised: {err}");
    }
}

fn produce(branch: &mut PipelineBuilder, writer: ChannelWriter<u64>, next_block: Arc<AtomicU64>, count: u64) {
    branch
        .run_async(move |ctx| {
            let writer = writer.clone();
            let start = next_block.fetch_add(1, Ordering::SeqCst) * count;
            async move {
                for item in start..start + count {
                    ctx.check_cancelled()?;
                    writer.write(item).await?;
                }
                Ok(())
            }
        })
        .with_step_id("produce");
}

fn consume(branch: &mut PipelineBuilder, total: Arc<AtomicU64>, work: Duration) {
    branch
        .run_async(move |ctx| {
            let total = Arc::clone(&total);
            async move {
                let item = ctx.require_current_item::<u64>()?;
                ctx.delay(work).await?;
                total.fetch_add(*item * *item, Ordering::SeqCst);
                Ok(())
            }
        })
        .with_step_id("consume");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let settings = DemoSettings::load()?;
    info!(?settings, "starting demonstration pipeline");

    let monitor = Arc::new(ConcurrencyMonitorInspector::new());
    let total = Arc::new(AtomicU64::new(0));
    let next_block = Arc::new(AtomicU64::new(0));
    let work = Duration::from_millis(settings.work_millis);
    let count = settings.items_per_writer;

    let mut builder = PipelineBuilder::new();
    builder.add_inspector(Arc::clone(&monitor));
    if settings.log_steps {
        builder.add_inspector(Arc::new(LoggingInspector));
    }
    {
        let total = Arc::clone(&total);
        builder
            .use_channel::<u64, _, _>(
                move |reader| consume(reader, Arc::clone(&total), work),
                move |writer, channel| produce(writer, channel, Arc::clone(&next_block), count),
                settings.channel.clone(),
            )
            .with_step_id("topology");
    }
    let pipeline = builder.build().context("failed to build the demonstration pipeline")?;

    let cancellation = CancellationToken::new();
    {
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling run");
                cancellation.cancel();
            }
        });
    }

    match pipeline.run_with_cancellation(cancellation).await {
        Ok(()) => info!(sum_of_squares = total.load(Ordering::SeqCst), "run completed"),
        Err(PipelineError::Cancelled) => warn!("run cancelled"),
        Err(err) => return Err(err).context("demonstration pipeline failed"),
    }

    println!("{}", monitor.report());
    Ok(())
}
