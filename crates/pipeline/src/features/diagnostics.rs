//! Built-in inspectors: structured logging, step timing, and concurrency
//! monitoring.
//!
//! All three are shared with branches, so registering one on a root pipeline
//! observes every branch it starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::errors::{PipelineError, StepResult};
use crate::identifiers::{StepId, StepIndex};
use crate::inspector::{PipelineInspector, StepContext};
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Emits a `tracing` event around every step.
#[derive(Debug, Default)]
pub struct LoggingInspector;

#[async_trait]
impl PipelineInspector for LoggingInspector {
    async fn before_step(&self, step: &mut StepContext) -> StepResult {
        info!(
            run_id = %step.context().run_id(),
            depth = step.context().depth(),
            step_index = %step.step_index(),
            step_id = %step.step_id(),
            step_type = step.step_type(),
            "step starting"
        );
        Ok(())
    }

    async fn after_step(&self, step: &mut StepContext) -> StepResult {
        info!(
            run_id = %step.context().run_id(),
            step_index = %step.step_index(),
            step_id = %step.step_id(),
            duration_ms = step.duration().as_millis() as u64,
            skipped = step.should_skip(),
            failed = step.failed(),
            "step finished"
        );
        Ok(())
    }

    async fn on_exception(&self, step: &mut StepContext, err: &PipelineError) -> StepResult {
        error!(
            run_id = %step.context().run_id(),
            step_index = %step.step_index(),
            step_id = %step.step_id(),
            error = %err,
            "step failed"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Duration of one step dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct StepTiming {
    pub step_index: StepIndex,
    pub step_id: StepId,
    pub duration: Duration,
    pub skipped: bool,
}

/// Records how long every step dispatch took, in completion order.
#[derive(Debug, Default)]
pub struct TimingInspector {
    timings: Mutex<Vec<StepTiming>>,
}

impl TimingInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded timings.
    pub fn timings(&self) -> Vec<StepTiming> {
        self.timings.lock().clone()
    }

    /// Total recorded duration for steps with `step_id`.
    pub fn total_for(&self, step_id: &str) -> Duration {
        self.timings
            .lock()
            .iter()
            .filter(|t| t.step_id.as_str() == step_id)
            .map(|t| t.duration)
            .sum()
    }
}

#[async_trait]
impl PipelineInspector for TimingInspector {
    async fn after_step(&self, step: &mut StepContext) -> StepResult {
        self.timings.lock().push(StepTiming {
            step_index: step.step_index(),
            step_id: step.step_id().clone(),
            duration: step.duration(),
            skipped: step.should_skip(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Concurrency monitoring
// ---------------------------------------------------------------------------

/// Whether a timeline entry marks a step starting or finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started,
    Finished,
}

/// One start or finish observed by the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub timestamp: Timestamp,
    pub step_id: StepId,
    pub event: ExecutionEvent,
    /// Active executions of the step right after this event.
    pub active: usize,
}

/// Concurrency figures for one step id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepConcurrency {
    pub active: usize,
    pub max_concurrency: usize,
    pub total_executions: usize,
}

/// Serialisable snapshot of a [`ConcurrencyMonitorInspector`].
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyReport {
    pub steps: Vec<(StepId, StepConcurrency)>,
    pub timeline: Vec<TimelineEntry>,
}

impl std::fmt::Display for ConcurrencyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Concurrency report")?;
        for (step_id, stats) in &self.steps {
            writeln!(
                f,
                "  {step_id}: max {} concurrent, {} executions",
                stats.max_concurrency, stats.total_executions
            )?;
        }
        writeln!(f, "Timeline")?;
        for entry in &self.timeline {
            let event = match entry.event {
                ExecutionEvent::Started => "started",
                ExecutionEvent::Finished => "finished",
            };
            writeln!(
                f,
                "  {} {} {event} (active: {})",
                entry.timestamp, entry.step_id, entry.active
            )?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct MonitorState {
    steps: HashMap<StepId, StepConcurrency>,
    timeline: Vec<TimelineEntry>,
}

/// Counts how many dispatches of each step id are active at once, across the
/// root pipeline and all of its branches.
#[derive(Default)]
pub struct ConcurrencyMonitorInspector {
    state: Mutex<MonitorState>,
}

impl std::fmt::Debug for ConcurrencyMonitorInspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyMonitorInspector")
            .field("steps", &self.state.lock().steps.len())
            .finish()
    }
}

impl ConcurrencyMonitorInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest number of simultaneously active dispatches of `step_id`.
    pub fn max_concurrency(&self, step_id: &str) -> usize {
        self.stats(step_id).map_or(0, |s| s.max_concurrency)
    }

    /// Number of dispatches of `step_id` that have started.
    pub fn total_executions(&self, step_id: &str) -> usize {
        self.stats(step_id).map_or(0, |s| s.total_executions)
    }

    fn stats(&self, step_id: &str) -> Option<StepConcurrency> {
        self.state
            .lock()
            .steps
            .iter()
            .find(|(id, _)| id.as_str() == step_id)
            .map(|(_, stats)| stats.clone())
    }

    pub fn report(&self) -> ConcurrencyReport {
        let state = self.state.lock();
        let mut steps: Vec<_> = state
            .steps
            .iter()
            .map(|(id, stats)| (id.clone(), stats.clone()))
            .collect();
        steps.sort_by(|a, b| a.0.cmp(&b.0));
        ConcurrencyReport {
            steps,
            timeline: state.timeline.clone(),
        }
    }

    fn record(&self, step_id: &StepId, event: ExecutionEvent) {
        let mut state = self.state.lock();
        let stats = state.steps.entry(step_id.clone()).or_default();
        match event {
            ExecutionEvent::Started => {
                stats.active += 1;
                stats.total_executions += 1;
                stats.max_concurrency = stats.max_concurrency.max(stats.active);
            }
            ExecutionEvent::Finished => stats.active = stats.active.saturating_sub(1),
        }
        let active = stats.active;
        state.timeline.push(TimelineEntry {
            timestamp: Timestamp::now(),
            step_id: step_id.clone(),
            event,
            active,
        });
    }
}

/// Step-state marker for a dispatch whose start the monitor recorded.
struct MonitoredDispatch;

#[async_trait]
impl PipelineInspector for ConcurrencyMonitorInspector {
    async fn before_step(&self, step: &mut StepContext) -> StepResult {
        step.context()
            .set_step_state_at(step.step_index(), Arc::new(MonitoredDispatch));
        self.record(step.step_id(), ExecutionEvent::Started);
        Ok(())
    }

    async fn after_step(&self, step: &mut StepContext) -> StepResult {
        // Skipped by an earlier inspector: this dispatch never started here.
        if step
            .context()
            .take_step_state_at::<MonitoredDispatch>(step.step_index())
            .is_some()
        {
            self.record(step.step_id(), ExecutionEvent::Finished);
        }
        Ok(())
    }
}
