//! Shared value types: concurrency and channel settings, timestamps.
//!
//! The settings types derive [`Deserialize`] with field defaults so they can
//! be loaded from a JSON settings file as well as built in code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Fan-out concurrency
// ---------------------------------------------------------------------------

/// Controls how many branches of one fan-out may run at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyOptions {
    /// Maximum number of concurrently active branches.
    ///
    /// `None` means unbounded. A value of `0` is treated as `1`.
    pub max_concurrency: Option<usize>,

    /// When `true`, a failing branch does not short-circuit the join: every
    /// branch still runs to completion and the first error is reported
    /// afterwards.
    pub wait_for_all: bool,
}

impl Default for ConcurrencyOptions {
    /// Bounded by the machine's available parallelism.
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_concurrency: Some(cpus),
            wait_for_all: false,
        }
    }
}

impl ConcurrencyOptions {
    /// No bound on concurrently active branches.
    pub fn unbounded() -> Self {
        Self {
            max_concurrency: None,
            wait_for_all: false,
        }
    }

    /// At most `limit` concurrently active branches.
    pub fn max(limit: usize) -> Self {
        Self {
            max_concurrency: Some(limit),
            wait_for_all: false,
        }
    }

    /// Returns a copy that waits for every branch before reporting failure.
    #[must_use]
    pub fn waiting_for_all(mut self) -> Self {
        self.wait_for_all = true;
        self
    }

    /// The effective bound, always at least one.
    pub fn limit(&self) -> usize {
        self.max_concurrency.unwrap_or(usize::MAX).max(1)
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// What a bounded channel does when a write finds the queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullMode {
    /// Wait until a reader frees a slot.
    #[default]
    Wait,
    /// Remove the most recently queued item to make room.
    DropNewest,
    /// Remove the oldest queued item to make room.
    DropOldest,
    /// Discard the item being written.
    DropWrite,
}

/// Shape of a producer/consumer channel topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Number of concurrent reader branches.
    pub reader_count: usize,
    /// Number of concurrent writer branches.
    pub writer_count: usize,
    /// Queue capacity; `None` creates an unbounded channel.
    pub capacity: Option<usize>,
    /// Policy applied when a bounded queue is full.
    pub full_mode: FullMode,
    /// Complete the write side once all writer branches have finished.
    pub auto_complete: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            reader_count: 1,
            writer_count: 1,
            capacity: None,
            full_mode: FullMode::Wait,
            auto_complete: true,
        }
    }
}

impl ChannelOptions {
    /// Sets the number of reader branches.
    #[must_use]
    pub fn readers(mut self, count: usize) -> Self {
        self.reader_count = count;
        self
    }

    /// Sets the number of writer branches.
    #[must_use]
    pub fn writers(mut self, count: usize) -> Self {
        self.writer_count = count;
        self
    }

    /// Makes the channel bounded with the given capacity and full-queue policy.
    #[must_use]
    pub fn bounded(mut self, capacity: usize, full_mode: FullMode) -> Self {
        self.capacity = Some(capacity);
        self.full_mode = full_mode;
        self
    }

    /// Enables or disables automatic completion of the write side.
    #[must_use]
    pub fn auto_complete(mut self, enabled: bool) -> Self {
        self.auto_complete = enabled;
        self
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%H:%M:%S%.3f"))
    }
}
