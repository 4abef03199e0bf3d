//! Multi-producer, multi-consumer queue used by channel topologies.
//!
//! A channel has a write side ([`ChannelWriter`]) and a read side
//! ([`ChannelReader`]); both are cheap to clone and every clone talks to the
//! same queue. Writers *complete* the channel when they are done; readers then
//! drain what is left and observe [`ChannelError::Completed`]. A channel may
//! also be *closed*, which fails pending and future writes immediately.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::types::FullMode;

/// Failures reported by channel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The write side has been completed (and, for reads, the queue is empty).
    #[error("Channel has been completed")]
    Completed,

    /// The channel was closed before the operation could finish.
    #[error("Channel has been closed")]
    Closed,
}

struct State<T> {
    queue: VecDeque<T>,
    completed: bool,
    closed: bool,
    dropped: u64,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: Option<usize>,
    full_mode: FullMode,
    readable: Notify,
    writable: Notify,
}

/// Creates a channel. `capacity` of `None` gives an unbounded queue;
/// `full_mode` only matters for bounded queues.
pub fn channel<T>(capacity: Option<usize>, full_mode: FullMode) -> (ChannelWriter<T>, ChannelReader<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            completed: false,
            closed: false,
            dropped: 0,
        }),
        capacity: capacity.map(|c| c.max(1)),
        full_mode,
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        ChannelWriter {
            shared: Arc::clone(&shared),
        },
        ChannelReader { shared },
    )
}

// ---------------------------------------------------------------------------
// Write side
// ---------------------------------------------------------------------------

/// Write side of a channel.
pub struct ChannelWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ChannelWriter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for ChannelWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("capacity", &self.shared.capacity)
            .field("full_mode", &self.shared.full_mode)
            .finish()
    }
}

enum Offer<T> {
    Accepted,
    Full(T),
}

impl<T> ChannelWriter<T> {
    /// Writes an item, waiting for room when the queue is bounded, full and
    /// the full mode is [`FullMode::Wait`].
    pub async fn write(&self, item: T) -> Result<(), ChannelError> {
        let mut item = item;
        loop {
            let notified = self.shared.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.offer(item)? {
                Offer::Accepted => return Ok(()),
                Offer::Full(rejected) => item = rejected,
            }
            notified.await;
        }
    }

    /// Writes an item without waiting. Returns the item back when the queue
    /// is full and the full mode is [`FullMode::Wait`].
    pub fn try_write(&self, item: T) -> Result<Result<(), T>, ChannelError> {
        match self.offer(item)? {
            Offer::Accepted => Ok(Ok(())),
            Offer::Full(rejected) => Ok(Err(rejected)),
        }
    }

    fn offer(&self, item: T) -> Result<Offer<T>, ChannelError> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if state.completed {
                return Err(ChannelError::Completed);
            }
            let full = self
                .shared
                .capacity
                .is_some_and(|capacity| state.queue.len() >= capacity);
            if full {
                match self.shared.full_mode {
                    FullMode::Wait => return Ok(Offer::Full(item)),
                    FullMode::DropWrite => {
                        state.dropped += 1;
                        return Ok(Offer::Accepted);
                    }
                    FullMode::DropNewest => {
                        state.queue.pop_back();
                        state.dropped += 1;
                    }
                    FullMode::DropOldest => {
                        state.queue.pop_front();
                        state.dropped += 1;
                    }
                }
            }
            state.queue.push_back(item);
        }
        self.shared.readable.notify_waiters();
        Ok(Offer::Accepted)
    }

    /// Marks the write side complete. Returns `true` only for the call that
    /// actually completed the channel.
    pub fn complete(&self) -> bool {
        let completed_now = {
            let mut state = self.shared.state.lock();
            let was_completed = state.completed;
            state.completed = true;
            !was_completed
        };
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
        completed_now
    }

    /// Closes the channel: pending and future writes fail with
    /// [`ChannelError::Closed`]; readers stop once the queue is empty.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();
    }

    /// Returns `true` once the write side has been completed.
    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().completed
    }

    /// Number of items discarded by a dropping full mode.
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }
}

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

/// Read side of a channel.
pub struct ChannelReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ChannelReader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for ChannelReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReader")
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

impl<T> ChannelReader<T> {
    /// Reads the next item, waiting while the queue is empty.
    ///
    /// Fails with [`ChannelError::Completed`] once the channel is completed
    /// (or closed) and drained.
    pub async fn read(&self) -> Result<T, ChannelError> {
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(next) = self.poll_next() {
                return next;
            }
            notified.await;
        }
    }

    /// Reads an item if one is queued, without waiting.
    pub fn try_read(&self) -> Option<Result<T, ChannelError>> {
        self.poll_next()
    }

    fn poll_next(&self) -> Option<Result<T, ChannelError>> {
        let popped = {
            let mut state = self.shared.state.lock();
            match state.queue.pop_front() {
                Some(item) => Ok(item),
                None if state.completed || state.closed => return Some(Err(ChannelError::Completed)),
                None => return None,
            }
        };
        self.shared.writable.notify_waiters();
        Some(popped)
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Streams every item until the channel is completed and drained.
    pub fn read_all(&self) -> BoxStream<'static, T>
    where
        T: Send + 'static,
    {
        stream::unfold(self.clone(), |reader| async move {
            match reader.read().await {
                Ok(item) => Some((item, reader)),
                Err(_) => None,
            }
        })
        .boxed()
    }
}
