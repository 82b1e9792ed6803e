//! Deferred command queue
//!
//! A card processes one command at a time, so operations that arrive while a chained exchange
//! is in flight are parked here and run afterwards, in submission order, by whoever owns the
//! connection. The queue never spawns threads; [`CommandQueue::run_pending`] runs on the
//! caller's thread.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use parking_lot::Mutex;
use tracing::{debug, trace};

type Task<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Handle to a queued operation, used for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("#{_0}")]
pub struct Ticket(u64);

struct Pending<C> {
    ticket: Ticket,
    delay: Option<Duration>,
    task: Task<C>,
}

struct Inner<C> {
    next_ticket: u64,
    pending: VecDeque<Pending<C>>,
}

/// FIFO of operations to run after the current command sequence completes
///
/// Handles are cheap to clone and can be shared with other threads; all of them feed the same
/// queue.
pub struct CommandQueue<C> {
    inner: Arc<Mutex<Inner<C>>>,
}

impl<C> CommandQueue<C> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_ticket: 0,
                pending: VecDeque::new(),
            })),
        }
    }

    /// Queue `task` to run after everything queued before it
    pub fn execute_after_current_commands<F>(&self, task: F) -> Ticket
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.push(None, Box::new(task))
    }

    /// Queue `task` to run after everything queued before it, waiting `delay` first
    pub fn execute_after_current_commands_with_delay<F>(&self, delay: Duration, task: F) -> Ticket
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.push(Some(delay), Box::new(task))
    }

    /// Remove a queued operation that has not started yet
    ///
    /// Returns `false` when the operation already ran, is running, or was cancelled before.
    pub fn cancel(&self, ticket: Ticket) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.pending.len();
        inner.pending.retain(|p| p.ticket != ticket);
        let removed = inner.pending.len() != before;
        if removed {
            debug!(%ticket, "Cancelled queued operation");
        }
        removed
    }

    /// Number of operations waiting to run
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether no operations are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run queued operations in order until the queue is empty
    ///
    /// Operations queued while this runs, including by the operations themselves, run in the
    /// same call. Returns the number of operations run.
    pub fn run_pending(&self, context: &mut C) -> usize {
        let mut ran = 0;
        // The lock is released before each task so tasks may queue further work
        while let Some(pending) = self.pop() {
            if let Some(delay) = pending.delay {
                trace!(ticket = %pending.ticket, ?delay, "Delaying queued operation");
                std::thread::sleep(delay);
            }
            trace!(ticket = %pending.ticket, "Running queued operation");
            (pending.task)(context);
            ran += 1;
        }
        ran
    }

    fn push(&self, delay: Option<Duration>, task: Task<C>) -> Ticket {
        let mut inner = self.inner.lock();
        let ticket = Ticket(inner.next_ticket);
        inner.next_ticket += 1;
        inner.pending.push_back(Pending {
            ticket,
            delay,
            task,
        });
        ticket
    }

    fn pop(&self) -> Option<Pending<C>> {
        self.inner.lock().pending.pop_front()
    }
}

impl<C> Default for CommandQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Clone for CommandQueue<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for CommandQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("pending", &self.len())
            .finish()
    }
}
