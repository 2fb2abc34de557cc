//! Command Queue
//!
//! Many producers, one consumer. Any thread may [`submit`](CommandQueue::submit)
//! a closure; the engine loop thread dequeues and runs commands one at a time,
//! in submission order, and the submitting thread blocks until its own result
//! comes back on a private reply channel.
//!
//! A closed queue never silently drops work: commands still pending when the
//! loop stops are completed with [`PhoneError::ShuttingDown`], and later
//! submissions fail fast.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::engine_loop::EngineContext;
use crate::error::{PhoneError, PhoneResult};

/// Per-submission options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Give up waiting after this long
    ///
    /// A command that has not started yet is cancelled and yields
    /// [`PhoneError::Timeout`]. One that already started still runs to the end;
    /// the caller gets [`PhoneError::TimedOutRunning`] and never sees its result.
    pub timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Lifecycle of the queue, mirrored from the engine loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting commands
    Open,
    /// Engine is being torn down; pending and new commands get `ShuttingDown`
    Closing,
    /// Engine loop has exited
    Closed,
}

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

type Job = Box<dyn FnOnce(&mut EngineContext) + Send>;
type Abort = Box<dyn FnOnce(PhoneError) + Send>;

/// A submitted closure together with its way back to the caller
pub struct Command {
    seq: u64,
    progress: Arc<AtomicU8>,
    job: Job,
    abort: Abort,
}

impl Command {
    /// Submission sequence number, unique per queue
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Run on the engine loop thread; cancelled commands are skipped
    pub(crate) fn execute(self, ctx: &mut EngineContext) {
        if self
            .progress
            .compare_exchange(QUEUED, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(seq = self.seq, "Skipping cancelled command");
            return;
        }
        trace!(seq = self.seq, "Executing command");
        (self.job)(ctx);
    }

    pub fn is_cancelled(&self) -> bool {
        self.progress.load(Ordering::Acquire) == CANCELLED
    }

    /// Complete the waiting caller with `error` without running the closure
    pub(crate) fn abort(self, error: PhoneError) {
        (self.abort)(error);
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("seq", &self.seq)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// FIFO queue of commands for one engine loop
pub struct CommandQueue {
    tx: Sender<Command>,
    rx: Receiver<Command>,
    state: RwLock<QueueState>,
    next_seq: AtomicU64,
    consumer: OnceLock<ThreadId>,
}

impl CommandQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            state: RwLock::new(QueueState::Open),
            next_seq: AtomicU64::new(0),
            consumer: OnceLock::new(),
        }
    }

    pub fn state(&self) -> QueueState {
        *self.state.read()
    }

    /// Number of commands waiting to run
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Whether the current thread is the consumer thread
    pub fn on_consumer_thread(&self) -> bool {
        self.consumer.get() == Some(&thread::current().id())
    }

    /// Record the consuming thread; submissions from it are rejected
    pub(crate) fn bind_consumer(&self) {
        let _ = self.consumer.set(thread::current().id());
    }

    /// Submit `f` and block until it ran on the consumer thread
    pub fn submit<F, T>(&self, f: F) -> PhoneResult<T>
    where
        F: FnOnce(&mut EngineContext) -> PhoneResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with(SubmitOptions::default(), f)
    }

    /// Submit `f` with explicit options
    pub fn submit_with<F, T>(&self, options: SubmitOptions, f: F) -> PhoneResult<T>
    where
        F: FnOnce(&mut EngineContext) -> PhoneResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.on_consumer_thread() {
            return Err(PhoneError::Reentrant);
        }

        let (reply_tx, reply_rx) = bounded::<PhoneResult<T>>(1);
        let progress = Arc::new(AtomicU8::new(QUEUED));
        let seq = {
            // Held across the send so close() cannot miss a command in flight
            let state = self.state.read();
            match *state {
                QueueState::Open => {}
                QueueState::Closing => return Err(PhoneError::ShuttingDown),
                QueueState::Closed => return Err(PhoneError::EngineNotRunning),
            }

            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let abort_tx = reply_tx.clone();
            let command = Command {
                seq,
                progress: progress.clone(),
                job: Box::new(move |ctx: &mut EngineContext| {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(ctx)))
                        .unwrap_or_else(|payload| {
                            let message = panic_message(payload.as_ref());
                            warn!(seq, %message, "Command panicked on engine loop");
                            Err(PhoneError::CommandPanicked { message })
                        });
                    let _ = reply_tx.send(outcome);
                }),
                abort: Box::new(move |error| {
                    let _ = abort_tx.send(Err(error));
                }),
            };

            self.tx
                .send(command)
                .map_err(|_| PhoneError::EngineNotRunning)?;
            seq
        };

        trace!(seq, "Command submitted");

        match options.timeout {
            Some(timeout) => match reply_rx.recv_timeout(timeout) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) => {
                    let duration_ms = timeout.as_millis() as u64;
                    match progress.compare_exchange(
                        QUEUED,
                        CANCELLED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            debug!(seq, timeout_ms = duration_ms, "Command timed out before running");
                            Err(PhoneError::Timeout { duration_ms })
                        }
                        Err(_) => {
                            debug!(seq, timeout_ms = duration_ms, "Command timed out while running");
                            Err(PhoneError::TimedOutRunning { duration_ms })
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => Err(PhoneError::ShuttingDown),
            },
            None => reply_rx.recv().unwrap_or(Err(PhoneError::ShuttingDown)),
        }
    }

    /// Wait up to `timeout` for the next command
    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Option<Command> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Stop accepting commands and fail everything pending with `ShuttingDown`
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.write();
            if *state == QueueState::Open {
                *state = QueueState::Closing;
            }
        }
        let aborted = self.drain(PhoneError::ShuttingDown);
        if aborted > 0 {
            debug!(aborted, "Aborted pending commands on shutdown");
        }
    }

    /// Mark the queue closed after the loop exited
    pub(crate) fn finish(&self) {
        *self.state.write() = QueueState::Closed;
        self.drain(PhoneError::ShuttingDown);
    }

    fn drain(&self, error: PhoneError) -> usize {
        let mut count = 0;
        while let Ok(command) = self.rx.try_recv() {
            command.abort(error.clone());
            count += 1;
        }
        count
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
