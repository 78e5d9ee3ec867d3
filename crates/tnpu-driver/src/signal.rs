//! Completion hand-off between the interrupt path and a waiting run.
//!
//! The interrupt path writes the status word under the signal's mutex and
//! notifies the condition variable; the waiting thread reads it under the
//! same mutex, so it never observes a partially published status.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback the secure peer invokes when the execution unit raises its interrupt.
pub type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// How a wait on a [`CompletionSignal`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Interrupt delivered this status word
    Signalled(u32),
    /// Deadline passed without an interrupt
    TimedOut,
    /// Caller asked to abandon the wait
    Cancelled,
}

#[derive(Debug, Default)]
struct SignalState {
    armed: bool,
    status: Option<u32>,
    cancelled: bool,
}

/// Single-producer, single-consumer completion signal.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl CompletionSignal {
    /// Disarmed signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare for one run. Any stale status or cancellation is discarded.
    pub fn arm(&self) {
        let mut state = self.state.lock();
        *state = SignalState {
            armed: true,
            status: None,
            cancelled: false,
        };
    }

    /// Publish `status` to the waiter.
    ///
    /// Returns `false` if nothing is armed or a status is already pending.
    pub fn raise(&self, status: u32) -> bool {
        let mut state = self.state.lock();
        if !state.armed || state.status.is_some() {
            return false;
        }
        state.status = Some(status);
        self.cond.notify_all();
        true
    }

    /// Ask an armed wait to give up. Returns `false` if nothing is armed.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if !state.armed {
            return false;
        }
        state.cancelled = true;
        self.cond.notify_all();
        true
    }

    /// Block until the signal is raised, cancelled or `timeout` expires.
    ///
    /// A status that arrives together with a cancellation wins. The signal is
    /// disarmed on return.
    pub fn wait(&self, timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(result) = Self::settled(&mut state) {
                return result;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Self::settled(&mut state).unwrap_or_else(|| {
                    state.armed = false;
                    WaitResult::TimedOut
                });
            }
        }
    }

    fn settled(state: &mut MutexGuard<'_, SignalState>) -> Option<WaitResult> {
        let result = match (state.status, state.cancelled) {
            (Some(status), _) => WaitResult::Signalled(status),
            (None, true) => WaitResult::Cancelled,
            (None, false) => return None,
        };
        state.armed = false;
        state.cancelled = false;
        Some(result)
    }

    /// Drop the armed state without waiting.
    pub fn disarm(&self) {
        let mut state = self.state.lock();
        state.armed = false;
        state.cancelled = false;
    }

    /// A wait is armed.
    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }
}

/// Serializes interrupt handlers so the engine can wait for one in flight.
#[derive(Debug, Default)]
pub struct IrqLine {
    handler: Mutex<()>,
}

impl IrqLine {
    /// New line with no handler running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Held for the duration of one handler invocation.
    pub fn enter(&self) -> MutexGuard<'_, ()> {
        self.handler.lock()
    }

    /// Return once no handler is running.
    pub fn synchronize(&self) {
        drop(self.handler.lock());
    }
}

/// Cancels the run currently waiting on the device, if any.
#[derive(Debug, Clone)]
pub struct RunInterrupter {
    signal: Arc<CompletionSignal>,
}

impl RunInterrupter {
    pub(crate) fn new(signal: Arc<CompletionSignal>) -> Self {
        Self { signal }
    }

    /// Interrupt the waiting run. Returns `false` if no run was waiting.
    pub fn interrupt(&self) -> bool {
        let hit = self.signal.cancel();
        if hit {
            tracing::debug!("run interrupted by caller");
        }
        hit
    }
}
