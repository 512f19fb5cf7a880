//! Completion signals bridge one blocking native call into a pollable
//! asynchronous operation.
//!
//! Two modes exist. Where the driver supports true asynchronous execution,
//! the call is bound to an OS wait object and polled through [`WaitEvent`].
//! Everywhere else a detached worker thread runs the call synchronously and
//! flips a flag immediately before exiting; polling re-checks that flag
//! after a bounded sleep.

use crate::driver::{Driver, NativeHandle, SqlReturn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStatus {
    Ready,
    NotReady,
}

/// A native OS wait object supplied by the driver in async mode.
pub trait WaitEvent: Send {
    /// Bounded wait; returns the state of the object afterwards.
    fn wait(&self, max_wait: Duration) -> SignalStatus;
}

struct WorkerState {
    ready: AtomicBool,
    retcode: Mutex<Option<SqlReturn>>,
}

/// Thread-emulated completion signal.
///
/// The worker owns the call's input buffers until it signals completion;
/// it stores the return code, then sets the flag, and touches nothing else.
pub struct WorkerSignal {
    state: Arc<WorkerState>,
}

impl WorkerSignal {
    /// Spawn a detached worker that performs exactly one native call.
    pub fn spawn<F>(call: F) -> Self
    where
        F: FnOnce() -> SqlReturn + Send + 'static,
    {
        let state = Arc::new(WorkerState {
            ready: AtomicBool::new(false),
            retcode: Mutex::new(None),
        });
        let worker_state = Arc::clone(&state);
        thread::spawn(move || {
            let rc = call();
            if let Ok(mut slot) = worker_state.retcode.lock() {
                *slot = Some(rc);
            }
            worker_state.ready.store(true, Ordering::Release);
        });
        Self { state }
    }

    pub fn poll(&self, max_wait: Duration) -> SignalStatus {
        if self.state.ready.load(Ordering::Acquire) {
            return SignalStatus::Ready;
        }
        thread::sleep(max_wait);
        if self.state.ready.load(Ordering::Acquire) {
            SignalStatus::Ready
        } else {
            SignalStatus::NotReady
        }
    }

    pub fn force_ready(&self) {
        self.state.ready.store(true, Ordering::Release);
    }

    fn stored_return(&self) -> SqlReturn {
        self.state
            .retcode
            .lock()
            .ok()
            .and_then(|slot| *slot)
            .unwrap_or(SqlReturn::Error)
    }
}

/// The waitable object an operation state machine polls.
pub enum CompletionSignal {
    Worker(WorkerSignal),
    Native {
        event: Box<dyn WaitEvent>,
        handle: NativeHandle,
    },
}

impl CompletionSignal {
    pub fn poll(&self, max_wait: Duration) -> SignalStatus {
        match self {
            CompletionSignal::Worker(worker) => worker.poll(max_wait),
            CompletionSignal::Native { event, .. } => event.wait(max_wait),
        }
    }

    /// Mark the signal ready without a completion; used when a timeout
    /// abandons the in-flight call.
    pub fn force_ready(&self) {
        if let CompletionSignal::Worker(worker) = self {
            worker.force_ready();
        }
    }

    /// Finalize the native call and retrieve its return code. In native
    /// mode this performs the driver's explicit complete-async step.
    pub fn complete(&self, driver: &dyn Driver) -> SqlReturn {
        match self {
            CompletionSignal::Worker(worker) => worker.stored_return(),
            CompletionSignal::Native { handle, .. } => driver.complete_async(*handle),
        }
    }
}
