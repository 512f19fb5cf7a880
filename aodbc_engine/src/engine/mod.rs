//! The asynchronous engine: pollable operations, sessions and statements.

pub mod operation;
pub mod session;
pub mod statement;

pub use session::{connect, connect_with_settings, CloseFuture, ConnectFuture, Session};
pub use statement::{ExecuteFuture, Row, Statement};

/// Poll outcome of an engine future.
#[derive(Debug)]
pub enum PollState<T> {
    Pending,
    Ready(T),
}

impl<T> PollState<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollState::Ready(_))
    }
}

/// Poll a future closure to completion. Stands in for an external scheduler
/// when none is attached, which is how the tests drive the engine.
pub fn drive<T, F>(mut poll: F) -> crate::error::Result<T>
where
    F: FnMut() -> crate::error::Result<PollState<T>>,
{
    loop {
        if let PollState::Ready(value) = poll()? {
            return Ok(value);
        }
    }
}
