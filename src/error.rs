//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Result<T>`]. Errors are captured at the
//! point they occur (a panicking task body, a failed syscall) and re-raised only when the
//! caller actually observes the result -- via `.await`, [`crate::task::sync_wait`], or awaiting
//! a [`crate::executor::JoinHandle`].

use std::io;

use thiserror::Error;

/// The crate's error type.
#[derive(Debug, Error)]
pub enum Error {
    /// A syscall (socket, file, epoll) failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A task body panicked. The payload is the panic message when it could be downcast to a
    /// string, otherwise a fixed placeholder.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// A [`crate::generator::Generator`] was dereferenced after it finished iterating.
    #[error("generator exhausted")]
    GeneratorExhausted,

    /// `epoll_ctl` failed while registering or modifying interest for a descriptor.
    #[error("reactor registration failed: {0}")]
    ReactorRegistrationFailed(io::Error),

    /// The reactor's event loop has already stopped (a prior fatal `epoll_wait` error).
    #[error("reactor has stopped")]
    ReactorStopped,

    /// The executor has been shut down and is no longer accepting work.
    #[error("executor has shut down")]
    ExecutorShutDown,

    /// A timer id did not refer to a live timer. Returned by internal helpers; the public
    /// `cancel` API treats this as a benign no-op rather than propagating it.
    #[error("timer not found")]
    TimerNotFound,

    /// A `Task` was polled or awaited after being moved from / taken apart. Should be
    /// unreachable through the public API since Rust's move semantics make a used-up `Task`
    /// uninstantiable; kept for internal helpers that reconstruct one from raw parts.
    #[error("observed a null task frame")]
    NullFrame,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Downcasts a `catch_unwind` payload into the message stored by [`Error::Panicked`].
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Error {
    /// True if this is the specific "post-shutdown" condition, distinct from all other errors.
    pub fn is_shut_down(&self) -> bool {
        matches!(self, Error::ExecutorShutDown)
    }
}
