//! Error kinds
//!
//! Contract violations are assertion-class (`assert!`/`debug_assert!`,
//! abort with backtrace) and never appear here. These two enums cover
//! the other two kinds: unrecoverable setup failures, and the thin
//! translation layer that keeps shimmed syscalls returning plain
//! `io::Error` at their public boundary.

use thiserror::Error;

/// Failures from `Scheduler`/`IoReactor` construction and startup:
/// the "recovery is impossible" case, where a reactor that cannot
/// create its demultiplexer or self-pipe cannot run, full stop.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("failed to create readiness demultiplexer: {0}")]
    PollCreate(#[source] std::io::Error),

    #[error("failed to create self-pipe: {0}")]
    SelfPipe(#[source] std::io::Error),
}

/// Internal shim failures, always converted to an `io::Error` before
/// reaching the caller of a shimmed syscall.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("reactor event registration failed for fd {0}: {1}")]
    EventRegistration(i32, #[source] std::io::Error),
}

impl From<ShimError> for std::io::Error {
    fn from(e: ShimError) -> Self {
        match &e {
            ShimError::EventRegistration(_, inner) => {
                std::io::Error::new(inner.kind(), e.to_string())
            }
        }
    }
}
