//! # fibrio
//!
//! A stackful coroutine scheduler fused with an event-driven I/O
//! reactor, a timer manager, and a syscall shim: write ordinary
//! blocking-looking request handlers, and the runtime turns each
//! blocking call into a cooperative suspension that lets other ready
//! work run in the meantime.
//!
//! Five pieces, built leaves-first:
//!
//! - [`coroutine`] — stackful execution context with explicit
//!   `resume`/`yield_to` and a `{Init, Ready, Exec, Hold, Term,
//!   Except}` state machine.
//! - [`scheduler`] — an M:N executor: worker OS threads pull
//!   coroutine/callable tasks off a shared FIFO queue.
//! - [`timer`] — an ordered set of one-shot, periodic, and
//!   conditional deadlines.
//! - [`reactor`] — extends the scheduler with a `mio`-backed readiness
//!   demultiplexer and a per-fd event table.
//! - [`shim`] — turns blocking-looking socket/sleep calls into
//!   register-event-and-yield sequences against the reactor above.
//!
//! `config` and `error` hold the ambient runtime-configuration
//! registry and the crate's two fallible-operation error enums,
//! respectively.

pub mod config;
pub mod coroutine;
pub mod error;
pub mod reactor;
pub mod scheduler;
pub mod shim;
pub mod timer;

#[cfg(test)]
mod proptests;

pub use coroutine::{Coroutine, CoroutineId, CoroutineState};
pub use error::{ReactorError, ShimError};
pub use reactor::{Continuation, Event, IoReactor};
pub use scheduler::{Scheduler, Task};
pub use timer::{TimerHandle, TimerManager};

/// Suspend the current coroutine for `secs` seconds: arms a one-shot timer that
/// re-schedules this coroutine, then yields `HOLD`. Must be called
/// from inside a coroutine running on an [`IoReactor`] worker.
pub fn sleep(secs: u32) -> u32 {
    shim::sleep(secs)
}

/// The coroutine currently executing on this thread, creating this
/// thread's root coroutine on first call.
pub fn current() -> Coroutine {
    Coroutine::current()
}
