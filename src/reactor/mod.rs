//! Readiness-based I/O reactor: extends the
//! scheduler with a `mio::Poll` demultiplexer, a per-fd event table,
//! and a self-pipe wakeup, and folds `TimerManager` in so the idle
//! loop blocks on `min(next_timeout, poll_cap)`.
//!
//! Rust has no implementation inheritance, so rather than a reactor
//! class deriving from both a scheduler and a timer manager,
//! `IoReactor` *owns* a [`Scheduler`] and a [`TimerManager`] and
//! installs itself as the scheduler's [`IdleStrategy`] — composition
//! standing in for base-class inheritance.

mod fd_table;

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, trace, warn};
use mio::unix::{pipe, SourceFd};
use mio::{Events, Interest, Poll, Registry, Token};

use crate::coroutine::Coroutine;
use crate::error::ReactorError;
use crate::scheduler::{IdleStrategy, Scheduler};
use crate::timer::TimerManager;

pub use fd_table::{Continuation, Event};
use fd_table::FdTable;

/// Upper bound on how long a single poll blocks even with no timers
/// pending, so `stopping()` is re-checked periodically (wider than a
/// condvar-based idle wait's typical wakeup period, since a real
/// demultiplexer wakes promptly on `tickle()` anyway).
const POLL_CAP_MS: u64 = 10_000;

const TICKLE_TOKEN: Token = Token(usize::MAX);

struct ReactorInner {
    /// Only ever locked around the blocking `poll()` call itself;
    /// (re)registration goes through `registry` below instead, so a
    /// worker registering a new fd never waits on a worker already
    /// blocked in `epoll_wait`.
    poll: Mutex<Poll>,
    registry: Registry,
    fds: FdTable,
    timers: TimerManager,
    tickle_reader: Mutex<pipe::Receiver>,
    tickle_writer: Mutex<pipe::Sender>,
}

/// `Scheduler` + `TimerManager` + readiness demultiplexer, fused into
/// one handle. Cheap to clone (shares state).
#[derive(Clone)]
pub struct IoReactor {
    scheduler: Scheduler,
    inner: Arc<ReactorInner>,
}

thread_local! {
    static TL_REACTOR: std::cell::RefCell<Option<IoReactor>> = std::cell::RefCell::new(None);
}

impl IoReactor {
    /// `(worker_count, include_caller, name)`, same shape as
    /// `Scheduler::new`.
    pub fn new(worker_count: usize, include_caller: bool, name: impl Into<String>) -> Result<IoReactor, ReactorError> {
        let poll = Poll::new().map_err(ReactorError::PollCreate)?;
        let registry = poll.registry().try_clone().map_err(ReactorError::PollCreate)?;
        let (mut tx, mut rx) = pipe::new().map_err(ReactorError::SelfPipe)?;
        registry
            .register(&mut rx, TICKLE_TOKEN, Interest::READABLE)
            .map_err(ReactorError::SelfPipe)?;
        // first write is purely to validate the pipe is writable; mio's
        // pipe::Sender requires no priming, but probing here surfaces a
        // misconfigured fd limit immediately instead of at the first
        // real tickle().
        let _ = tx.flush();

        let inner = Arc::new(ReactorInner {
            poll: Mutex::new(poll),
            registry,
            fds: FdTable::new(),
            timers: TimerManager::new(),
            tickle_reader: Mutex::new(rx),
            tickle_writer: Mutex::new(tx),
        });

        let scheduler = Scheduler::new(worker_count, include_caller, name);
        let reactor = IoReactor { scheduler, inner };
        reactor.scheduler.set_idle_strategy(Arc::new(reactor.clone()));

        let tickled = reactor.clone();
        reactor.inner.timers.set_on_earliest_changed(move || tickled.tickle());

        // Every worker dispatch_loop runs on its own OS thread,
        // including ones `start()` spawns itself; each needs this
        // reactor in its thread-local `current()` slot, not just the
        // thread that happened to call `start()`.
        let for_hook = reactor.clone();
        reactor.scheduler.set_on_worker_start(move |_worker_id| {
            TL_REACTOR.with(|r| *r.borrow_mut() = Some(for_hook.clone()));
        });

        let for_predicate = reactor.clone();
        reactor.scheduler.set_extra_stopping_predicate(move || {
            for_predicate.inner.fds.pending_event_count() == 0 && for_predicate.inner.timers.next_timeout_ms() == crate::timer::NO_TIMEOUT
        });

        Ok(reactor)
    }

    /// [`IoReactor::new`] sized to the host's available parallelism,
    /// for callers with no specific worker-count requirement.
    pub fn new_default(include_caller: bool, name: impl Into<String>) -> Result<IoReactor, ReactorError> {
        IoReactor::new(num_cpus::get(), include_caller, name)
    }

    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    /// The reactor the calling worker belongs to, if any.
    pub fn current() -> Option<IoReactor> {
        TL_REACTOR.with(|r| r.borrow().clone())
    }

    pub fn schedule<F>(&self, f: F, thread: Option<usize>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule(f, thread);
    }

    pub fn schedule_coroutine(&self, co: Coroutine, thread: Option<usize>) {
        self.scheduler.schedule_coroutine(co, thread);
    }

    pub fn add_timer<F>(&self, period_ms: u64, cb: F, recurring: bool) -> crate::timer::TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.timers.add_timer(period_ms, cb, recurring)
    }

    pub fn add_conditional_timer<F, T>(&self, period_ms: u64, cb: F, guard: std::sync::Weak<T>, recurring: bool) -> crate::timer::TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.inner.timers.add_conditional_timer(period_ms, cb, guard, recurring)
    }

    /// Register `event` on `fd`. If `cb` is absent, the calling
    /// coroutine (which must be EXEC) is captured as the continuation.
    /// Registering an event already present for `fd` is a contract
    /// violation.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<Continuation>) -> io::Result<()> {
        let continuation = cb.unwrap_or_else(|| Continuation::Coroutine(Coroutine::current_running()));
        let ctx = self.inner.fds.get_or_create(fd);
        let (interest, had_other) = {
            let mut state = ctx.state.lock().unwrap();
            assert!(!state.has(event), "add_event: fd {fd} event {event:?} already registered");
            state.set(event, continuation);
            let interest = state.interest().expect("add_event: state just gained an event, interest() must be Some");
            (interest, state.has(event.other()))
        };
        let token = Token(fd as usize);
        if had_other {
            self.inner.registry.reregister(&mut SourceFd(&fd), token, interest)
        } else {
            self.inner.registry.register(&mut SourceFd(&fd), token, interest)
        }
    }

    /// Remove `event`'s registration without firing its continuation.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.inner.fds.get(fd) else { return false };
        let (removed, interest, empty) = {
            let mut state = ctx.state.lock().unwrap();
            let removed = state.clear(event).is_some();
            (removed, state.interest(), state.is_empty())
        };
        if removed {
            self.reprogram(fd, interest, empty);
        }
        removed
    }

    /// Remove `event`'s registration and fire its continuation exactly
    /// once.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.inner.fds.get(fd) else { return false };
        let (continuation, interest, empty) = {
            let mut state = ctx.state.lock().unwrap();
            let continuation = state.clear(event);
            (continuation, state.interest(), state.is_empty())
        };
        match continuation {
            Some(c) => {
                self.reprogram(fd, interest, empty);
                c.fire(&self.scheduler, None);
                true
            }
            None => false,
        }
    }

    /// Cancel both READ and WRITE on `fd`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let a = self.cancel_event(fd, Event::Read);
        let b = self.cancel_event(fd, Event::Write);
        a || b
    }

    fn reprogram(&self, fd: RawFd, interest: Option<Interest>, empty: bool) {
        let token = Token(fd as usize);
        let result = match interest {
            Some(i) => self.inner.registry.reregister(&mut SourceFd(&fd), token, i),
            None => self.inner.registry.deregister(&mut SourceFd(&fd)),
        };
        if let Err(e) = result {
            warn!("reactor({}): failed to reprogram fd {}: {}", self.name(), fd, e);
        }
        if empty {
            self.inner.fds.remove(fd);
        }
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    pub fn stop(&self) {
        // Wake every coroutine still parked on a continuation before
        // joining worker threads. Doing this *before* `scheduler.stop()`
        // matters: the extra stopping predicate this reactor installed
        // won't go true while any fd event is still outstanding, so
        // joining first would deadlock against a coroutine this very
        // call needs to unblock.
        for fd in self.inner.fds.live_fds() {
            self.cancel_all(fd);
        }
        self.scheduler.stop();
    }

    fn drain_tickle_pipe(&self) {
        let mut rx = self.inner.tickle_reader.lock().unwrap();
        let mut buf = [0u8; 64];
        loop {
            match rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("reactor({}): tickle pipe read error: {}", self.name(), e);
                    break;
                }
            }
        }
    }

    fn poll_once(&self, timeout: Option<Duration>) {
        let mut events = Events::with_capacity(256);
        {
            let mut poll = self.inner.poll.lock().unwrap();
            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!("reactor({}): poll failed: {}", self.name(), e);
                }
                return;
            }
        }

        for cb in self.inner.timers.drain_expired() {
            self.scheduler.schedule(move || cb(), None);
        }

        for ev in events.iter() {
            if ev.token() == TICKLE_TOKEN {
                self.drain_tickle_pipe();
                continue;
            }
            let fd = ev.token().0 as RawFd;
            let Some(ctx) = self.inner.fds.get(fd) else { continue };

            // error/hangup conditions surface as both READ and WRITE,
            // so a continuation waiting on either side gets woken.
            let readable = ev.is_readable() || ev.is_error() || ev.is_read_closed();
            let writable = ev.is_writable() || ev.is_error() || ev.is_write_closed();

            let (read_cont, write_cont, interest, empty) = {
                let mut state = ctx.state.lock().unwrap();
                let read_cont = if readable { state.clear(Event::Read) } else { None };
                let write_cont = if writable { state.clear(Event::Write) } else { None };
                (read_cont, write_cont, state.interest(), state.is_empty())
            };
            if read_cont.is_some() || write_cont.is_some() {
                self.reprogram(fd, interest, empty);
            }
            if let Some(c) = read_cont {
                trace!("reactor({}): firing read continuation for fd {}", self.name(), fd);
                c.fire(&self.scheduler, None);
            }
            if let Some(c) = write_cont {
                trace!("reactor({}): firing write continuation for fd {}", self.name(), fd);
                c.fire(&self.scheduler, None);
            }
        }
    }

    /// Base stopping predicate conjoined with "no pending events and
    /// no outstanding timer" — wired into `Scheduler::stopping()` itself via
    /// `set_extra_stopping_predicate` at construction time, so this is
    /// just a convenience accessor equivalent to it.
    pub fn stopping(&self) -> bool {
        self.scheduler.stopping()
    }
}

impl IdleStrategy for IoReactor {
    fn wait(&self, _scheduler: &Scheduler) {
        let timeout_ms = self.inner.timers.next_timeout_ms().min(POLL_CAP_MS);
        let timeout = if timeout_ms == crate::timer::NO_TIMEOUT {
            Some(Duration::from_millis(POLL_CAP_MS))
        } else {
            Some(Duration::from_millis(timeout_ms))
        };
        self.poll_once(timeout);
    }

    fn tickle(&self) {
        let mut tx = self.inner.tickle_writer.lock().unwrap();
        match tx.write(&[1u8]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // pipe already has a pending byte; a wakeup is already
                // in flight, nothing more to do.
            }
            Err(e) => warn!("reactor: tickle write failed: {}", e),
        }
    }
}

impl AsRawFd for IoReactor {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.tickle_writer.lock().unwrap().as_raw_fd()
    }
}
