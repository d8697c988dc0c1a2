//! Per-fd event table:
//! `fd -> FdContext`, where each `FdContext` tracks which of
//! {READ, WRITE} are currently registered and their continuations,
//! under its own mutex — never held across a context switch.

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, RwLock};

use mio::Interest;

use crate::coroutine::Coroutine;
use crate::scheduler::Scheduler;

/// One of the two event kinds the reactor tracks per fd.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    pub fn other(self) -> Event {
        match self {
            Event::Read => Event::Write,
            Event::Write => Event::Read,
        }
    }
}

/// What runs when a registered event fires: either the coroutine that
/// registered it (captured implicitly) or an explicit one-shot
/// callback (used by the reactor's own self-pipe and by callers that
/// don't want to suspend the calling coroutine).
pub enum Continuation {
    Coroutine(Coroutine),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl Continuation {
    pub(crate) fn fire(self, scheduler: &Scheduler, affinity: Option<usize>) {
        match self {
            Continuation::Coroutine(co) => scheduler.schedule_coroutine(co, affinity),
            Continuation::Callback(f) => scheduler.schedule(f, affinity),
        }
    }
}

/// Invariant: the continuation slot for an event is
/// non-empty iff its bit is set; both are cleared together under the
/// owning `FdContext`'s lock.
#[derive(Default)]
pub struct FdEventState {
    read: Option<Continuation>,
    write: Option<Continuation>,
}

impl FdEventState {
    pub fn has(&self, event: Event) -> bool {
        match event {
            Event::Read => self.read.is_some(),
            Event::Write => self.write.is_some(),
        }
    }

    pub fn set(&mut self, event: Event, continuation: Continuation) {
        match event {
            Event::Read => self.read = Some(continuation),
            Event::Write => self.write = Some(continuation),
        }
    }

    pub fn clear(&mut self, event: Event) -> Option<Continuation> {
        match event {
            Event::Read => self.read.take(),
            Event::Write => self.write.take(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    /// The `mio::Interest` this fd should currently be registered
    /// with, or `None` if it should be deregistered entirely.
    pub fn interest(&self) -> Option<Interest> {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

pub struct FdContext {
    pub fd: RawFd,
    pub state: Mutex<FdEventState>,
}

/// Per-fd table indexed by fd number: POSIX fds are dense small non-negative integers, so
/// an indexed vector beats a hash map on the I/O hot path. Resized
/// 1.5× on demand under the table's writer lock; lookups take the
/// reader lock.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable {
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let slots = self.slots.read().unwrap();
        slots.get(fd as usize).and_then(|s| s.clone())
    }

    pub fn get_or_create(&self, fd: RawFd) -> Arc<FdContext> {
        if let Some(ctx) = self.get(fd) {
            return ctx;
        }
        let mut slots = self.slots.write().unwrap();
        let idx = fd as usize;
        if idx >= slots.len() {
            let new_len = ((idx + 1) as f64 * 1.5) as usize;
            slots.resize_with(new_len.max(idx + 1), || None);
        }
        slots[idx]
            .get_or_insert_with(|| {
                Arc::new(FdContext {
                    fd,
                    state: Mutex::new(FdEventState::default()),
                })
            })
            .clone()
    }

    pub fn remove(&self, fd: RawFd) {
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }

    pub fn live_fds(&self) -> Vec<RawFd> {
        self.slots.read().unwrap().iter().flatten().map(|c| c.fd).collect()
    }

    pub fn pending_event_count(&self) -> usize {
        self.slots
            .read()
            .unwrap()
            .iter()
            .flatten()
            .map(|c| {
                let s = c.state.lock().unwrap();
                s.has(Event::Read) as usize + s.has(Event::Write) as usize
            })
            .sum()
    }
}
