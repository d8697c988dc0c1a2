//! Stackful coroutine primitive: a private stack plus an explicitly
//! swapped machine context.
//!
//! A `resume`/`yield_to` pair swaps the machine context in and out,
//! built on the `context` crate's `ucontext`-style stack switching.

use std::any::Any;
use std::cell::{RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use context::stack::ProtectedFixedSizeStack;
use context::{Context as RawContext, Transfer};

use crate::config;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonically assigned coroutine id.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CoroutineId(u64);

impl CoroutineId {
    fn next() -> Self {
        CoroutineId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, useful for logging.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// The lifecycle states a coroutine moves through: `Init`, `Ready`,
/// `Exec`, `Hold`, `Term`, `Except`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CoroutineState {
    Init,
    Ready,
    Exec,
    Hold,
    Term,
    Except,
}

impl CoroutineState {
    /// Runnable iff state ∈ {INIT, READY, HOLD}.
    pub fn is_runnable(self) -> bool {
        matches!(
            self,
            CoroutineState::Init | CoroutineState::Ready | CoroutineState::Hold
        )
    }

    /// Reapable iff state ∈ {TERM, EXCEPT}.
    pub fn is_reapable(self) -> bool {
        matches!(self, CoroutineState::Term | CoroutineState::Except)
    }

    pub fn is_exec(self) -> bool {
        matches!(self, CoroutineState::Exec)
    }
}

/// Which back-edge a spawned coroutine's terminal yield eventually
/// lands on. Kept as metadata / for assertions: in practice every yield
/// (explicit or terminal) swaps back to whichever context most recently
/// resumed this one, which for a worker-thread coroutine is always the
/// worker's dispatch coroutine, and for a caller-participating thread
/// is always that thread's root coroutine acting as its own dispatcher.
/// The two deployment shapes fall out of *who calls resume()*, so no
/// separate switch is needed at yield time — see DESIGN.md.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BackEdge {
    Dispatch,
    Root,
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    state: CoroutineState,
    back_edge: BackEdge,
    stack: Option<ProtectedFixedSizeStack>,
    /// Context representing "jump in here to resume this coroutine".
    /// `None` exactly while the coroutine is EXEC (its context has been
    /// consumed by the in-flight `resume()`).
    ctx: Option<RawContext>,
    entry: Option<Entry>,
    panic_payload: Option<Box<dyn Any + Send + 'static>>,
}

struct Shared {
    id: CoroutineId,
    inner: UnsafeCell<Inner>,
}

// Safety: a Coroutine is only ever touched from one OS thread at a time
// (guaranteed by the scheduler: a coroutine is EXEC on at most one
// worker, and migration hands it off before the new owner touches it).
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Shared handle to a coroutine. Cheap to clone; clones refer to the
/// same underlying stack and state.
#[derive(Clone)]
pub struct Coroutine(Arc<Shared>);

impl Coroutine {
    fn from_inner(back_edge: BackEdge, stack: Option<ProtectedFixedSizeStack>, entry: Option<Entry>, state: CoroutineState) -> Self {
        Coroutine(Arc::new(Shared {
            id: CoroutineId::next(),
            inner: UnsafeCell::new(Inner {
                state,
                back_edge,
                stack,
                ctx: None,
                entry,
                panic_payload: None,
            }),
        }))
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn inner(&self) -> &mut Inner {
        &mut *self.0.inner.get()
    }

    pub fn id(&self) -> CoroutineId {
        self.0.id
    }

    pub fn state(&self) -> CoroutineState {
        unsafe { self.inner().state }
    }

    fn set_state(&self, s: CoroutineState) {
        unsafe { self.inner().state = s };
    }

    /// Returns (creating on first call) the calling thread's root
    /// coroutine: a coroutine with no owned stack, wrapping the native
    /// OS stack the thread is already running on.
    pub fn current() -> Coroutine {
        TL_ROOT.with(|root| {
            let mut root = root.borrow_mut();
            if root.is_none() {
                let co = Coroutine::from_inner(BackEdge::Root, None, None, CoroutineState::Exec);
                TL_CURRENT.with(|c| *c.borrow_mut() = Some(co.clone()));
                *root = Some(co);
            }
            root.clone().unwrap()
        })
    }

    /// Allocate a stack and build a machine context that, on first
    /// resume, enters a trampoline calling `entry`.
    pub fn spawn<F>(entry: F, stack_bytes: Option<usize>, back_edge: BackEdge) -> Coroutine
    where
        F: FnOnce() + Send + 'static,
    {
        let size = stack_bytes.unwrap_or_else(config::stack_size);
        let stack = ProtectedFixedSizeStack::new(size).expect("allocate coroutine stack");
        let co = Coroutine::from_inner(back_edge, Some(stack), Some(Box::new(entry)), CoroutineState::Init);
        let ctx = {
            let inner = unsafe { co.inner() };
            let stack_ref = inner.stack.as_ref().unwrap();
            unsafe { RawContext::new(stack_ref, trampoline) }
        };
        unsafe { co.inner().ctx = Some(ctx) };
        co
    }

    /// Precondition: state ∈ {INIT, TERM, EXCEPT}. Reuses the owned
    /// stack and rebuilds the machine context; never mutates a running
    /// coroutine.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = unsafe { self.inner() };
        assert!(
            matches!(
                inner.state,
                CoroutineState::Init | CoroutineState::Term | CoroutineState::Except
            ),
            "reset() on a coroutine that is not INIT/TERM/EXCEPT"
        );
        inner.entry = Some(Box::new(entry));
        inner.panic_payload = None;
        let stack_ref = inner.stack.as_ref().expect("reset: coroutine has no owned stack");
        inner.ctx = Some(unsafe { RawContext::new(stack_ref, trampoline) });
        inner.state = CoroutineState::Init;
    }

    /// Precondition: state ≠ EXEC. Sets state = EXEC, swaps the machine
    /// context of the currently-running coroutine into `self`.
    pub fn resume(&self) {
        assert!(!self.state().is_exec(), "resume() on an already-EXEC coroutine");
        debug_assert!(
            !matches!(unsafe { self.inner().back_edge }, BackEdge::Root),
            "resume(): a Root coroutine is a thread's own native stack and is never explicitly resumed"
        );
        let prev = TL_CURRENT.with(|c| c.borrow_mut().replace(self.clone()));
        self.set_state(CoroutineState::Exec);

        let ctx = unsafe { self.inner().ctx.take() }.expect("resume(): coroutine has no context");
        let data = self as *const Coroutine as usize;
        let Transfer { context, data: out } = unsafe { ctx.resume(data) };
        unsafe { self.inner().ctx = Some(context) };

        if out == PANIC_MARKER {
            let payload = unsafe { self.inner().panic_payload.take() };
            TL_CURRENT.with(|c| *c.borrow_mut() = prev.clone());
            if let Some(p) = payload {
                panic::resume_unwind(p);
            }
        }
        TL_CURRENT.with(|c| *c.borrow_mut() = prev);
    }

    /// Swap from `self` to the back-edge context (whoever most recently
    /// resumed this coroutine), leaving state = `to`.
    pub fn yield_to(to: CoroutineState) {
        assert!(
            matches!(to, CoroutineState::Ready | CoroutineState::Hold),
            "yield_to: state must be READY or HOLD"
        );
        let current = Coroutine::current_running();
        current.set_state(to);
        let back = TL_BACK.with(|b| b.borrow_mut().take()).expect("yield_to: no back-edge context");
        let Transfer { context, .. } = unsafe { back.resume(0) };
        TL_BACK.with(|b| *b.borrow_mut() = Some(context));
        debug_assert!(Coroutine::current_running().state().is_exec());
    }

    /// `yield_to(CoroutineState::Ready)`: suspend because there is more
    /// work to do, re-enqueued for another turn right away.
    pub fn yield_to_ready() {
        Coroutine::yield_to(CoroutineState::Ready);
    }

    /// `yield_to(CoroutineState::Hold)`: suspend because this coroutine
    /// is now parked awaiting an external wake (a timer, an fd becoming
    /// ready, ...).
    pub fn yield_to_hold() {
        Coroutine::yield_to(CoroutineState::Hold);
    }

    /// The coroutine currently EXEC on this thread.
    pub fn current_running() -> Coroutine {
        TL_CURRENT
            .with(|c| c.borrow().clone())
            .expect("current_running() called outside any coroutine")
    }
}

impl PartialEq for Coroutine {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Coroutine {}

const PANIC_MARKER: usize = 1;

extern "C" fn trampoline(t: Transfer) -> ! {
    TL_BACK.with(|b| *b.borrow_mut() = Some(t.context));
    let co = unsafe { &*(t.data as *const Coroutine) }.clone();

    let entry = unsafe { co.inner().entry.take() }.expect("trampoline: coroutine has no entry");
    let result = panic::catch_unwind(AssertUnwindSafe(entry));

    let mut out_data = 0usize;
    match result {
        Ok(()) => co.set_state(CoroutineState::Term),
        Err(payload) => {
            unsafe { co.inner().panic_payload = Some(payload) };
            co.set_state(CoroutineState::Except);
            out_data = PANIC_MARKER;
        }
    }

    loop {
        let back = TL_BACK.with(|b| b.borrow_mut().take()).expect("trampoline: no back-edge context");
        let Transfer { context, .. } = unsafe { back.resume(out_data) };
        // A TERM/EXCEPT coroutine must never be resumed again; if we
        // get back here it is a contract violation by the scheduler.
        TL_BACK.with(|b| *b.borrow_mut() = Some(context));
        unreachable!("trampoline resumed after TERM/EXCEPT");
    }
}

thread_local! {
    static TL_ROOT: RefCell<Option<Coroutine>> = RefCell::new(None);
    static TL_CURRENT: RefCell<Option<Coroutine>> = RefCell::new(None);
    /// Context to jump back to from the coroutine currently EXEC on
    /// this thread. Updated on every resume/yield round trip.
    static TL_BACK: RefCell<Option<RawContext>> = RefCell::new(None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn state_machine_happy_path() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let co = Coroutine::spawn(
            move || {
                log2.lock().unwrap().push("a");
                Coroutine::yield_to(CoroutineState::Ready);
                log2.lock().unwrap().push("b");
            },
            Some(64 * 1024),
            BackEdge::Dispatch,
        );
        assert_eq!(co.state(), CoroutineState::Init);
        co.resume();
        assert_eq!(co.state(), CoroutineState::Ready);
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
        co.resume();
        assert_eq!(co.state(), CoroutineState::Term);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn panic_transitions_to_except() {
        let co = Coroutine::spawn(
            || panic!("boom"),
            Some(64 * 1024),
            BackEdge::Dispatch,
        );
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| co.resume()));
        assert!(result.is_err());
        assert_eq!(co.state(), CoroutineState::Except);
    }

    #[test]
    fn reset_reuses_stack_after_term() {
        let co = Coroutine::spawn(|| {}, Some(64 * 1024), BackEdge::Dispatch);
        co.resume();
        assert_eq!(co.state(), CoroutineState::Term);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        co.reset(move || ran2.store(true, Ordering::SeqCst));
        assert_eq!(co.state(), CoroutineState::Init);
        co.resume();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(co.state(), CoroutineState::Term);
    }
}
