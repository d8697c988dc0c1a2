//! M:N executor: N worker OS threads pull tasks
//! (coroutines or callables, with optional thread affinity) from a
//! shared FIFO queue, each worker running a dispatch loop on its own
//! dispatch coroutine.
//!
//! Generalizes `mioco`'s `thread::Handler` +
//! `HandlerShared` pull loop: that version dispatched strictly through
//! `mio`'s `Handler::ready`/`tick` callbacks with round-robin migration
//! (`FifoScheduler`); this version is the synchronous pull-loop form
//! the design asks for, with the demultiplexer pluggable via
//! [`IdleStrategy`] so `reactor::IoReactor` can supply an epoll/kqueue-
//! style wait in place of the default condvar park.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{error, info, trace, warn};

use crate::coroutine::{BackEdge, Coroutine, CoroutineState};

/// A scheduler queue entry: either a coroutine handle or a callable,
/// plus an optional target thread id (`None` == any).
pub enum Task {
    Coroutine(Coroutine),
    Callable(Box<dyn FnOnce() + Send + 'static>),
}

impl From<Coroutine> for Task {
    fn from(c: Coroutine) -> Self {
        Task::Coroutine(c)
    }
}

struct QueueEntry {
    task: Task,
    affinity: Option<usize>,
}

/// Pluggable "what to do when there is no runnable task" behavior.
/// The default implementation parks on a condvar; [`crate::reactor::IoReactor`]
/// supplies one that blocks in a readiness demultiplexer instead.
pub trait IdleStrategy: Send + Sync {
    /// Block (or otherwise wait) until there is reason to re-scan the
    /// task queue. Must return promptly after `tickle()` is called.
    fn wait(&self, scheduler: &Scheduler);

    /// Wake at most one blocked waiter.
    fn tickle(&self);
}

/// Default FIFO idle strategy: park the worker on a condvar associated
/// with the scheduler's task queue.
pub(crate) struct CondvarIdle {
    lock: Mutex<()>,
    cv: Condvar,
}

impl CondvarIdle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(CondvarIdle {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        })
    }
}

impl IdleStrategy for CondvarIdle {
    fn wait(&self, scheduler: &Scheduler) {
        let guard = self.lock.lock().unwrap();
        let _ = self
            .cv
            .wait_timeout_while(guard, std::time::Duration::from_millis(50), |_| {
                scheduler.inner.tasks.lock().unwrap().is_empty() && !scheduler.stopping()
            })
            .unwrap();
    }

    fn tickle(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cv.notify_one();
    }
}

pub(crate) struct SchedulerInner {
    pub(crate) name: String,
    tasks: Mutex<VecDeque<QueueEntry>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) active_workers: AtomicUsize,
    pub(crate) idle_workers: AtomicUsize,
    pub(crate) stopping: AtomicBool,
    pub(crate) auto_stop: AtomicBool,
    worker_count: usize,
    include_caller: bool,
    idle: Mutex<Option<Arc<dyn IdleStrategy>>>,
    on_worker_start: Mutex<Option<Arc<dyn Fn(usize) + Send + Sync>>>,
    extra_stopping: Mutex<Option<Arc<dyn Fn() -> bool + Send + Sync>>>,
}

/// M:N coroutine/callable executor. Cheap to clone (shares state).
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<SchedulerInner>,
}

thread_local! {
    static TL_SCHEDULER: std::cell::RefCell<Option<Scheduler>> = std::cell::RefCell::new(None);
    static TL_DISPATCH: std::cell::RefCell<Option<Coroutine>> = std::cell::RefCell::new(None);
    static TL_WORKER_ID: std::cell::Cell<usize> = std::cell::Cell::new(0);
}

impl Scheduler {
    /// `(worker_count, include_caller, name)`. If `include_caller`,
    /// the caller thread becomes worker 0 and `start()` blocks running
    /// that worker's dispatch loop in-place.
    pub fn new(worker_count: usize, include_caller: bool, name: impl Into<String>) -> Scheduler {
        Scheduler::with_idle(worker_count, include_caller, name, CondvarIdle::new())
    }

    /// [`Scheduler::new`] sized to the host's available parallelism,
    /// for callers with no specific worker-count requirement.
    pub fn new_default(include_caller: bool, name: impl Into<String>) -> Scheduler {
        Scheduler::new(num_cpus::get(), include_caller, name)
    }

    pub(crate) fn with_idle(
        worker_count: usize,
        include_caller: bool,
        name: impl Into<String>,
        idle: Arc<dyn IdleStrategy>,
    ) -> Scheduler {
        let worker_count = worker_count.max(1);
        Scheduler {
            inner: Arc::new(SchedulerInner {
                name: name.into(),
                tasks: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                active_workers: AtomicUsize::new(0),
                idle_workers: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                auto_stop: AtomicBool::new(false),
                worker_count,
                include_caller,
                idle: Mutex::new(Some(idle)),
                on_worker_start: Mutex::new(None),
                extra_stopping: Mutex::new(None),
            }),
        }
    }

    /// Conjoin an additional predicate onto `stopping()` — the hook
    /// `IoReactor` uses to add "no pending events and no outstanding
    /// timer" on top of the base queue/worker predicate.
    pub(crate) fn set_extra_stopping_predicate<F>(&self, f: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        *self.inner.extra_stopping.lock().unwrap() = Some(Arc::new(f));
    }

    pub(crate) fn set_idle_strategy(&self, idle: Arc<dyn IdleStrategy>) {
        *self.inner.idle.lock().unwrap() = Some(idle);
    }

    /// Run `f` at the start of every worker's `dispatch_loop`, on that
    /// worker's own OS thread — the hook `IoReactor` uses to populate
    /// its own thread-local `current()` pointer on each worker,
    /// including ones spawned by `start()` rather than the caller.
    pub(crate) fn set_on_worker_start<F>(&self, f: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        *self.inner.on_worker_start.lock().unwrap() = Some(Arc::new(f));
    }

    fn idle_strategy(&self) -> Arc<dyn IdleStrategy> {
        self.inner.idle.lock().unwrap().clone().expect("idle strategy not configured")
    }

    /// The scheduler the calling coroutine/thread belongs to, if any.
    pub fn current() -> Option<Scheduler> {
        TL_SCHEDULER.with(|s| s.borrow().clone())
    }

    /// The calling worker's own dispatch coroutine: the back-edge every
    /// task coroutine resumed on this worker ultimately yields to.
    /// `None` off a worker thread.
    pub fn main_coroutine_of_worker() -> Option<Coroutine> {
        TL_DISPATCH.with(|d| d.borrow().clone())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue a single task. If this transitions the queue from empty
    /// to non-empty, signal one idle worker.
    pub fn schedule_coroutine(&self, co: Coroutine, thread: Option<usize>) {
        self.schedule_entry(QueueEntry {
            task: Task::Coroutine(co),
            affinity: thread,
        });
    }

    /// Enqueue a callable, materialized into a coroutine by whichever
    /// worker picks it up.
    pub fn schedule<F>(&self, f: F, thread: Option<usize>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_entry(QueueEntry {
            task: Task::Callable(Box::new(f)),
            affinity: thread,
        });
    }

    /// Batch form: enqueue a whole range, waking at most once.
    pub fn schedule_batch<I, F>(&self, iter: I)
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        let mut need_tickle = false;
        {
            let mut tasks = self.inner.tasks.lock().unwrap();
            for f in iter {
                need_tickle |= tasks.is_empty();
                tasks.push_back(QueueEntry {
                    task: Task::Callable(Box::new(f)),
                    affinity: None,
                });
            }
        }
        if need_tickle && self.has_idle_workers() {
            self.tickle();
        }
    }

    fn schedule_entry(&self, entry: QueueEntry) {
        if self.stopping() {
            warn!("scheduler({}): schedule() on a stopped scheduler, ignored", self.name());
            return;
        }
        let need_tickle = {
            let mut tasks = self.inner.tasks.lock().unwrap();
            let was_empty = tasks.is_empty();
            tasks.push_back(entry);
            was_empty
        };
        if need_tickle && self.has_idle_workers() {
            self.tickle();
        }
    }

    fn has_idle_workers(&self) -> bool {
        self.inner.idle_workers.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn tickle(&self) {
        self.idle_strategy().tickle();
    }

    fn pop_matching(&self, worker_id: usize) -> Option<QueueEntry> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let pos = tasks
            .iter()
            .position(|e| e.affinity.is_none() || e.affinity == Some(worker_id))?;
        tasks.remove(pos)
    }

    fn queue_has_more(&self) -> bool {
        !self.inner.tasks.lock().unwrap().is_empty()
    }

    /// Base stopping predicate: auto_stop ∧ a stop was
    /// requested ∧ queue empty ∧ no active workers. `IoReactor`
    /// conjoins its own extension on top of this.
    pub fn stopping(&self) -> bool {
        let base = self.inner.stopping.load(Ordering::SeqCst)
            && self.inner.auto_stop.load(Ordering::SeqCst)
            && self.inner.tasks.lock().unwrap().is_empty()
            && self.inner.active_workers.load(Ordering::SeqCst) == 0;
        base && self.inner.extra_stopping.lock().unwrap().as_ref().map_or(true, |f| f())
    }

    /// Spawn worker threads; each runs `dispatch_loop`. Blocks the
    /// calling thread running worker 0's dispatch loop if the
    /// scheduler was built with `include_caller`.
    pub fn start(&self) {
        info!("scheduler({}): starting {} workers", self.name(), self.inner.worker_count);
        self.inner.auto_stop.store(false, Ordering::SeqCst);
        self.inner.stopping.store(false, Ordering::SeqCst);

        let first = if self.inner.include_caller { 1 } else { 0 };
        let mut handles = Vec::new();
        for wid in first..self.inner.worker_count {
            let sched = self.clone();
            let name = format!("{}-worker-{}", self.name(), wid);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || sched.dispatch_loop(wid))
                .expect("spawn worker thread");
            handles.push(handle);
        }
        *self.inner.threads.lock().unwrap() = handles;

        if self.inner.include_caller {
            self.dispatch_loop(0);
        }
    }

    /// Set `auto_stop`, wake every worker until they observe shutdown,
    /// and join all worker threads.
    ///
    /// Calling this from a task running on one of this scheduler's own
    /// workers needs special handling: that worker's `active_workers`
    /// slot stays taken until the call returns (`dispatch_loop` only
    /// decrements it after `co.resume()` comes back), and if the
    /// calling worker is itself one of the spawned threads, joining its
    /// own `JoinHandle` here would be a direct self-join. Either way,
    /// joining synchronously on the calling thread can never return:
    /// the other workers can't reach `stopping() == true` while this
    /// worker (mid-resume) still counts active, and a self-joined
    /// thread can't finish the thread whose join it's blocked in. Hand
    /// the join off to a short-lived controller thread in that case so
    /// this call returns immediately, letting the resume unwind and the
    /// worker's own slot clear normally.
    pub fn stop(&self) {
        self.inner.auto_stop.store(true, Ordering::SeqCst);
        self.inner.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.inner.worker_count {
            self.tickle();
        }
        let handles = std::mem::take(&mut *self.inner.threads.lock().unwrap());
        let called_from_own_worker = Scheduler::current().map_or(false, |s| Arc::ptr_eq(&s.inner, &self.inner));
        if called_from_own_worker {
            let name = self.inner.name.clone();
            std::thread::Builder::new()
                .name(format!("{name}-stopper"))
                .spawn(move || {
                    for h in handles {
                        let _ = h.join();
                    }
                    info!("scheduler({}): stopped", name);
                })
                .expect("spawn stopper thread");
        } else {
            for h in handles {
                let _ = h.join();
            }
            info!("scheduler({}): stopped", self.name());
        }
    }

    fn materialize(&self, task: Task) -> Coroutine {
        match task {
            Task::Coroutine(c) => c,
            Task::Callable(f) => Coroutine::spawn(f, None, BackEdge::Dispatch),
        }
    }

    /// Runs in the worker's dispatch coroutine (here: directly on the
    /// worker's native thread, which plays the role of that thread's
    /// root/dispatch coroutine — see `coroutine::BackEdge`).
    fn dispatch_loop(&self, worker_id: usize) {
        TL_SCHEDULER.with(|s| *s.borrow_mut() = Some(self.clone()));
        TL_WORKER_ID.with(|w| w.set(worker_id));
        if let Some(hook) = self.inner.on_worker_start.lock().unwrap().clone() {
            hook(worker_id);
        }
        let dispatch = Coroutine::current();
        TL_DISPATCH.with(|d| *d.borrow_mut() = Some(dispatch));
        let idle_coro = self.make_idle_coroutine();

        while !self.stopping() {
            if let Some(entry) = self.pop_matching(worker_id) {
                self.inner.active_workers.fetch_add(1, Ordering::SeqCst);
                let affinity = entry.affinity;
                let co = self.materialize(entry.task);
                trace!("scheduler({}): worker {} resuming coroutine {}", self.name(), worker_id, co.id().as_u64());

                let resumed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| co.resume()));
                if let Err(_payload) = resumed {
                    error!("scheduler({}): coroutine {} panicked", self.name(), co.id().as_u64());
                }

                match co.state() {
                    CoroutineState::Ready => self.schedule_entry(QueueEntry {
                        task: Task::Coroutine(co),
                        affinity,
                    }),
                    CoroutineState::Hold => {
                        trace!("scheduler({}): coroutine {} parked on external wake", self.name(), co.id().as_u64());
                    }
                    CoroutineState::Term => {
                        trace!("scheduler({}): coroutine {} finished", self.name(), co.id().as_u64());
                    }
                    CoroutineState::Except => {
                        error!("scheduler({}): coroutine {} ended in EXCEPT", self.name(), co.id().as_u64());
                    }
                    other => unreachable!("dispatch loop observed illegal post-resume state {:?}", other),
                }
                self.inner.active_workers.fetch_sub(1, Ordering::SeqCst);

                if self.queue_has_more() {
                    self.tickle();
                }
            } else if !idle_coro.state().is_reapable() {
                self.inner.idle_workers.fetch_add(1, Ordering::SeqCst);
                idle_coro.resume();
                self.inner.idle_workers.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn make_idle_coroutine(&self) -> Coroutine {
        let sched = self.clone();
        let idle_strategy = self.idle_strategy();
        Coroutine::spawn(
            move || loop {
                if sched.inner.stopping.load(Ordering::SeqCst) {
                    return;
                }
                idle_strategy.wait(&sched);
                Coroutine::yield_to_hold();
            },
            None,
            BackEdge::Dispatch,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn single_worker_fifo_order() {
        let sched = Scheduler::new(1, false, "fifo-test");
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20u32 {
            let order = order.clone();
            sched.schedule(move || order.lock().unwrap().push(i), Some(0));
        }
        sched.start();
        sched.stop();
        let order = order.lock().unwrap().clone();
        assert_eq!(order, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn stop_is_quiescent() {
        let sched = Scheduler::new(2, false, "quiesce-test");
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            sched.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }, None);
        }
        sched.start();
        sched.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        // further scheduling is a documented no-op, not a panic/hang.
        sched.schedule(|| panic!("must not run"), None);
    }
}
