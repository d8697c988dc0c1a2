//! Ordered set of deadline-bearing entries:
//! one-shot, periodic, and conditional (weak-reference-gated) timers.
//!
//! Generalizes `mioco`'s `timer::Timer` (an `EventedShared<TimerCore>`
//! good for exactly one mio-registered deadline) into a standalone,
//! reactor-agnostic manager: a sorted set of `TimerEntry`s keyed by
//! `(expiry, sequence)`, following the same "remove, mutate, reinsert"
//! discipline an ordered set of timer pointers needs to preserve
//! ordering across a mutation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

/// A clock regression larger than this is treated as a wall-clock jump
/// rather than small NTP jitter.
const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

pub const NO_TIMEOUT: u64 = u64::MAX;

type Callback = Arc<dyn Fn() + Send + Sync + 'static>;
type AliveCheck = Box<dyn Fn() -> bool + Send + Sync + 'static>;

struct Entry {
    seq: u64,
    /// Current position in the owning manager's sorted set, if any.
    /// `None` once cancelled or once a one-shot timer has fired.
    key: Mutex<Option<(u64, u64)>>,
    /// The `ms` value the handle was last constructed/reset with —
    /// used as the anchor for `refresh()`/`reset()`, independent of
    /// `period_ms` which reads 0 for one-shot timers
    original_ms: AtomicU64,
    period_ms: AtomicU64,
    recurring: AtomicBool,
    cancelled: AtomicBool,
    consumed: AtomicBool,
    callback: Callback,
    alive: Option<AliveCheck>,
}

impl Entry {
    fn is_alive(&self) -> bool {
        match &self.alive {
            None => true,
            Some(check) => check(),
        }
    }
}

struct Inner {
    timers: RwLock<BTreeMap<(u64, u64), Arc<Entry>>>,
    next_seq: AtomicU64,
    previous_now_ms: AtomicU64,
    on_earliest_changed: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// Deadline-ordered collection of timers. Cheap to clone (shares state).
#[derive(Clone)]
pub struct TimerManager {
    inner: Arc<Inner>,
}

/// Handle returned by `add_timer`/`add_conditional_timer`. Shared
/// between the manager and whichever caller holds it for
/// `cancel`/`refresh`/`reset`.
#[derive(Clone)]
pub struct TimerHandle {
    entry: Arc<Entry>,
    manager: TimerManager,
}

fn now_ms() -> u64 {
    // Wall-clock, deliberately: the rollover heuristic in
    // `drain_expired` is only meaningful against a clock that can
    // actually regress. See DESIGN.md for the monotonic-clock
    // alternative considered and rejected for this reason.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            inner: Arc::new(Inner {
                timers: RwLock::new(BTreeMap::new()),
                next_seq: AtomicU64::new(0),
                previous_now_ms: AtomicU64::new(0),
                on_earliest_changed: Mutex::new(None),
            }),
        }
    }

    /// Hook invoked whenever an insertion makes a new timer the
    /// earliest in the set — the only coupling between `TimerManager`
    /// and `IoReactor`.
    pub fn set_on_earliest_changed<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.on_earliest_changed.lock().unwrap() = Some(Box::new(f));
    }

    fn insert(&self, entry: Arc<Entry>, expiry_ms: u64) {
        let key = (expiry_ms, entry.seq);
        let mut timers = self.inner.timers.write().unwrap();
        let was_earliest_before = timers.keys().next().copied();
        timers.insert(key, entry.clone());
        *entry.key.lock().unwrap() = Some(key);
        let is_earliest_now = timers.keys().next().copied() == Some(key);
        drop(timers);
        if is_earliest_now && was_earliest_before != Some(key) {
            if let Some(cb) = self.inner.on_earliest_changed.lock().unwrap().as_ref() {
                cb();
            }
        }
    }

    fn remove_locked(entry: &Entry, timers: &mut BTreeMap<(u64, u64), Arc<Entry>>) {
        if let Some(key) = entry.key.lock().unwrap().take() {
            timers.remove(&key);
        }
    }

    /// Add a one-shot or periodic timer firing `period_ms` from now.
    pub fn add_timer<F>(&self, period_ms: u64, cb: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_inner(period_ms, Arc::new(cb), recurring, None)
    }

    /// Add a timer that only fires if `weak_guard` can still be
    /// upgraded at the moment of firing; otherwise silently dropped.
    pub fn add_conditional_timer<F, T>(&self, period_ms: u64, cb: F, weak_guard: Weak<T>, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let alive: AliveCheck = Box::new(move || weak_guard.upgrade().is_some());
        self.add_timer_inner(period_ms, Arc::new(cb), recurring, Some(alive))
    }

    fn add_timer_inner(&self, period_ms: u64, cb: Callback, recurring: bool, alive: Option<AliveCheck>) -> TimerHandle {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            seq,
            key: Mutex::new(None),
            original_ms: AtomicU64::new(period_ms),
            period_ms: AtomicU64::new(if recurring { period_ms } else { 0 }),
            recurring: AtomicBool::new(recurring),
            cancelled: AtomicBool::new(false),
            consumed: AtomicBool::new(false),
            callback: cb,
            alive,
        });
        self.insert(entry.clone(), now_ms() + period_ms);
        TimerHandle {
            entry,
            manager: self.clone(),
        }
    }

    /// 0 if any timer has expired; `NO_TIMEOUT` if empty; else ms
    /// until the earliest expiry.
    pub fn next_timeout_ms(&self) -> u64 {
        let timers = self.inner.timers.read().unwrap();
        match timers.keys().next() {
            None => NO_TIMEOUT,
            Some((expiry, _)) => {
                let now = now_ms();
                if *expiry <= now {
                    0
                } else {
                    expiry - now
                }
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.inner.timers.read().unwrap().is_empty()
    }

    /// Pop all entries with expiry ≤ now; reinsert recurring ones with
    /// an advanced expiry. Entries whose conditional guard has expired
    /// are dropped without producing a callback.
    pub fn drain_expired(&self) -> Vec<Callback> {
        let now = now_ms();
        let previous = self.inner.previous_now_ms.swap(now, Ordering::SeqCst);
        let rolled_over = previous > 0 && now + ROLLOVER_THRESHOLD_MS < previous;
        if rolled_over {
            warn!("timer: wall clock regressed by more than {ROLLOVER_THRESHOLD_MS}ms, expiring all outstanding timers");
        }

        let expired: Vec<Arc<Entry>> = {
            let mut timers = self.inner.timers.write().unwrap();
            if rolled_over {
                let all: Vec<_> = timers.values().cloned().collect();
                timers.clear();
                for e in &all {
                    *e.key.lock().unwrap() = None;
                }
                all
            } else {
                let mut out = Vec::new();
                loop {
                    let Some((&key, _)) = timers.iter().next() else { break };
                    if key.0 > now {
                        break;
                    }
                    let (_, entry) = timers.pop_first().unwrap();
                    *entry.key.lock().unwrap() = None;
                    out.push(entry);
                }
                out
            }
        };

        let mut callbacks = Vec::with_capacity(expired.len());
        for entry in expired {
            entry.consumed.store(true, Ordering::SeqCst);
            let fire = !entry.cancelled.load(Ordering::SeqCst) && entry.is_alive();
            if entry.recurring.load(Ordering::SeqCst) && !entry.cancelled.load(Ordering::SeqCst) && entry.is_alive() {
                let period = entry.period_ms.load(Ordering::SeqCst);
                entry.consumed.store(false, Ordering::SeqCst);
                self.insert(entry.clone(), now.saturating_add(period));
            }
            if fire {
                callbacks.push(entry.callback.clone());
            }
        }
        callbacks
    }
}

impl TimerHandle {
    /// O(log n) removal; idempotent.
    pub fn cancel(&self) -> bool {
        if self.entry.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut timers = self.manager.inner.timers.write().unwrap();
        TimerManager::remove_locked(&self.entry, &mut timers);
        true
    }

    /// Recompute expiry = now + period, reinsert. Fails once the
    /// timer has fired and is not recurring, or after `cancel()`.
    pub fn refresh(&self) -> bool {
        if self.entry.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        if self.entry.consumed.load(Ordering::SeqCst) && !self.entry.recurring.load(Ordering::SeqCst) {
            return false;
        }
        let period = self.entry.original_ms.load(Ordering::SeqCst);
        {
            let mut timers = self.manager.inner.timers.write().unwrap();
            TimerManager::remove_locked(&self.entry, &mut timers);
        }
        self.manager.insert(self.entry.clone(), now_ms() + period);
        true
    }

    /// Change period; anchor `from_now` or from (old_expiry − old_period).
    pub fn reset(&self, new_period_ms: u64, from_now: bool) -> bool {
        if self.entry.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        let old_period = self.entry.original_ms.load(Ordering::SeqCst);
        let old_expiry = self.entry.key.lock().unwrap().map(|(e, _)| e);
        let new_expiry = if from_now || old_expiry.is_none() {
            now_ms() + new_period_ms
        } else {
            old_expiry.unwrap().saturating_sub(old_period) + new_period_ms
        };
        self.entry.original_ms.store(new_period_ms, Ordering::SeqCst);
        if self.entry.recurring.load(Ordering::SeqCst) {
            self.entry.period_ms.store(new_period_ms, Ordering::SeqCst);
        }
        {
            let mut timers = self.manager.inner.timers.write().unwrap();
            TimerManager::remove_locked(&self.entry, &mut timers);
        }
        self.manager.insert(self.entry.clone(), new_expiry);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn ordering_earlier_expiry_first() {
        let tm = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        tm.add_timer(30, move || o1.lock().unwrap().push(1), false);
        tm.add_timer(5, move || o2.lock().unwrap().push(2), false);
        sleep(Duration::from_millis(60));
        for cb in tm.drain_expired() {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn cancel_is_idempotent_and_prevents_firing() {
        let tm = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f2 = fired.clone();
        let handle = tm.add_timer(5, move || { f2.fetch_add(1, Ordering::SeqCst); }, false);
        assert!(handle.cancel());
        assert!(!handle.cancel());
        sleep(Duration::from_millis(20));
        let cbs = tm.drain_expired();
        assert!(cbs.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn next_timeout_reports_empty_and_due() {
        let tm = TimerManager::new();
        assert_eq!(tm.next_timeout_ms(), NO_TIMEOUT);
        tm.add_timer(0, || {}, false);
        assert_eq!(tm.next_timeout_ms(), 0);
    }

    #[test]
    fn conditional_timer_dropped_when_guard_gone() {
        let tm = TimerManager::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f2 = fired.clone();
        let guard = Arc::new(());
        let weak = Arc::downgrade(&guard);
        tm.add_conditional_timer(5, move || { f2.fetch_add(1, Ordering::SeqCst); }, weak, false);
        drop(guard);
        sleep(Duration::from_millis(20));
        let cbs = tm.drain_expired();
        assert!(cbs.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recurring_timer_refires_after_drain() {
        let tm = TimerManager::new();
        let count = Arc::new(AtomicU32::new(0));
        let c2 = count.clone();
        tm.add_timer(5, move || { c2.fetch_add(1, Ordering::SeqCst); }, true);
        sleep(Duration::from_millis(20));
        for cb in tm.drain_expired() {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sleep(Duration::from_millis(20));
        for cb in tm.drain_expired() {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
