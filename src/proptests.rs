//! Property tests for the testable invariants of the design, written
//! against the public surface of [`crate::scheduler`], [`crate::timer`],
//! and [`crate::shim`] rather than their internals.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use proptest::collection::vec;
use proptest::prelude::*;

use crate::scheduler::Scheduler;
use crate::shim;
use crate::timer::TimerManager;

proptest! {
    /// Single-worker FIFO: callables scheduled onto a
    /// single worker from outside that worker execute in enqueue order,
    /// for any sequence length.
    #[test]
    fn single_worker_fifo_order(values in vec(any::<u32>(), 0..200)) {
        let sched = Scheduler::new(1, false, "prop-fifo");
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        for v in &values {
            let order = order.clone();
            let v = *v;
            sched.schedule(move || order.lock().unwrap().push(v), Some(0));
        }
        sched.start();
        sched.stop();
        prop_assert_eq!(order.lock().unwrap().clone(), values);
    }

    /// Timer ordering: for any two distinct expiries,
    /// the earlier one's callback is reported by `drain_expired` no
    /// later than the later one's, regardless of submission order.
    #[test]
    fn timer_ordering_by_expiry(a_first in any::<bool>(), delay_a in 1u64..20, delay_b in 21u64..50) {
        let tm = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let submit = |tm: &TimerManager, delay: u64, tag: u32| {
            let order = order.clone();
            tm.add_timer(delay, move || order.lock().unwrap().push(tag), false);
        };
        if a_first {
            submit(&tm, delay_a, 1);
            submit(&tm, delay_b, 2);
        } else {
            submit(&tm, delay_b, 2);
            submit(&tm, delay_a, 1);
        }
        std::thread::sleep(std::time::Duration::from_millis(delay_b + 20));
        for cb in tm.drain_expired() {
            cb();
        }
        prop_assert_eq!(order.lock().unwrap().clone(), vec![1, 2]);
    }

    /// Stop quiescence: every scheduled unit of work
    /// runs exactly once by the time `stop()` returns, for any batch
    /// size and worker count.
    #[test]
    fn stop_is_quiescent_for_any_batch(n in 0u32..300, workers in 1usize..5) {
        let sched = Scheduler::new(workers, false, "prop-quiesce");
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..n {
            let counter = counter.clone();
            sched.schedule(move || { counter.fetch_add(1, Ordering::SeqCst); }, None);
        }
        sched.start();
        sched.stop();
        prop_assert_eq!(counter.load(Ordering::SeqCst), n);
    }

    /// `fcntl` shim round-trip: whatever nonblock bit
    /// the caller last set via `F_SETFL` is exactly what `F_GETFL`
    /// reports back, independent of the forced kernel-level setting.
    #[test]
    fn fcntl_shim_round_trips_user_nonblock(user_wants_nonblock in any::<bool>()) {
        let fd = shim::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let base = shim::fcntl_getfl(fd).unwrap() & !libc::O_NONBLOCK;
        let flags = if user_wants_nonblock { base | libc::O_NONBLOCK } else { base };
        shim::fcntl_setfl(fd, flags).unwrap();
        let observed = shim::fcntl_getfl(fd).unwrap() & libc::O_NONBLOCK != 0;
        unsafe { libc::close(fd); }
        shim::registry_del(fd);
        prop_assert_eq!(observed, user_wants_nonblock);
    }
}
