//! Wait primitives: a small typed layer over `std::sync::{Condvar, Mutex}`
//! realizing the scheduler's side of the contract ("Core→scheduler
//! contract"). Every wait atomically releases and reacquires the single
//! kernel lock, exactly as `kernel_wait`/`kernel_timedwait` are specified to.
//!
//! Concurrency: all loops that wait on a [`Cv`] must re-check their own
//! predicate on wake — a broadcast wakes every waiter, and only one of them
//! may find the predicate actually satisfied (4.A).

use std::sync::{Arc, Condvar, MutexGuard};
use std::time::Duration;

/// Scheduling class a waiter is tagged with. Kept for parity with the
/// scheduler's contract (`SCHED_PIPE` vs `SCHED_USER`); this realization
/// does not prioritize between them, since there is exactly one runnable
/// kernel flow at a time regardless (single global lock, no SMP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    Pipe,
    User,
}

/// A condition variable that always waits against the single kernel lock.
///
/// Wrapped in `Arc` so a waiter can clone it out of whatever object it lives
/// on (a `Pipe`, a `Ptcb`, …) *before* moving the lock guard into `wait` —
/// sidesteps the self-borrow that would otherwise result from borrowing the
/// condvar from inside the very guard being consumed.
#[derive(Clone)]
pub struct Cv(Arc<Condvar>);

impl Default for Cv {
    fn default() -> Self {
        Cv::new()
    }
}

impl Cv {
    pub fn new() -> Self {
        Cv(Arc::new(Condvar::new()))
    }

    /// Block the caller on this condvar, releasing `guard` for the duration
    /// and reacquiring it before returning. Does not itself re-check any
    /// predicate — callers loop `while !predicate { guard = cv.wait(guard) }`.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let cv = self.0.clone();
        cv.wait(guard).unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Timed wait against an explicit predicate, realizing `kernel_timedwait`
    /// with `Condvar::wait_timeout_while` so a spurious wakeup re-checks
    /// `still_waiting` instead of being mistaken for a real timeout or
    /// admission — the same spurious/broadcast-wake safety every other CV
    /// loop in this crate gets from its own `while` loop (4.A).
    /// Returns `(guard, false)` if the deadline elapsed while `still_waiting`
    /// kept returning `true`.
    pub fn timedwait_while<'a, T, F>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
        still_waiting: F,
    ) -> (MutexGuard<'a, T>, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        let cv = self.0.clone();
        let (guard, result) = cv
            .wait_timeout_while(guard, timeout, still_waiting)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (guard, !result.timed_out())
    }

    pub fn signal(&self) {
        self.0.notify_one();
    }

    pub fn broadcast(&self) {
        self.0.notify_all();
    }
}

/// Spawn a detached OS thread to back a kernel-level thread. The OS thread
/// is never joined by us — `proc::thread::Ptcb`'s own refcounted exit
/// protocol is the sole source of truth for join/detach semantics, the same
/// way the real scheduler's `spawn_thread`/`wakeup` pair is a primitive the
/// core builds its own join discipline on top of rather than relying on.
pub fn spawn_thread<F>(entry: F)
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .spawn(entry)
        .expect("failed to spawn backing OS thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    #[test]
    fn wait_wakes_on_signal() {
        let mutex = Mutex::new(false);
        let cv = Cv::new();
        let cv2 = cv.clone();
        let done = Arc::new(Mutex::new(false));
        let done2 = done.clone();
        spawn_thread(move || {
            std::thread::sleep(Duration::from_millis(20));
            *done2.lock().unwrap() = true;
            cv2.signal();
        });
        let mut guard = mutex.lock().unwrap();
        while !*done.lock().unwrap() {
            guard = cv.wait(guard);
        }
        assert!(*done.lock().unwrap());
    }

    #[test]
    fn timedwait_while_reports_timeout() {
        let mutex = Mutex::new(());
        let cv = Cv::new();
        let guard = mutex.lock().unwrap();
        let start = Instant::now();
        let (_guard, not_timed_out) = cv.timedwait_while(guard, Duration::from_millis(30), |_| true);
        assert!(!not_timed_out);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn timedwait_while_stops_once_predicate_clears() {
        let mutex = Mutex::new(false);
        let cv = Cv::new();
        let cv2 = cv.clone();
        spawn_thread(move || {
            std::thread::sleep(Duration::from_millis(10));
            cv2.signal();
        });
        let guard = mutex.lock().unwrap();
        let start = Instant::now();
        let (_guard, not_timed_out) = cv.timedwait_while(guard, Duration::from_secs(5), |_| {
            start.elapsed() < Duration::from_millis(10)
        });
        assert!(not_timed_out);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
