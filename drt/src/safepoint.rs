//! Safepoints and thread suspension.
//!
//! A coordinator calls [Safepoints::begin], which raises the global request flag and waits until
//! every registered thread is in a safe state. Threads running managed code notice the request at
//! their next poll and block in [Safepoints::block] until the coordinator drops its
//! [SafepointGuard]. Suspension works the same way for a single thread.

use crate::thread::{ThreadShared, ThreadState};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

pub struct Safepoints {
    requested: AtomicBool,
    /// Held by the coordinator for the duration of a safepoint.
    coordinator: Mutex<()>,
    wait_lock: Mutex<()>,
    cv: Condvar,
    threads: Mutex<Vec<Arc<ThreadShared>>>,
}

/// A safepoint in progress: every registered thread is stopped until this is dropped.
pub struct SafepointGuard<'a> {
    sp: &'a Safepoints,
    _coordinator: parking_lot::MutexGuard<'a, ()>,
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        self.sp.requested.store(false, Ordering::SeqCst);
        let _lk = self.sp.wait_lock.lock();
        self.sp.cv.notify_all();
    }
}

impl Safepoints {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            coordinator: Mutex::new(()),
            wait_lock: Mutex::new(()),
            cv: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, t: Arc<ThreadShared>) {
        self.threads.lock().push(t);
    }

    pub fn unregister(&self, id: u64) {
        self.threads.lock().retain(|t| t.id != id);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Must `t` take the slow path at a poll?
    pub fn poll(&self, t: &ThreadShared) -> bool {
        self.is_requested() || t.is_suspend_requested()
    }

    /// Stop every registered thread.
    pub fn begin(&self) -> SafepointGuard<'_> {
        let g = self.coordinator.lock();
        self.requested.store(true, Ordering::SeqCst);
        loop {
            let all_safe = self.threads.lock().iter().all(|t| t.state().is_safe());
            if all_safe {
                break;
            }
            thread::yield_now();
        }
        SafepointGuard {
            sp: self,
            _coordinator: g,
        }
    }

    /// Block `t` while a safepoint or a suspension of `t` is in effect. The thread is `Blocked`
    /// while it waits and returns to `state` afterwards.
    pub fn block(&self, t: &ThreadShared, state: ThreadState) {
        let mut lk = self.wait_lock.lock();
        t.set_state(ThreadState::Blocked);
        while self.poll(t) {
            self.cv.wait(&mut lk);
        }
        t.set_state(state);
    }

    pub fn suspend(&self, t: &ThreadShared) {
        t.set_suspend_requested(true);
    }

    pub fn resume(&self, t: &ThreadShared) {
        let _lk = self.wait_lock.lock();
        t.set_suspend_requested(false);
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::TestRuntime;
    use std::time::Duration;

    #[test]
    fn stop_and_release() {
        let t = TestRuntime::new();
        let th = t.thread();
        let shared = Arc::clone(&th.shared);
        shared.set_state(ThreadState::InJava);
        let rt = Arc::clone(&t.rt);
        let s2 = Arc::clone(&shared);
        let h = thread::spawn(move || {
            // A thread in managed code polls until it sees the request.
            while !rt.safepoints.poll(&s2) {
                thread::yield_now();
            }
            rt.safepoints.block(&s2, ThreadState::InJava);
        });
        {
            let _g = t.rt.safepoints.begin();
            assert_eq!(shared.state(), ThreadState::Blocked);
        }
        h.join().unwrap();
        assert_eq!(shared.state(), ThreadState::InJava);
        assert!(!t.rt.safepoints.is_requested());
    }

    #[test]
    fn suspend_resume() {
        let t = TestRuntime::new();
        let th = t.thread();
        let shared = Arc::clone(&th.shared);
        t.rt.safepoints.suspend(&shared);
        assert!(t.rt.safepoints.poll(&shared));
        let rt = Arc::clone(&t.rt);
        let s2 = Arc::clone(&shared);
        let h = thread::spawn(move || rt.safepoints.block(&s2, ThreadState::InVm));
        while shared.state() != ThreadState::Blocked {
            thread::sleep(Duration::from_millis(1));
        }
        t.rt.safepoints.resume(&shared);
        h.join().unwrap();
        assert_eq!(shared.state(), ThreadState::InVm);
    }
}
