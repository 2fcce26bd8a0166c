//! Lightweight checkpoint counters.
//!
//! Worker threads bracket regions where their state is consistent with
//! [`Quiesce::checkpoint`] / [`Quiesce::uncheckpoint`]. To take a snapshot
//! the orchestrator zeroes every counter with [`Quiesce::freeze_all`] and
//! waits for [`Quiesce::wait_ready`]; a thread that then tries to leave its
//! region finds its counter reset and parks for the rest of the process.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use nohash_hasher::IntMap;

use crate::lock;

#[derive(Debug, Default)]
struct Counters {
    per_thread: IntMap<u64, u32>,
    ready: u32,
    frozen: bool,
}

#[derive(Debug, Default)]
pub struct Quiesce {
    state: Mutex<Counters>,
    ready_cv: Condvar,
    /// Never notified.
    park_cv: Condvar,
}

impl Quiesce {
    pub fn new() -> Self { Self::default() }

    /// Enter a safe region. Once frozen the thread is counted ready but its
    /// counter stays at zero, so it cannot leave again.
    pub fn checkpoint(&self, handle: u64) {
        let mut st = lock(&self.state);
        let frozen = st.frozen;
        let c = st.per_thread.entry(handle).or_default();
        if !frozen {
            *c += 1;
        }
        st.ready += 1;
        self.ready_cv.notify_all();
    }

    /// Leave a safe region. Does not return once the thread is frozen.
    pub fn uncheckpoint(&self, handle: u64) {
        let mut st = lock(&self.state);
        if st.frozen && st.per_thread.get(&handle).copied().unwrap_or(0) == 0 {
            tracing::debug!(handle, "thread frozen for checkpoint");
            drop(st);
            self.park();
        }
        if let Some(c) = st.per_thread.get_mut(&handle) {
            *c = c.saturating_sub(1);
        }
        st.ready = st.ready.saturating_sub(1);
    }

    /// Reset every thread's counter so none can leave its safe region.
    pub fn freeze_all(&self) {
        let mut st = lock(&self.state);
        st.frozen = true;
        st.per_thread.values_mut().for_each(|c| *c = 0);
    }

    /// Block until `threads` threads sit in a safe region. Returns false if
    /// `timeout` passes first.
    pub fn wait_ready(&self, threads: u32, timeout: Option<Duration>) -> bool {
        let st = lock(&self.state);
        let not_ready = |c: &mut Counters| c.ready < threads;
        match timeout {
            Some(t) => {
                let (st, res) = self.ready_cv
                    .wait_timeout_while(st, t, not_ready)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                !res.timed_out() || st.ready >= threads
            }
            None => {
                let _st = self.ready_cv.wait_while(st, not_ready).unwrap_or_else(std::sync::PoisonError::into_inner);
                true
            }
        }
    }

    /// Block the calling thread for the rest of the process.
    pub fn park(&self) -> ! {
        let mut st = lock(&self.state);
        loop {
            st = self.park_cv.wait(st).unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    pub fn ready(&self) -> u32 { lock(&self.state).ready }

    pub fn is_frozen(&self) -> bool { lock(&self.state).frozen }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn counters_balance_while_not_frozen() {
        let q = Quiesce::new();
        q.checkpoint(1);
        q.checkpoint(2);
        assert_eq!(q.ready(), 2);
        assert!(q.wait_ready(2, Some(Duration::from_millis(10))));
        q.uncheckpoint(1);
        assert_eq!(q.ready(), 1);
        assert!(!q.wait_ready(2, Some(Duration::from_millis(10))));
    }

    #[test]
    fn frozen_thread_never_returns() {
        let q = Arc::new(Quiesce::new());
        let left = Arc::new(AtomicBool::new(false));
        let (q2, left2) = (q.clone(), left.clone());
        std::thread::spawn(move || {
            q2.checkpoint(7);
            while !q2.is_frozen() {
                std::thread::yield_now();
            }
            q2.uncheckpoint(7);
            left2.store(true, Ordering::SeqCst);
        });
        assert!(q.wait_ready(1, Some(Duration::from_secs(5))));
        q.freeze_all();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!left.load(Ordering::SeqCst));
        assert_eq!(q.ready(), 1);
    }
}
