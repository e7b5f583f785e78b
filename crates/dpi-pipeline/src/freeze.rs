//! Freeze/unfreeze quiescence
//!
//! Stages share a handle to the pipeline's control atomics and a
//! [`FreezeGate`]. Raising the freeze flag makes the emitter stop pulling
//! input; downstream stages drain to empty and park, strictly in rank
//! order (emitter before workers before collector), so no queue can
//! receive a task after its consumer parked. With every stage parked the
//! supervisor may mutate worker count, flow partitioning and frequency,
//! then resume symmetrically.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Control flags shared by every stage of one pipeline
///
/// The pipeline is the longest-lived owner; stages hold `Arc` clones.
#[derive(Debug)]
pub(crate) struct SharedFlags {
    /// Quiescence request, single-writer (the thread holding the state lock)
    pub freeze: AtomicBool,
    /// End-of-stream observed, pipeline is draining for good
    pub terminating: AtomicBool,
    /// `run` has been called and `wait_end` has not finished
    pub running: AtomicBool,
    /// Current L7 worker count; read by the dispatcher on every packet
    pub active_workers: AtomicUsize,
    /// Physical core the final collector should sit on
    pub collector_core: AtomicUsize,
}

impl SharedFlags {
    pub fn new(active_workers: usize, collector_core: usize) -> Arc<Self> {
        Arc::new(Self {
            freeze: AtomicBool::new(true),
            terminating: AtomicBool::new(false),
            running: AtomicBool::new(false),
            active_workers: AtomicUsize::new(active_workers),
            collector_core: AtomicUsize::new(collector_core),
        })
    }

    #[inline]
    pub fn frozen(&self) -> bool {
        self.freeze.load(Ordering::Acquire)
    }

    #[inline]
    pub fn terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    #[inline]
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct GateState {
    parked: Vec<usize>,
    done: Vec<usize>,
}

/// Rank-ordered quiescence barrier
///
/// Each stage is registered under a rank (emitter 0, workers 1, collector
/// 2; six ranks for the double farm). A stage may park only once every
/// stage of a lower rank is parked or done and its own input is empty,
/// which makes the drained-queue check stable.
#[derive(Debug)]
pub(crate) struct FreezeGate {
    expected: Vec<usize>,
    state: Mutex<GateState>,
    stage_cv: Condvar,
    resume_cv: Condvar,
}

impl FreezeGate {
    /// Gate for `expected[rank]` stages per rank
    pub fn new(expected: Vec<usize>) -> Arc<Self> {
        let n = expected.len();
        Arc::new(Self {
            expected,
            state: Mutex::new(GateState {
                parked: vec![0; n],
                done: vec![0; n],
            }),
            stage_cv: Condvar::new(),
            resume_cv: Condvar::new(),
        })
    }

    /// Park the calling stage while `hold` is true and the pipeline is not
    /// terminating. Returns once resumed.
    pub fn park(&self, rank: usize, flags: &SharedFlags, hold: impl Fn() -> bool) {
        let mut state = self.state.lock();
        state.parked[rank] += 1;
        self.stage_cv.notify_all();
        while hold() && !flags.terminating() {
            self.resume_cv.wait(&mut state);
        }
        state.parked[rank] -= 1;
    }

    /// True when every stage of rank < `rank` is parked or done
    pub fn quiet_below(&self, rank: usize) -> bool {
        let state = self.state.lock();
        (0..rank).all(|r| state.parked[r] + state.done[r] >= self.expected[r])
    }

    /// True when every stage of rank < `rank` has exited
    pub fn done_below(&self, rank: usize) -> bool {
        let state = self.state.lock();
        (0..rank).all(|r| state.done[r] >= self.expected[r])
    }

    /// Record that a stage of `rank` exited its loop for good
    pub fn mark_done(&self, rank: usize) {
        let mut state = self.state.lock();
        state.done[rank] += 1;
        self.stage_cv.notify_all();
        // Downstream stages poll their exit condition; parked ones need a kick.
        self.resume_cv.notify_all();
    }

    /// Block until every registered stage is parked or done
    pub fn wait_all_quiet(&self) {
        let mut state = self.state.lock();
        while !(0..self.expected.len())
            .all(|r| state.parked[r] + state.done[r] >= self.expected[r])
        {
            self.stage_cv.wait(&mut state);
        }
    }

    /// Block until every registered stage has exited
    pub fn wait_all_done(&self) {
        let mut state = self.state.lock();
        while !(0..self.expected.len()).all(|r| state.done[r] >= self.expected[r]) {
            self.stage_cv.wait(&mut state);
        }
    }

    /// Wake every parked stage so it rechecks its hold condition
    pub fn resume_all(&self) {
        let _state = self.state.lock();
        self.resume_cv.notify_all();
    }
}


#[cfg(test)]
impl FreezeGate {
    /// Test helper: wait until ranks below `rank` are quiet
    fn wait_all_quiet_rank(&self, rank: usize) {
        let mut state = self.state.lock();
        while !(0..rank).all(|r| state.parked[r] + state.done[r] >= self.expected[r]) {
            self.stage_cv.wait(&mut state);
        }
    }
}
