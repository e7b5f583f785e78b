//! Worker stage
//!
//! Executes the sequential engine on each task and accounts its own busy
//! time. The busy/wall accumulators are single-writer (the worker) and
//! read by the supervisor during sampling; one stale sample is tolerated,
//! so no lock is involved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use dpi_common::CacheAligned;

use crate::engine::{Classification, InspectionEngine};
use crate::farm::pin_thread;
use crate::freeze::{FreezeGate, SharedFlags};
use crate::task::Task;
use crate::STAGE_POLL;

/// Busy-fraction accumulators for one worker, cache-line isolated
#[derive(Debug, Default)]
pub(crate) struct WorkerLoad {
    busy_nanos: AtomicU64,
    window_start_nanos: AtomicU64,
    tasks_processed: AtomicU64,
}

impl WorkerLoad {
    /// Add service time to the current window
    #[inline]
    pub fn record_busy(&self, nanos: u64) {
        self.busy_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.tasks_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Busy fraction over the current window, scaled to [0, 100]
    pub fn worktime_percentage(&self, now_nanos: u64) -> f64 {
        let start = self.window_start_nanos.load(Ordering::Relaxed);
        let wall = now_nanos.saturating_sub(start).max(1);
        let busy = self.busy_nanos.load(Ordering::Relaxed);
        (busy as f64 / wall as f64 * 100.0).min(100.0)
    }

    /// Zero the accumulators and restart the window at `now_nanos`
    pub fn reset_worktime(&self, now_nanos: u64) {
        self.busy_nanos.store(0, Ordering::Relaxed);
        self.window_start_nanos.store(now_nanos, Ordering::Relaxed);
    }

    /// Tasks processed since spawn
    pub fn tasks_processed(&self) -> u64 {
        self.tasks_processed.load(Ordering::Relaxed)
    }
}

/// What the worker asks of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerRole {
    /// L3/L4 preprocessing (double-farm first stage)
    Prepare,
    /// L7 classification against the worker's own partition
    Classify,
}

pub(crate) struct WorkerStage {
    pub index: usize,
    pub role: WorkerRole,
    pub rank: usize,
    pub engine: Arc<dyn InspectionEngine>,
    pub rx: Receiver<Box<Task>>,
    pub tx: Sender<Box<Task>>,
    pub flags: Arc<SharedFlags>,
    pub gate: Arc<FreezeGate>,
    pub load: Arc<CacheAligned<WorkerLoad>>,
    pub epoch: Instant,
    pub core: Option<usize>,
    /// Whether this worker participates in live resizing
    pub dynamic: bool,
}

impl WorkerStage {
    pub fn run(mut self) {
        pin_thread(self.core);
        self.load.reset_worktime(self.epoch.elapsed().as_nanos() as u64);
        tracing::debug!(index = self.index, role = ?self.role, "worker starting");

        loop {
            if self.flags.terminating() {
                if self.gate.done_below(self.rank) && self.rx.is_empty() {
                    break;
                }
            } else if self.flags.frozen() {
                if self.gate.quiet_below(self.rank) && self.rx.is_empty() {
                    let flags = &self.flags;
                    self.gate.park(self.rank, flags, || flags.frozen());
                    continue;
                }
            } else if self.dynamic
                && self.index >= self.flags.active_workers()
                && self.rx.is_empty()
            {
                // Deactivated by a shrink: sleep until the next resume.
                let flags = &self.flags;
                let index = self.index;
                self.gate.park(self.rank, flags, || {
                    flags.frozen() || index >= flags.active_workers()
                });
                continue;
            }

            match self.rx.recv_timeout(STAGE_POLL) {
                Ok(task) => self.process(task),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        tracing::debug!(index = self.index, "worker stopped");
        self.gate.mark_done(self.rank);
    }

    fn process(&mut self, mut task: Box<Task>) {
        let started = Instant::now();
        match self.role {
            WorkerRole::Prepare => {
                task.prepared = self.engine.prepare(&task.data, task.timestamp);
            }
            WorkerRole::Classify => {
                let classification = match task.prepared.as_ref() {
                    Some(prepared) => {
                        self.engine
                            .classify(self.index, prepared, &task.data, task.timestamp)
                    }
                    None => Classification::NOT_IP,
                };
                task.classification = Some(classification);
            }
        }
        self.load.record_busy(started.elapsed().as_nanos() as u64);
        let _ = self.tx.send(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worktime_percentage() {
        let load = WorkerLoad::default();
        load.reset_worktime(0);
        load.record_busy(250);
        // 250 ns busy over a 1000 ns wall window.
        assert!((load.worktime_percentage(1000) - 25.0).abs() < 1e-9);
        assert_eq!(load.tasks_processed(), 1);
    }

    #[test]
    fn test_percentage_capped_at_100() {
        let load = WorkerLoad::default();
        load.reset_worktime(0);
        load.record_busy(5000);
        assert_eq!(load.worktime_percentage(1000), 100.0);
    }

    #[test]
    fn test_reset_zeroes_window() {
        let load = WorkerLoad::default();
        load.reset_worktime(0);
        load.record_busy(800);
        load.reset_worktime(1000);
        assert!((load.worktime_percentage(2000) - 0.0).abs() < 1e-9);
        // Task counter survives resets.
        assert_eq!(load.tasks_processed(), 1);
    }

    #[test]
    fn test_cache_isolation() {
        assert_eq!(std::mem::align_of::<CacheAligned<WorkerLoad>>(), 64);
    }
}
