//! Emitter stages
//!
//! [`SourceEmitter`] heads a farm fed by the driver's packet source; in
//! the single-farm topology it is *collapsed*: it also runs L3/L4
//! preprocessing before dispatching by flow hash. [`StageEmitter`] heads
//! the L7 farm of the double topology and pulls from the first farm's
//! collector instead of the driver.
//!
//! The emitter is the first stage to observe the freeze flag: it stops
//! pulling input, finishes dispatching the task in hand and parks, which
//! lets everything downstream run to empty.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::engine::InspectionEngine;
use crate::farm::pin_thread;
use crate::freeze::{FreezeGate, SharedFlags};
use crate::io::IoSlots;
use crate::task::{Task, TaskPool};
use crate::STAGE_POLL;

/// How an emitter spreads tasks over its workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchPolicy {
    /// `hash(flow) % active_workers`; all packets of a flow share a worker
    FlowAffine,
    /// Rotate over workers
    RoundRobin,
    /// First worker with queue capacity
    OnDemand,
}

pub(crate) struct SourceEmitter {
    pub io: Arc<IoSlots>,
    pub outputs: Vec<Sender<Box<Task>>>,
    pub pool: Arc<TaskPool>,
    /// Present in collapsed mode: L3/L4 preprocessing happens here
    pub engine: Option<Arc<dyn InspectionEngine>>,
    pub dispatch: DispatchPolicy,
    pub flags: Arc<SharedFlags>,
    pub gate: Arc<FreezeGate>,
    pub rank: usize,
    pub core: Option<usize>,
}

impl SourceEmitter {
    pub fn run(self) {
        pin_thread(self.core);
        let mut source = None;
        let mut seq: u64 = 0;
        let mut rr_next: usize = 0;

        loop {
            if self.flags.terminating() {
                break;
            }
            if self.flags.frozen() {
                let flags = &self.flags;
                self.gate.park(self.rank, flags, || flags.frozen());
                continue;
            }
            if source.is_none() {
                source = self.io.source.lock().take();
                if source.is_none() {
                    std::thread::sleep(STAGE_POLL);
                    continue;
                }
            }

            let Some(src) = source.as_mut() else { continue };
            let Some(packet) = src.next_packet() else {
                tracing::info!(packets = seq, "end of stream");
                self.flags.terminating.store(true, Ordering::Release);
                break;
            };

            let mut task = self.pool.acquire();
            task.rebind(packet, seq);
            seq += 1;
            if let Some(engine) = &self.engine {
                task.prepared = engine.prepare(&task.data, task.timestamp);
            }
            dispatch(
                task,
                &self.outputs,
                self.dispatch,
                &self.flags,
                &mut rr_next,
            );
        }
        self.gate.mark_done(self.rank);
    }
}

/// Second-stage emitter: pulls prepared tasks from the upstream farm
pub(crate) struct StageEmitter {
    pub input: Receiver<Box<Task>>,
    pub outputs: Vec<Sender<Box<Task>>>,
    pub flags: Arc<SharedFlags>,
    pub gate: Arc<FreezeGate>,
    pub rank: usize,
    pub core: Option<usize>,
}

impl StageEmitter {
    pub fn run(self) {
        pin_thread(self.core);
        let mut rr_next: usize = 0;

        loop {
            if self.flags.terminating() {
                if self.gate.done_below(self.rank) && self.input.is_empty() {
                    break;
                }
            } else if self.flags.frozen() {
                if self.gate.quiet_below(self.rank) && self.input.is_empty() {
                    let flags = &self.flags;
                    self.gate.park(self.rank, flags, || flags.frozen());
                    continue;
                }
            }

            match self.input.recv_timeout(STAGE_POLL) {
                Ok(task) => dispatch(
                    task,
                    &self.outputs,
                    DispatchPolicy::FlowAffine,
                    &self.flags,
                    &mut rr_next,
                ),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.gate.mark_done(self.rank);
    }
}

fn dispatch(
    task: Box<Task>,
    outputs: &[Sender<Box<Task>>],
    policy: DispatchPolicy,
    flags: &SharedFlags,
    rr_next: &mut usize,
) {
    match policy {
        DispatchPolicy::FlowAffine => {
            let active = flags.active_workers().min(outputs.len()).max(1);
            let idx = task
                .prepared
                .as_ref()
                .map(|p| p.fingerprint.partition(active))
                .unwrap_or(0);
            let _ = outputs[idx].send(task);
        }
        DispatchPolicy::RoundRobin => {
            let idx = *rr_next % outputs.len();
            *rr_next = rr_next.wrapping_add(1);
            let _ = outputs[idx].send(task);
        }
        DispatchPolicy::OnDemand => {
            let mut pending = task;
            'outer: loop {
                for i in 0..outputs.len() {
                    let idx = (*rr_next + i) % outputs.len();
                    match outputs[idx].try_send(pending) {
                        Ok(()) => {
                            *rr_next = idx + 1;
                            break 'outer;
                        }
                        Err(TrySendError::Full(t)) | Err(TrySendError::Disconnected(t)) => {
                            pending = t;
                        }
                    }
                }
                if flags.terminating() {
                    break;
                }
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    fn flags_with(active: usize) -> Arc<SharedFlags> {
        let flags = SharedFlags::new(active, 0);
        flags.freeze.store(false, Ordering::Release);
        flags
    }

    fn task_for_flow(port: u16) -> Box<Task> {
        let mut t = Box::new(Task::default());
        t.prepared = Some(crate::engine::PreparedPacket {
            fingerprint: dpi_common::FlowFingerprint::new_v4(1, 2, port, 443, 6),
            payload_offset: 40,
        });
        t
    }

    #[test]
    fn test_flow_affine_respects_active_count() {
        let flags = flags_with(2);
        let (tx0, rx0) = bounded(16);
        let (tx1, rx1) = bounded(16);
        let (tx2, rx2) = bounded(16);
        let outputs = vec![tx0, tx1, tx2];
        let mut rr = 0;

        for port in 0..32 {
            dispatch(
                task_for_flow(10000 + port),
                &outputs,
                DispatchPolicy::FlowAffine,
                &flags,
                &mut rr,
            );
        }
        // Only the two active workers may receive traffic.
        assert_eq!(rx2.len(), 0);
        assert_eq!(rx0.len() + rx1.len(), 32);
    }

    #[test]
    fn test_flow_affine_is_sticky_per_flow() {
        let flags = flags_with(3);
        let (tx0, rx0) = bounded(64);
        let (tx1, rx1) = bounded(64);
        let (tx2, rx2) = bounded(64);
        let outputs = vec![tx0, tx1, tx2];
        let mut rr = 0;

        for _ in 0..10 {
            dispatch(
                task_for_flow(12345),
                &outputs,
                DispatchPolicy::FlowAffine,
                &flags,
                &mut rr,
            );
        }
        let counts = [rx0.len(), rx1.len(), rx2.len()];
        assert!(counts.contains(&10));
        assert_eq!(counts.iter().sum::<usize>(), 10);
    }

    #[test]
    fn test_round_robin_rotates() {
        let flags = flags_with(2);
        let (tx0, rx0) = bounded(16);
        let (tx1, rx1) = bounded(16);
        let outputs = vec![tx0, tx1];
        let mut rr = 0;

        for _ in 0..6 {
            dispatch(
                Box::new(Task::default()),
                &outputs,
                DispatchPolicy::RoundRobin,
                &flags,
                &mut rr,
            );
        }
        assert_eq!(rx0.len(), 3);
        assert_eq!(rx1.len(), 3);
    }

    #[test]
    fn test_on_demand_skips_full_queues() {
        let flags = flags_with(2);
        let (tx0, rx0) = bounded(1);
        let (tx1, rx1) = bounded(16);
        let outputs = vec![tx0, tx1];
        let mut rr = 0;

        for _ in 0..5 {
            dispatch(
                Box::new(Task::default()),
                &outputs,
                DispatchPolicy::OnDemand,
                &flags,
                &mut rr,
            );
        }
        assert_eq!(rx0.len(), 1);
        assert_eq!(rx1.len(), 4);
    }
}
