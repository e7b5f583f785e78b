//! Collector stages
//!
//! The final collector delivers classification results to the driver's
//! sink and recycles tasks into the pool. In the double topology the
//! first farm's collector instead forwards tasks to the L7 emitter,
//! restoring ingress order first when the farm is configured ordered.
//!
//! The final collector is migratable: when the worker pool shrinks with
//! `migrate_collector` set, the supervisor updates the shared target core
//! and the collector re-pins itself on its own thread.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::engine::Classification;
use crate::farm::pin_thread;
use crate::freeze::{FreezeGate, SharedFlags};
use crate::io::{Delivery, IoSlots, ResultSink};
use crate::task::{Task, TaskPool};
use crate::STAGE_POLL;

/// Where a collector sends finished tasks
pub(crate) enum CollectorOutput {
    /// Deliver to the driver sink and recycle the task
    Deliver {
        io: Arc<IoSlots>,
        pool: Arc<TaskPool>,
    },
    /// Forward to the next farm
    Forward(Sender<Box<Task>>),
}

/// How the collector's thread is placed
pub(crate) enum CoreBinding {
    /// Pinned once at spawn
    Fixed(Option<usize>),
    /// Follows the shared collector-core slot (single-farm collector)
    Migratable,
}

/// Restores admission order for an ordered farm
#[derive(Default)]
struct ReorderBuffer {
    next_seq: u64,
    pending: BTreeMap<u64, Box<Task>>,
}

impl ReorderBuffer {
    /// Accept one task, returning every task now deliverable in order
    fn push(&mut self, task: Box<Task>) -> Vec<Box<Task>> {
        let mut ready = Vec::new();
        if task.seq == self.next_seq {
            self.next_seq += 1;
            ready.push(task);
            while let Some(task) = self.pending.remove(&self.next_seq) {
                self.next_seq += 1;
                ready.push(task);
            }
        } else {
            self.pending.insert(task.seq, task);
        }
        ready
    }

    /// Remaining tasks in sequence order (used at end of stream)
    fn drain(&mut self) -> Vec<Box<Task>> {
        std::mem::take(&mut self.pending).into_values().collect()
    }
}

pub(crate) struct CollectorStage {
    pub input: Receiver<Box<Task>>,
    pub output: CollectorOutput,
    pub ordered: bool,
    pub flags: Arc<SharedFlags>,
    pub gate: Arc<FreezeGate>,
    pub rank: usize,
    pub binding: CoreBinding,
}

impl CollectorStage {
    pub fn run(self) {
        let mut pinned: Option<usize> = None;
        self.repin(&mut pinned);

        let mut sink: Option<Box<dyn ResultSink>> = None;
        let mut reorder = self.ordered.then(ReorderBuffer::default);

        loop {
            self.repin(&mut pinned);

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
                Ok(task) => match reorder.as_mut() {
                    Some(buffer) => {
                        for task in buffer.push(task) {
                            self.emit(task, &mut sink);
                        }
                    }
                    None => self.emit(task, &mut sink),
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Gaps cannot fill after end of stream; flush what is buffered.
        if let Some(mut buffer) = reorder {
            for task in buffer.drain() {
                self.emit(task, &mut sink);
            }
        }
        self.gate.mark_done(self.rank);
    }

    fn repin(&self, pinned: &mut Option<usize>) {
        let target = match &self.binding {
            CoreBinding::Fixed(core) => *core,
            CoreBinding::Migratable => {
                Some(self.flags.collector_core.load(std::sync::atomic::Ordering::Acquire))
            }
        };
        if target.is_some() && target != *pinned {
            pin_thread(target);
            *pinned = target;
        }
    }

    fn emit(&self, task: Box<Task>, sink: &mut Option<Box<dyn ResultSink>>) {
        match &self.output {
            CollectorOutput::Forward(tx) => {
                let _ = tx.send(task);
            }
            CollectorOutput::Deliver { io, pool } => {
                if sink.is_none() {
                    *sink = io.sink.lock().take();
                }
                if let Some(sink) = sink.as_mut() {
                    let classification = task.classification.unwrap_or(Classification::NOT_IP);
                    sink.deliver(Delivery {
                        user_tag: task.user_tag,
                        classification: &classification,
                    });
                }
                pool.release(task);
            }
        }
    }
}
