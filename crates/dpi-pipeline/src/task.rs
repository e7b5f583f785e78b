//! In-flight work items and the recycled-task pool
//!
//! A task is owned exclusively by whichever stage currently holds it; the
//! pool amortizes allocation across the hot path. The collector pushes
//! finished tasks back, the emitter pops them for the next packet; on
//! underflow the emitter allocates, on overflow the collector just drops.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;

use crate::engine::{Classification, PreparedPacket};
use crate::io::Packet;

/// One unit of in-flight work
#[derive(Debug, Default)]
pub(crate) struct Task {
    /// Raw datagram
    pub data: Bytes,
    /// Driver timestamp in seconds
    pub timestamp: u32,
    /// Opaque driver tag threaded to the delivery
    pub user_tag: u64,
    /// Admission sequence number, assigned by the emitter
    pub seq: u64,
    /// L3/L4 preprocessing result
    pub prepared: Option<PreparedPacket>,
    /// Engine verdict, set by the classify stage
    pub classification: Option<Classification>,
}

impl Task {
    /// Rebind this (recycled) task to a fresh packet
    pub fn rebind(&mut self, packet: Packet, seq: u64) {
        self.data = packet.data;
        self.timestamp = packet.timestamp;
        self.user_tag = packet.user_tag;
        self.seq = seq;
        self.prepared = None;
        self.classification = None;
    }
}

/// Bounded lock-free pool of recycled tasks
///
/// Single-producer (collector) / single-consumer (emitter) in steady
/// state. A zero capacity disables recycling entirely.
pub(crate) struct TaskPool {
    slots: Option<ArrayQueue<Box<Task>>>,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (capacity > 0).then(|| ArrayQueue::new(capacity)),
        }
    }

    /// Take a recycled task or allocate a fresh one
    pub fn acquire(&self) -> Box<Task> {
        match self.slots.as_ref().and_then(|q| q.pop()) {
            Some(task) => task,
            None => Box::new(Task::default()),
        }
    }

    /// Return a task to the pool; a full pool frees it instead
    pub fn release(&self, mut task: Box<Task>) {
        if let Some(slots) = self.slots.as_ref() {
            task.data = Bytes::new();
            task.prepared = None;
            task.classification = None;
            let _ = slots.push(task);
        }
    }
}
