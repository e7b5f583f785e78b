//! Driver-facing packet IO contracts
//!
//! The driver supplies a [`PacketSource`] the emitter pulls from and a
//! [`ResultSink`] the collector delivers into. Both are trait objects
//! owning whatever state the driver needs (open captures, rate shaping,
//! counters); the runtime never sees process globals.

use bytes::Bytes;

use crate::engine::Classification;

/// One packet handed to the pipeline
#[derive(Debug, Clone)]
pub struct Packet {
    /// Raw IP datagram (link layer already stripped)
    pub data: Bytes,
    /// Arrival time in seconds, driver clock
    pub timestamp: u32,
    /// Opaque tag threaded through to the matching [`Delivery`]
    pub user_tag: u64,
}

/// Classification result delivered back to the driver
///
/// The borrowed classification is valid only for the duration of the
/// [`ResultSink::deliver`] call.
#[derive(Debug)]
pub struct Delivery<'a> {
    /// Tag of the originating [`Packet`]
    pub user_tag: u64,
    /// What the engine concluded about the packet's flow
    pub classification: &'a Classification,
}

/// Pull-based packet supplier driven by the emitter
pub trait PacketSource: Send {
    /// Next packet, or `None` for end-of-stream.
    ///
    /// Returning `None` starts pipeline drain and termination; the source
    /// is not polled again afterwards. The call may block.
    fn next_packet(&mut self) -> Option<Packet>;
}

/// Receiver of classification results, driven by the collector
pub trait ResultSink: Send {
    /// Called once per admitted packet, in per-flow admission order
    fn deliver(&mut self, delivery: Delivery<'_>);
}

impl<F> PacketSource for F
where
    F: FnMut() -> Option<Packet> + Send,
{
    fn next_packet(&mut self) -> Option<Packet> {
        self()
    }
}

/// Hand-off slots between `set_read_and_process_callbacks` and the stages
///
/// Stages are spawned frozen at init, before the driver has supplied its
/// callbacks; the emitter and final collector claim their trait objects
/// from here on first resume.
#[derive(Default)]
pub(crate) struct IoSlots {
    pub source: parking_lot::Mutex<Option<Box<dyn PacketSource>>>,
    pub sink: parking_lot::Mutex<Option<Box<dyn ResultSink>>>,
}

impl IoSlots {
    pub fn is_ready(&self) -> bool {
        self.source.lock().is_some() && self.sink.lock().is_some()
    }
}
