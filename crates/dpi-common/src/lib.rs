//! OpenDPI shared types
//!
//! Foundation crate for the adaptive DPI runtime: the error taxonomy used
//! across the workspace, canonicalized flow fingerprints with the stable
//! dispatch hash, minimal L3/L4 header extraction, and the cache-alignment
//! primitive used by per-worker hot state.

#![warn(missing_docs)]

pub mod align;
pub mod error;
pub mod flow;
pub mod packet;

pub use align::CacheAligned;
pub use error::{CoreError, CoreResult};
pub use flow::{FlowFingerprint, TransportProtocol};
pub use packet::ParsedPacket;

/// Cache line size assumed for alignment decisions
pub const CACHE_LINE: usize = 64;
