//! OpenDPI adaptive parallel pipeline
//!
//! A multicore wrapper around a sequential inspection engine. The runtime
//! measures its own utilization and energy draw, then resizes its worker
//! pool and retunes CPU frequency to keep load inside a target band while
//! minimizing power.
//!
//! # Architecture
//!
//! ```text
//! single farm                      double farm (pipeline of farms)
//!
//! ┌─────────┐                      ┌─────────┐        ┌─────────┐
//! │ emitter │ reads + L3/L4        │ L3/L4   │        │ L7      │
//! └────┬────┘                      │ emitter │        │ emitter │
//!      │ flow-affine               └────┬────┘        └────┬────┘
//!   ┌──┴──┬─────┐                       │ rr/on-demand     │ flow-affine
//!   ▼     ▼     ▼                    ┌──┴──┐            ┌──┴──┐
//! ┌────┐┌────┐┌────┐                 ▼     ▼            ▼     ▼
//! │ w0 ││ w1 ││ wN │ L7 classify   ┌────┐┌────┐       ┌────┐┌────┐
//! └──┬─┘└──┬─┘└──┬─┘               │ w0 ││ wM │ prep  │ w0 ││ wN │
//!    └─────┼─────┘                 └──┬─┘└──┬─┘       └──┬─┘└──┬─┘
//!          ▼                          └──┬──┘            └──┬──┘
//!    ┌───────────┐                       ▼                  ▼
//!    │ collector │                 ┌───────────┐      ┌───────────┐
//!    └───────────┘                 │ collector ├─────▶│ collector │
//!                                  └───────────┘      └───────────┘
//! ```
//!
//! Every stage runs on its own OS thread pinned to a distinct real core.
//! A freeze flag broadcast to all stages drains the pipeline to a parked
//! state so worker count, flow partitioning and CPU frequency can change
//! without dropping or reordering in-flight work.

#![warn(missing_docs)]

mod collector;
mod emitter;
pub mod engine;
pub mod farm;
mod freeze;
pub mod io;
pub mod reconf;
pub mod runtime;
pub mod stats;
mod task;
mod worker;

pub use engine::{
    AppProtocol, Classification, ClassificationStatus, EngineDirective, EngineLimits,
    FlowCleaner, HttpCallbacks, InspectionEngine, PortClassifierEngine, PreparedPacket,
};
pub use farm::{ParallelismConfig, SchedulingMode, TopologyKind};
pub use io::{Delivery, Packet, PacketSource, ResultSink};
pub use reconf::{
    ConfigPoint, FrequencyMode, FrequencyStrategy, LinearCapacityPredictor, LoadPredictor,
    ReconfigurationParams,
};
pub use runtime::{DpiRuntime, RuntimeConfig, RuntimeStats};
pub use stats::{EnergyReport, IdleWatts, StatsCallback, StatsSnapshot};

/// Capacity of each emitter → worker queue
pub const FARM_INPUT_BUFFER_CAP: usize = 2048;

/// Capacity of the workers → collector queue
pub const FARM_OUTPUT_BUFFER_CAP: usize = 4096;

/// Capacity of the queue between the two farms of the double topology
pub const PIPELINE_BUFFER_CAP: usize = 1024;

/// Capacity of the recycled-task pool
pub const TASKS_POOL_CAP: usize = 16 * 1024;

/// How long a blocked stage waits before rechecking control flags
pub(crate) const STAGE_POLL: std::time::Duration = std::time::Duration::from_millis(20);
