//! OpenDPI hardware facade
//!
//! Everything platform-specific the runtime touches lives behind this
//! crate: real-core/socket topology, per-socket energy counters with
//! 32-bit wrap handling, and cpufreq frequency/governor control. The
//! runtime core never reads sysfs directly; tests run against the mock
//! backends exported here.

#![warn(missing_docs)]

pub mod cpufreq;
pub mod rapl;
pub mod topology;

pub use cpufreq::{FrequencyControl, Governor, NullFrequencyControl, StaticFrequencyControl, SysfsCpuFreq};
pub use rapl::{CounterBackend, EnergyCounters, EnergySample, MockCounters, RawSnapshot, RawSocketCounters};
pub use topology::{CpuCore, CpuTopology};
