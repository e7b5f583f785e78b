//! Statistics dispatch
//!
//! On its collection tick the supervisor snapshots the energy counters,
//! diffs them against the previous snapshot, strips the idle baseline and
//! hands the driver a [`StatsSnapshot`] describing the current
//! configuration. Machines without a dedicated offcore counter report it
//! as `socket − cores`.

use metrics::gauge;
use serde::{Deserialize, Serialize};

use dpi_power::{EnergySample, RawSnapshot};

/// Baseline idle power per domain, in watts, summed across sockets
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IdleWatts {
    /// Whole-package idle draw
    pub socket: f64,
    /// Core-domain idle draw
    pub cores: f64,
    /// Offcore-domain idle draw
    pub offcores: f64,
    /// DRAM idle draw
    pub dram: f64,
}

/// Joules consumed over one collection interval, idle-subtracted and
/// summed across sockets
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyReport {
    /// Whole-package joules
    pub socket: f64,
    /// Core-domain joules
    pub cores: f64,
    /// Offcore-domain joules
    pub offcores: f64,
    /// DRAM joules
    pub dram: f64,
}

/// Payload of the periodic stats callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Active worker count
    pub num_workers: usize,
    /// Current worker frequency in kHz (zero without frequency control)
    pub frequency_khz: u64,
    /// Energy over the collection interval
    pub energy: EnergyReport,
    /// Smoothed system load in [0, 100]
    pub system_load_pct: f64,
}

/// Driver-installed stats receiver
pub type StatsCallback = Box<dyn FnMut(&StatsSnapshot) + Send>;

/// State of the periodic collection
pub(crate) struct StatsDispatcher {
    pub callback: Option<StatsCallback>,
    /// Ticks between collections
    pub collection_interval: u32,
    pub last_snapshot: Option<RawSnapshot>,
    pub idle: IdleWatts,
}

impl StatsDispatcher {
    pub fn new() -> Self {
        Self {
            callback: None,
            collection_interval: 0,
            last_snapshot: None,
            idle: IdleWatts::default(),
        }
    }

    /// Shape one interval's energy sample into the callback report
    pub fn energy_report(sample: &EnergySample, idle: &IdleWatts, interval_secs: f64) -> EnergyReport {
        let socket = EnergySample::total(&sample.joules_socket) - idle.socket * interval_secs;
        let cores = EnergySample::total(&sample.joules_cores) - idle.cores * interval_secs;
        let raw_offcores = EnergySample::total(&sample.joules_offcores);
        let offcores = if raw_offcores == 0.0 {
            // No dedicated offcore counter on this machine.
            socket - cores
        } else {
            raw_offcores - idle.offcores * interval_secs
        };
        let dram = EnergySample::total(&sample.joules_dram) - idle.dram * interval_secs;
        EnergyReport {
            socket,
            cores,
            offcores,
            dram,
        }
    }

    /// Publish one snapshot to the metrics registry and the callback
    pub fn dispatch(&mut self, snapshot: &StatsSnapshot) {
        gauge!("dpi.workers.active").set(snapshot.num_workers as f64);
        gauge!("dpi.freq.current_khz").set(snapshot.frequency_khz as f64);
        gauge!("dpi.load.system").set(snapshot.system_load_pct);
        gauge!("dpi.energy.cores_joules").set(snapshot.energy.cores);

        if let Some(callback) = self.callback.as_mut() {
            callback(snapshot);
        }
    }
}
