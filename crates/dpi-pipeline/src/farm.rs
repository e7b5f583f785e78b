//! Farm fabric
//!
//! Wires stages into one of the two supported topologies and spawns one
//! pinned OS thread per stage:
//!
//! - **single farm**: collapsed emitter → N L7 workers → collector
//! - **double farm**: L3/L4 farm → L7 farm, joined by a bounded queue
//!
//! Stage threads live for the pipeline's whole lifetime; resizing parks
//! and wakes workers instead of spawning and joining them.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::bounded;
use serde::{Deserialize, Serialize};

use dpi_common::{CacheAligned, CoreError, CoreResult};

use crate::collector::{CollectorOutput, CollectorStage, CoreBinding};
use crate::emitter::{DispatchPolicy, SourceEmitter, StageEmitter};
use crate::engine::InspectionEngine;
use crate::freeze::{FreezeGate, SharedFlags};
use crate::io::IoSlots;
use crate::task::{Task, TaskPool};
use crate::worker::{WorkerLoad, WorkerRole, WorkerStage};
use crate::{FARM_INPUT_BUFFER_CAP, FARM_OUTPUT_BUFFER_CAP, PIPELINE_BUFFER_CAP};

/// Pipeline shape, fixed for the lifetime of the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyKind {
    /// One farm; the emitter also runs L3/L4 preprocessing
    SingleFarm,
    /// L3/L4 farm feeding an L7 farm
    DoubleFarm,
}

/// Scheduling of the L3/L4 farm in the double topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingMode {
    /// Round-robin dispatch
    Default,
    /// Dispatch to the first worker with queue capacity
    OnDemand,
    /// Round-robin with ingress order restored at the farm's collector
    Ordered,
}

/// Placement and shape details supplied at init
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelismConfig {
    /// Cores the runtime may occupy; `None` means every real core
    pub available_processors: Option<usize>,
    /// Slot → physical core mapping; `None` derives a linear real-core map
    pub mapping: Option<Vec<usize>>,
    /// Farm topology
    pub topology: TopologyKind,
    /// L3/L4 worker count (double farm)
    pub l34_workers: usize,
    /// L7 worker count (double farm)
    pub l7_workers: usize,
    /// L3/L4 farm scheduling (double farm)
    pub scheduling: SchedulingMode,
}

impl Default for ParallelismConfig {
    fn default() -> Self {
        Self {
            available_processors: None,
            mapping: None,
            topology: TopologyKind::SingleFarm,
            l34_workers: 1,
            l7_workers: 1,
            scheduling: SchedulingMode::Default,
        }
    }
}

/// Everything the fabric needs to wire a topology
pub(crate) struct FarmInputs {
    pub engine: Arc<dyn InspectionEngine>,
    pub flags: Arc<SharedFlags>,
    pub pool: Arc<TaskPool>,
    pub io: Arc<IoSlots>,
    pub epoch: Instant,
    pub mapping: Vec<usize>,
}

/// A built, spawned (and frozen) topology
pub(crate) struct FarmBuild {
    pub threads: Vec<JoinHandle<()>>,
    pub gate: Arc<FreezeGate>,
    pub loads: Vec<Arc<CacheAligned<WorkerLoad>>>,
}

/// Pin the calling thread to a physical core, best effort
pub(crate) fn pin_thread(core: Option<usize>) {
    if let Some(id) = core {
        if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
            tracing::warn!(core = id, "failed to pin thread to core");
        }
    }
}

fn spawn(name: String, f: impl FnOnce() + Send + 'static) -> CoreResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| CoreError::ResourceExhausted(format!("spawning {name}: {e}")))
}

pub(crate) fn build_single_farm(inputs: &FarmInputs, max_workers: usize) -> CoreResult<FarmBuild> {
    let gate = FreezeGate::new(vec![1, max_workers, 1]);
    let slot = |i: usize| Some(inputs.mapping[i % inputs.mapping.len()]);

    let mut worker_txs = Vec::with_capacity(max_workers);
    let mut worker_rxs = Vec::with_capacity(max_workers);
    for _ in 0..max_workers {
        let (tx, rx) = bounded::<Box<Task>>(FARM_INPUT_BUFFER_CAP);
        worker_txs.push(tx);
        worker_rxs.push(rx);
    }
    let (out_tx, out_rx) = bounded::<Box<Task>>(FARM_OUTPUT_BUFFER_CAP);

    let mut threads = Vec::with_capacity(max_workers + 2);
    let mut loads = Vec::with_capacity(max_workers);

    let emitter = SourceEmitter {
        io: inputs.io.clone(),
        outputs: worker_txs,
        pool: inputs.pool.clone(),
        engine: Some(inputs.engine.clone()),
        dispatch: DispatchPolicy::FlowAffine,
        flags: inputs.flags.clone(),
        gate: gate.clone(),
        rank: 0,
        core: slot(0),
    };
    threads.push(spawn("dpi-emitter".into(), move || emitter.run())?);

    for (i, rx) in worker_rxs.into_iter().enumerate() {
        let load = Arc::new(CacheAligned::new(WorkerLoad::default()));
        loads.push(load.clone());
        let worker = WorkerStage {
            index: i,
            role: WorkerRole::Classify,
            rank: 1,
            engine: inputs.engine.clone(),
            rx,
            tx: out_tx.clone(),
            flags: inputs.flags.clone(),
            gate: gate.clone(),
            load,
            epoch: inputs.epoch,
            core: slot(1 + i),
            dynamic: true,
        };
        threads.push(spawn(format!("dpi-worker-{i}"), move || worker.run())?);
    }
    drop(out_tx);

    let collector = CollectorStage {
        input: out_rx,
        output: CollectorOutput::Deliver {
            io: inputs.io.clone(),
            pool: inputs.pool.clone(),
        },
        ordered: false,
        flags: inputs.flags.clone(),
        gate: gate.clone(),
        rank: 2,
        binding: CoreBinding::Migratable,
    };
    threads.push(spawn("dpi-collector".into(), move || collector.run())?);

    Ok(FarmBuild {
        threads,
        gate,
        loads,
    })
}

pub(crate) fn build_double_farm(
    inputs: &FarmInputs,
    l34_workers: usize,
    l7_workers: usize,
    scheduling: SchedulingMode,
) -> CoreResult<FarmBuild> {
    let gate = FreezeGate::new(vec![1, l34_workers, 1, 1, l7_workers, 1]);
    let slot = |i: usize| Some(inputs.mapping[i % inputs.mapping.len()]);

    let mut threads = Vec::new();
    let mut loads = Vec::with_capacity(l7_workers);

    // First farm: read → prepare → (reorder) → forward.
    let mut l34_txs = Vec::with_capacity(l34_workers);
    let mut l34_rxs = Vec::with_capacity(l34_workers);
    for _ in 0..l34_workers {
        let (tx, rx) = bounded::<Box<Task>>(FARM_INPUT_BUFFER_CAP);
        l34_txs.push(tx);
        l34_rxs.push(rx);
    }
    let (l34_out_tx, l34_out_rx) = bounded::<Box<Task>>(FARM_OUTPUT_BUFFER_CAP);
    let (pipe_tx, pipe_rx) = bounded::<Box<Task>>(PIPELINE_BUFFER_CAP);

    let l34_emitter = SourceEmitter {
        io: inputs.io.clone(),
        outputs: l34_txs,
        pool: inputs.pool.clone(),
        engine: None,
        dispatch: match scheduling {
            SchedulingMode::OnDemand => DispatchPolicy::OnDemand,
            SchedulingMode::Default | SchedulingMode::Ordered => DispatchPolicy::RoundRobin,
        },
        flags: inputs.flags.clone(),
        gate: gate.clone(),
        rank: 0,
        core: slot(0),
    };
    threads.push(spawn("dpi-l34-emitter".into(), move || l34_emitter.run())?);

    for (i, rx) in l34_rxs.into_iter().enumerate() {
        let worker = WorkerStage {
            index: i,
            role: WorkerRole::Prepare,
            rank: 1,
            engine: inputs.engine.clone(),
            rx,
            tx: l34_out_tx.clone(),
            flags: inputs.flags.clone(),
            gate: gate.clone(),
            load: Arc::new(CacheAligned::new(WorkerLoad::default())),
            epoch: inputs.epoch,
            core: slot(1 + i),
            dynamic: false,
        };
        threads.push(spawn(format!("dpi-l34-worker-{i}"), move || worker.run())?);
    }
    drop(l34_out_tx);

    let l34_collector = CollectorStage {
        input: l34_out_rx,
        output: CollectorOutput::Forward(pipe_tx),
        ordered: scheduling == SchedulingMode::Ordered,
        flags: inputs.flags.clone(),
        gate: gate.clone(),
        rank: 2,
        binding: CoreBinding::Fixed(slot(l34_workers + 1)),
    };
    threads.push(spawn("dpi-l34-collector".into(), move || l34_collector.run())?);

    // Second farm: flow-affine classify → deliver.
    let mut l7_txs = Vec::with_capacity(l7_workers);
    let mut l7_rxs = Vec::with_capacity(l7_workers);
    for _ in 0..l7_workers {
        let (tx, rx) = bounded::<Box<Task>>(FARM_INPUT_BUFFER_CAP);
        l7_txs.push(tx);
        l7_rxs.push(rx);
    }
    let (l7_out_tx, l7_out_rx) = bounded::<Box<Task>>(FARM_OUTPUT_BUFFER_CAP);

    let l7_emitter = StageEmitter {
        input: pipe_rx,
        outputs: l7_txs,
        flags: inputs.flags.clone(),
        gate: gate.clone(),
        rank: 3,
        core: slot(l34_workers + 2),
    };
    threads.push(spawn("dpi-l7-emitter".into(), move || l7_emitter.run())?);

    for (i, rx) in l7_rxs.into_iter().enumerate() {
        let load = Arc::new(CacheAligned::new(WorkerLoad::default()));
        loads.push(load.clone());
        let worker = WorkerStage {
            index: i,
            role: WorkerRole::Classify,
            rank: 4,
            engine: inputs.engine.clone(),
            rx,
            tx: l7_out_tx.clone(),
            flags: inputs.flags.clone(),
            gate: gate.clone(),
            load,
            epoch: inputs.epoch,
            core: slot(l34_workers + 3 + i),
            dynamic: false,
        };
        threads.push(spawn(format!("dpi-l7-worker-{i}"), move || worker.run())?);
    }
    drop(l7_out_tx);

    let l7_collector = CollectorStage {
        input: l7_out_rx,
        output: CollectorOutput::Deliver {
            io: inputs.io.clone(),
            pool: inputs.pool.clone(),
        },
        ordered: false,
        flags: inputs.flags.clone(),
        gate: gate.clone(),
        rank: 5,
        binding: CoreBinding::Fixed(slot(l34_workers + 3 + l7_workers)),
    };
    threads.push(spawn("dpi-l7-collector".into(), move || l7_collector.run())?);

    Ok(FarmBuild {
        threads,
        gate,
        loads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ParallelismConfig::default();
        assert_eq!(cfg.topology, TopologyKind::SingleFarm);
        assert_eq!(cfg.scheduling, SchedulingMode::Default);
        assert!(cfg.mapping.is_none());
    }

    #[test]
    fn test_config_roundtrips_through_serde() {
        let cfg = ParallelismConfig {
            available_processors: Some(8),
            mapping: Some(vec![0, 2, 4, 6]),
            topology: TopologyKind::DoubleFarm,
            l34_workers: 2,
            l7_workers: 3,
            scheduling: SchedulingMode::Ordered,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ParallelismConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.topology, TopologyKind::DoubleFarm);
        assert_eq!(back.mapping, Some(vec![0, 2, 4, 6]));
    }
}
