//! The pipeline runtime and its control API
//!
//! [`DpiRuntime`] is the one long-lived object: it owns the engine, the
//! stage threads, the shared control atomics, the reconfiguration
//! controller and the hardware facade. Stages are spawned frozen at init
//! (warmed up), `run` resumes them, and `wait_end` hosts the supervisor
//! tick until the packet source signals end of stream.
//!
//! Every live mutation follows the same quiescence protocol: take the
//! state-update lock, freeze, delegate, unfreeze. No packet ever observes
//! a half-applied configuration.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use dpi_common::{CacheAligned, CoreError, CoreResult};
use dpi_power::{
    CpuTopology, EnergyCounters, EnergySample, FrequencyControl, Governor, NullFrequencyControl,
    RawSnapshot, SysfsCpuFreq,
};

use crate::engine::{
    EngineDirective, EngineLimits, FlowCleaner, HttpCallbacks, InspectionEngine,
    PortClassifierEngine,
};
use crate::farm::{self, FarmInputs, ParallelismConfig, TopologyKind};
use crate::freeze::{FreezeGate, SharedFlags};
use crate::io::{IoSlots, PacketSource, ResultSink};
use crate::reconf::{FrequencyMode, FrequencyStrategy, ReconfController, ReconfigurationParams};
use crate::stats::{IdleWatts, StatsCallback, StatsDispatcher, StatsSnapshot};
use crate::task::TaskPool;
use crate::worker::WorkerLoad;
use crate::TASKS_POOL_CAP;

/// Init-time configuration of a runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Flow-table sizing for the default engine
    pub engine_limits: EngineLimits,
    /// Topology, placement and worker counts
    pub parallelism: ParallelismConfig,
    /// Supervisor tick; sampling and collection intervals count ticks
    pub supervisor_tick: Duration,
    /// Recycled-task pool capacity; zero allocates per packet
    pub task_pool_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine_limits: EngineLimits::default(),
            parallelism: ParallelismConfig::default(),
            supervisor_tick: Duration::from_secs(1),
            task_pool_capacity: TASKS_POOL_CAP,
        }
    }
}

/// Execution summary, the `print_stats` counterpart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStats {
    /// Wall time from `run` to pipeline drain
    pub completion_time: Option<Duration>,
    /// Tasks processed by each L7 worker since spawn
    pub tasks_per_worker: Vec<u64>,
    /// Current active worker count
    pub active_workers: usize,
}

/// Control-plane state guarded by the state-update lock
struct ControlState {
    reconf: Option<ReconfController>,
    stats: StatsDispatcher,
    energy: EnergyCounters,
    freq: Box<dyn FrequencyControl>,
    available_frequencies: Vec<u64>,
    one_core_per_socket: Vec<usize>,
    start_time: Option<Instant>,
    completion_time: Option<Duration>,
}

/// The adaptive parallel DPI runtime
pub struct DpiRuntime {
    engine: Arc<dyn InspectionEngine>,
    flags: Arc<SharedFlags>,
    gate: Arc<FreezeGate>,
    io: Arc<IoSlots>,
    #[allow(dead_code)]
    pool: Arc<TaskPool>,
    loads: Vec<Arc<CacheAligned<WorkerLoad>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    control: Mutex<ControlState>,
    topology: TopologyKind,
    mapping: Vec<usize>,
    max_workers: usize,
    epoch: Instant,
    tick: Duration,
}

impl DpiRuntime {
    /// Initialize with the built-in port-map engine and detected hardware
    pub fn init(config: RuntimeConfig) -> CoreResult<Self> {
        let initial_workers = Self::initial_workers(&config)?;
        let engine: Arc<dyn InspectionEngine> =
            Arc::new(PortClassifierEngine::new(config.engine_limits, initial_workers));
        Self::init_with_engine(config, engine)
    }

    /// Initialize around a caller-supplied engine and detected hardware
    pub fn init_with_engine(
        config: RuntimeConfig,
        engine: Arc<dyn InspectionEngine>,
    ) -> CoreResult<Self> {
        let energy = EnergyCounters::detect();
        let freq: Box<dyn FrequencyControl> =
            match SysfsCpuFreq::open(std::path::Path::new(SysfsCpuFreq::DEFAULT_ROOT)) {
                Ok(ctl) => Box::new(ctl),
                Err(err) => {
                    tracing::warn!(%err, "cpufreq unavailable, frequency control disabled");
                    Box::new(NullFrequencyControl)
                }
            };
        Self::init_with(config, engine, energy, freq)
    }

    /// Initialize with explicit hardware facades (tests, simulation)
    pub fn init_with(
        config: RuntimeConfig,
        engine: Arc<dyn InspectionEngine>,
        energy: EnergyCounters,
        freq: Box<dyn FrequencyControl>,
    ) -> CoreResult<Self> {
        let topo = CpuTopology::detect();
        let available = config
            .parallelism
            .available_processors
            .unwrap_or_else(|| topo.num_real_cores());
        let initial_workers = Self::initial_workers(&config)?;

        let mapping = match &config.parallelism.mapping {
            Some(mapping) => {
                if mapping.len() != available {
                    return Err(CoreError::InvalidParameter(format!(
                        "mapping has {} slots for {available} processors",
                        mapping.len()
                    )));
                }
                mapping.clone()
            }
            None => {
                let linear = topo.linear_mapping(available);
                if linear.len() == available {
                    linear
                } else {
                    (0..available).collect()
                }
            }
        };

        let max_workers = match config.parallelism.topology {
            TopologyKind::SingleFarm => available - 2,
            TopologyKind::DoubleFarm => config.parallelism.l7_workers,
        };

        engine.repartition(initial_workers)?;

        let collector_core = mapping[(max_workers + 1) % mapping.len()];
        let flags = SharedFlags::new(initial_workers, collector_core);
        let io = Arc::new(IoSlots::default());
        let pool = Arc::new(TaskPool::new(config.task_pool_capacity));
        let epoch = Instant::now();

        let inputs = FarmInputs {
            engine: engine.clone(),
            flags: flags.clone(),
            pool: pool.clone(),
            io: io.clone(),
            epoch,
            mapping: mapping.clone(),
        };
        let build = match config.parallelism.topology {
            TopologyKind::SingleFarm => farm::build_single_farm(&inputs, max_workers)?,
            TopologyKind::DoubleFarm => farm::build_double_farm(
                &inputs,
                config.parallelism.l34_workers,
                config.parallelism.l7_workers,
                config.parallelism.scheduling,
            )?,
        };

        // Warm-up: every stage parks against the preset freeze flag before
        // init returns, so the first run resumes into steady state.
        build.gate.wait_all_quiet();
        tracing::info!(
            topology = ?config.parallelism.topology,
            processors = available,
            workers = initial_workers,
            "pipeline built and frozen"
        );

        let available_frequencies = freq.available_frequencies().to_vec();
        let one_core_per_socket = topo.one_core_per_socket(&mapping);

        Ok(Self {
            engine,
            flags,
            gate: build.gate,
            io,
            pool,
            loads: build.loads,
            threads: Mutex::new(build.threads),
            control: Mutex::new(ControlState {
                reconf: None,
                stats: StatsDispatcher::new(),
                energy,
                freq,
                available_frequencies,
                one_core_per_socket,
                start_time: None,
                completion_time: None,
            }),
            topology: config.parallelism.topology,
            mapping,
            max_workers,
            epoch,
            tick: config.supervisor_tick,
        })
    }

    fn initial_workers(config: &RuntimeConfig) -> CoreResult<usize> {
        let available = config.parallelism.available_processors;
        match config.parallelism.topology {
            TopologyKind::SingleFarm => {
                let available = available
                    .unwrap_or_else(|| CpuTopology::detect().num_real_cores());
                if available < 3 {
                    return Err(CoreError::InvalidParameter(
                        "single farm needs at least 3 processors".into(),
                    ));
                }
                Ok(available - 2)
            }
            TopologyKind::DoubleFarm => {
                let l34 = config.parallelism.l34_workers;
                let l7 = config.parallelism.l7_workers;
                if l34 == 0 || l7 == 0 {
                    return Err(CoreError::InvalidParameter(
                        "double farm worker counts must be > 0".into(),
                    ));
                }
                let available = available
                    .unwrap_or_else(|| CpuTopology::detect().num_real_cores());
                if available < 6 || available < l34 + l7 + 4 {
                    return Err(CoreError::InvalidParameter(
                        "double farm needs at least 6 processors and room for both farms".into(),
                    ));
                }
                Ok(l7)
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Install the packet source and result sink. Must precede `run`.
    pub fn set_read_and_process_callbacks(
        &self,
        source: Box<dyn PacketSource>,
        sink: Box<dyn ResultSink>,
    ) -> CoreResult<()> {
        if self.flags.running.load(Ordering::Acquire) {
            return Err(CoreError::InvalidState("callbacks must be set before run".into()));
        }
        *self.io.source.lock() = Some(source);
        *self.io.sink.lock() = Some(sink);
        Ok(())
    }

    /// Resume the warmed pipeline; the emitter starts pulling packets
    pub fn run(&self) -> CoreResult<()> {
        let mut control = self.control.lock();
        if !self.io.is_ready() {
            return Err(CoreError::InvalidState("callbacks not set".into()));
        }
        if self.flags.running.load(Ordering::Acquire) {
            return Err(CoreError::InvalidState("already running".into()));
        }
        if self.flags.terminating() {
            return Err(CoreError::InvalidState("already terminated".into()));
        }
        control.start_time = Some(Instant::now());
        self.flags.running.store(true, Ordering::Release);
        self.unfreeze_locked();
        tracing::info!("pipeline running");
        Ok(())
    }

    /// Host the supervisor until end of stream, then wait for the drain.
    ///
    /// Ticks once per configured interval: takes a load sample every
    /// `sampling_interval` ticks, evaluates the reconfiguration policies,
    /// and fires the stats callback every `collection_interval` ticks.
    pub fn wait_end(&self) {
        let mut waited: u64 = 0;
        let mut last_energy = self.control.lock().energy.read();

        while !self.flags.terminating() {
            std::thread::sleep(self.tick);
            waited += 1;
            let mut control = self.control.lock();

            let sampling_due = control
                .reconf
                .as_ref()
                .map(|c| waited % c.params.sampling_interval as u64 == 0)
                .unwrap_or(false);
            if sampling_due {
                self.store_sample_locked(&mut control);
                self.apply_policies_locked(&mut control);
            }

            let interval = control.stats.collection_interval as u64;
            if control.stats.callback.is_some() && interval > 0 && waited % interval == 0 {
                let now = control.energy.read();
                let sample = control.energy.diff(&now, &last_energy);
                last_energy = now;
                self.dispatch_stats_locked(&mut control, &sample);
            }
        }

        self.gate.wait_all_done();
        let mut control = self.control.lock();
        control.completion_time = control.start_time.map(|s| s.elapsed());
        self.flags.running.store(false, Ordering::Release);
        tracing::info!(completion = ?control.completion_time, "pipeline drained");
    }

    /// Join every stage thread and release resources. Idempotent.
    pub fn terminate(&self) {
        let mut threads = self.threads.lock();
        if threads.is_empty() {
            return;
        }
        self.flags.terminating.store(true, Ordering::Release);
        self.gate.resume_all();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        self.flags.running.store(false, Ordering::Release);
        tracing::info!("pipeline terminated");
    }

    /// Execution summary
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            completion_time: self.control.lock().completion_time,
            tasks_per_worker: self.loads.iter().map(|l| l.tasks_processed()).collect(),
            active_workers: self.flags.active_workers(),
        }
    }

    // ------------------------------------------------------------------
    // Freeze protocol
    // ------------------------------------------------------------------

    /// Quiesce the pipeline: stop input, drain every stage, park them.
    /// No-op unless running and not already frozen.
    pub fn freeze(&self) {
        let _control = self.control.lock();
        self.freeze_locked();
    }

    /// Whether the pipeline is currently quiesced
    pub fn is_frozen(&self) -> bool {
        self.flags.frozen()
    }

    /// Resume a frozen pipeline. No-op unless running, frozen and not
    /// terminating.
    pub fn unfreeze(&self) {
        let _control = self.control.lock();
        self.unfreeze_locked();
    }

    fn freeze_locked(&self) {
        if !self.flags.running.load(Ordering::Acquire) || self.flags.frozen() {
            return;
        }
        tracing::debug!("freezing pipeline");
        self.flags.freeze.store(true, Ordering::Release);
        self.gate.wait_all_quiet();
        tracing::debug!("pipeline frozen");
    }

    fn unfreeze_locked(&self) {
        if !self.flags.running.load(Ordering::Acquire)
            || !self.flags.frozen()
            || self.flags.terminating()
        {
            return;
        }
        self.flags.freeze.store(false, Ordering::Release);
        self.gate.resume_all();
        tracing::debug!("pipeline resumed");
    }

    /// Freeze, run `f`, unfreeze; the state-update lock spans the whole call
    fn with_frozen<T>(&self, f: impl FnOnce(&mut ControlState) -> CoreResult<T>) -> CoreResult<T> {
        let mut control = self.control.lock();
        self.freeze_locked();
        let result = f(&mut control);
        self.unfreeze_locked();
        result
    }

    // ------------------------------------------------------------------
    // Worker-count and reconfiguration control
    // ------------------------------------------------------------------

    /// Current active worker count
    pub fn num_workers(&self) -> usize {
        self.flags.active_workers()
    }

    /// Resize the L7 worker pool, repartitioning the flow tables.
    /// Single-farm only.
    pub fn set_num_workers(&self, num_workers: usize) -> CoreResult<()> {
        let mut control = self.control.lock();
        if self.topology != TopologyKind::SingleFarm {
            return Err(CoreError::TopologyViolation(
                "set_num_workers requires the single-farm topology".into(),
            ));
        }
        if num_workers == self.flags.active_workers() {
            return Ok(());
        }
        if num_workers < 1 || num_workers > self.max_workers {
            return Err(CoreError::InvalidParameter(format!(
                "num_workers must be in [1, {}]",
                self.max_workers
            )));
        }
        self.freeze_locked();
        let result = self.resize_locked(&mut control, num_workers);
        self.unfreeze_locked();
        result
    }

    /// Worker change under an already-held freeze
    fn resize_locked(&self, control: &mut ControlState, num_workers: usize) -> CoreResult<()> {
        self.engine.repartition(num_workers)?;
        self.flags.active_workers.store(num_workers, Ordering::Release);
        let migrate = control
            .reconf
            .as_ref()
            .map(|c| c.params.migrate_collector)
            .unwrap_or(false);
        if migrate {
            let core = self.mapping[(num_workers + 1) % self.mapping.len()];
            self.flags.collector_core.store(core, Ordering::Release);
        }
        tracing::info!(workers = num_workers, "worker pool resized");
        Ok(())
    }

    /// Install the control-loop parameters. Single-farm only.
    pub fn reconfiguration_set_parameters(
        &self,
        params: ReconfigurationParams,
    ) -> CoreResult<()> {
        if self.topology != TopologyKind::SingleFarm {
            return Err(CoreError::TopologyViolation(
                "reconfiguration requires the single-farm topology".into(),
            ));
        }
        params.validate()?;
        let mut control = self.control.lock();

        let controller = ReconfController::new(
            params.clone(),
            self.max_workers,
            control.available_frequencies.clone(),
        );
        self.setup_frequencies_locked(&mut control, &controller);
        control.reconf = Some(controller);
        Ok(())
    }

    /// Replace the load predictor used by the candidate search
    pub fn set_load_predictor(
        &self,
        predictor: Box<dyn crate::reconf::LoadPredictor>,
    ) -> CoreResult<()> {
        let mut control = self.control.lock();
        match control.reconf.as_mut() {
            Some(reconf) => {
                reconf.predictor = predictor;
                Ok(())
            }
            None => Err(CoreError::InvalidState(
                "reconfiguration parameters not installed".into(),
            )),
        }
    }

    /// Governor installation, bounds and starting frequency per strategy
    fn setup_frequencies_locked(&self, control: &mut ControlState, reconf: &ReconfController) {
        let params = &reconf.params;
        if params.freq_type == FrequencyMode::No || control.available_frequencies.is_empty() {
            return;
        }
        let min = control.available_frequencies[0];
        let max = control.available_frequencies[control.available_frequencies.len() - 1];

        let governor = match params.freq_strategy {
            FrequencyStrategy::GovernorOnDemand => Governor::OnDemand,
            FrequencyStrategy::GovernorConservative => Governor::Conservative,
            FrequencyStrategy::GovernorPerformance => Governor::Performance,
            _ => Governor::Userspace,
        };
        for &core in &self.mapping {
            if let Err(err) = control.freq.set_governor(core, governor) {
                tracing::warn!(core, %err, "governor installation failed");
            }
            if let Err(err) = control.freq.set_bounds(core, min, max) {
                tracing::warn!(core, %err, "frequency bounds installation failed");
            }
        }

        if params.freq_strategy.governor_pinned() {
            return;
        }
        let starting = reconf.current_frequency();
        match params.freq_type {
            FrequencyMode::Single => {
                let workers: Vec<usize> = (1..=self.max_workers)
                    .map(|s| self.mapping[s % self.mapping.len()])
                    .collect();
                let _ = control.freq.set_frequency(&workers, starting);
                // Emitter and collector always run at the top frequency.
                let _ = control.freq.set_frequency(&[self.mapping[0]], max);
                let collector = self.flags.collector_core.load(Ordering::Acquire);
                let _ = control.freq.set_frequency(&[collector], max);
            }
            FrequencyMode::Global => {
                let representatives = control.one_core_per_socket.clone();
                let _ = control.freq.set_frequency(&representatives, starting);
            }
            FrequencyMode::No => {}
        }
    }

    /// Apply a new frequency index chosen by the candidate search
    fn update_frequencies_locked(&self, control: &mut ControlState, frequency_idx: usize) {
        let Some(reconf) = control.reconf.as_mut() else { return };
        if reconf.params.freq_type == FrequencyMode::No
            || frequency_idx == reconf.current_frequency_idx
        {
            return;
        }
        reconf.current_frequency_idx = frequency_idx;
        let khz = reconf.current_frequency();
        let freq_type = reconf.params.freq_type;
        let migrate = reconf.params.migrate_collector;
        let max = control.available_frequencies.last().copied().unwrap_or(khz);

        match freq_type {
            FrequencyMode::Single => {
                let active = self.flags.active_workers();
                let workers: Vec<usize> = (1..=active)
                    .map(|s| self.mapping[s % self.mapping.len()])
                    .collect();
                let _ = control.freq.set_frequency(&workers, khz);
                if migrate {
                    let collector = self.flags.collector_core.load(Ordering::Acquire);
                    let _ = control.freq.set_frequency(&[collector], max);
                }
            }
            FrequencyMode::Global => {
                let representatives = control.one_core_per_socket.clone();
                let _ = control.freq.set_frequency(&representatives, khz);
            }
            FrequencyMode::No => {}
        }
        tracing::info!(khz, "worker frequency updated");
    }

    /// Instantaneous per-worker load, `[0, 100]` each. Single-farm only.
    pub fn workers_instantaneous_load(&self) -> CoreResult<Vec<f64>> {
        if self.topology != TopologyKind::SingleFarm {
            return Err(CoreError::TopologyViolation(
                "per-worker load requires the single-farm topology".into(),
            ));
        }
        let now = self.epoch.elapsed().as_nanos() as u64;
        let active = self.flags.active_workers();
        Ok(self.loads[..active]
            .iter()
            .map(|l| l.worktime_percentage(now))
            .collect())
    }

    fn store_sample_locked(&self, control: &mut ControlState) {
        let active = self.flags.active_workers();
        let Some(reconf) = control.reconf.as_mut() else { return };
        let now = self.epoch.elapsed().as_nanos() as u64;
        let loads: Vec<f64> = self.loads[..active]
            .iter()
            .map(|l| {
                let pct = l.worktime_percentage(now);
                l.reset_worktime(now);
                pct
            })
            .collect();
        reconf.store_sample(&loads);
    }

    fn apply_policies_locked(&self, control: &mut ControlState) {
        let active = self.flags.active_workers();
        let (next_workers, next_frequency) = {
            let Some(reconf) = control.reconf.as_mut() else { return };
            if !reconf.evaluate(active) {
                return;
            }
            reconf.best_feasible(active)
        };

        tracing::info!(
            from = active,
            to = next_workers,
            frequency_idx = next_frequency,
            "reconfiguring"
        );
        self.freeze_locked();
        if next_workers != active {
            if let Err(err) = self.resize_locked(control, next_workers) {
                tracing::warn!(%err, "worker resize rejected");
            }
        }
        self.update_frequencies_locked(control, next_frequency);
        self.unfreeze_locked();

        if let Some(reconf) = control.reconf.as_mut() {
            reconf.reset_window();
        }
    }

    fn dispatch_stats_locked(&self, control: &mut ControlState, sample: &EnergySample) {
        let interval_secs = control.stats.collection_interval as f64 * self.tick.as_secs_f64();
        let energy = StatsDispatcher::energy_report(sample, &control.stats.idle, interval_secs);
        let frequency_khz = match control.reconf.as_ref() {
            Some(reconf) if !control.available_frequencies.is_empty() => reconf.current_frequency(),
            _ => control.available_frequencies.first().copied().unwrap_or(0),
        };
        let snapshot = StatsSnapshot {
            num_workers: self.flags.active_workers(),
            frequency_khz,
            energy,
            system_load_pct: control.reconf.as_ref().map(|r| r.system_load).unwrap_or(0.0),
        };
        control.stats.dispatch(&snapshot);
    }

    // ------------------------------------------------------------------
    // Statistics and energy accounting
    // ------------------------------------------------------------------

    /// Install the periodic stats callback.
    ///
    /// `collection_interval` counts supervisor ticks and must stay under
    /// the energy counters' wrapping interval.
    pub fn set_stats_collection_callback(
        &self,
        collection_interval: u32,
        callback: StatsCallback,
    ) -> CoreResult<()> {
        if collection_interval == 0 {
            return Err(CoreError::InvalidParameter(
                "collection interval must be > 0".into(),
            ));
        }
        let mut control = self.control.lock();
        if control.energy.is_enabled() {
            let interval_secs = collection_interval as f64 * self.tick.as_secs_f64();
            let wrap = control.energy.wrapping_interval_secs() as f64;
            if interval_secs >= wrap {
                return Err(CoreError::InvalidParameter(format!(
                    "collection interval must stay under the {wrap}s counter wrap",
                )));
            }
        }
        control.stats.collection_interval = collection_interval;
        control.stats.callback = Some(callback);
        Ok(())
    }

    /// Raw energy counter snapshot (framework-internal values; feed to
    /// [`Self::energy_counters_diff`])
    pub fn energy_counters_read(&self) -> RawSnapshot {
        self.control.lock().energy.read()
    }

    /// Joules consumed between two snapshots
    pub fn energy_counters_diff(&self, after: &RawSnapshot, before: &RawSnapshot) -> EnergySample {
        self.control.lock().energy.diff(after, before)
    }

    /// Maximum seconds between counter reads before a wrap is ambiguous
    pub fn energy_wrapping_interval_secs(&self) -> u32 {
        self.control.lock().energy.wrapping_interval_secs()
    }

    /// Measure the machine's idle draw over `duration` and install it as
    /// the baseline the stats dispatcher subtracts. Blocking; call before
    /// `run`.
    pub fn measure_idle_baseline(&self, duration: Duration) -> CoreResult<IdleWatts> {
        if self.flags.running.load(Ordering::Acquire) {
            return Err(CoreError::InvalidState(
                "baseline must be measured before run".into(),
            ));
        }
        let mut control = self.control.lock();
        if !control.energy.is_enabled() {
            return Ok(IdleWatts::default());
        }
        let before = control.energy.read();
        std::thread::sleep(duration);
        let after = control.energy.read();
        let sample = control.energy.diff(&after, &before);
        let secs = duration.as_secs_f64().max(f64::EPSILON);
        let idle = IdleWatts {
            socket: EnergySample::total(&sample.joules_socket) / secs,
            cores: EnergySample::total(&sample.joules_cores) / secs,
            offcores: EnergySample::total(&sample.joules_offcores) / secs,
            dram: EnergySample::total(&sample.joules_dram) / secs,
        };
        control.stats.idle = idle;
        Ok(idle)
    }

    /// Override the idle baseline directly
    pub fn set_idle_baseline(&self, idle: IdleWatts) {
        self.control.lock().stats.idle = idle;
    }

    // ------------------------------------------------------------------
    // Freeze-protected engine delegation
    // ------------------------------------------------------------------

    fn engine_directive(&self, directive: EngineDirective) -> CoreResult<()> {
        self.with_frozen(|_| self.engine.configure(directive))
    }

    /// Cap protocol-guess attempts per flow
    pub fn set_max_trials(&self, max_trials: u16) -> CoreResult<()> {
        self.engine_directive(EngineDirective::SetMaxTrials(max_trials))
    }

    /// Enable IPv4 defragmentation
    pub fn ipv4_fragmentation_enable(&self, table_size: u16) -> CoreResult<()> {
        self.engine_directive(EngineDirective::Ipv4FragmentationEnable { table_size })
    }

    /// Enable IPv6 defragmentation
    pub fn ipv6_fragmentation_enable(&self, table_size: u16) -> CoreResult<()> {
        self.engine_directive(EngineDirective::Ipv6FragmentationEnable { table_size })
    }

    /// Disable IPv4 defragmentation
    pub fn ipv4_fragmentation_disable(&self) -> CoreResult<()> {
        self.engine_directive(EngineDirective::Ipv4FragmentationDisable)
    }

    /// Disable IPv6 defragmentation
    pub fn ipv6_fragmentation_disable(&self) -> CoreResult<()> {
        self.engine_directive(EngineDirective::Ipv6FragmentationDisable)
    }

    /// Per-host IPv4 reassembly memory cap
    pub fn ipv4_fragmentation_set_per_host_memory_limit(&self, limit: u32) -> CoreResult<()> {
        self.engine_directive(EngineDirective::Ipv4FragmentationPerHostLimit(limit))
    }

    /// Per-host IPv6 reassembly memory cap
    pub fn ipv6_fragmentation_set_per_host_memory_limit(&self, limit: u32) -> CoreResult<()> {
        self.engine_directive(EngineDirective::Ipv6FragmentationPerHostLimit(limit))
    }

    /// Total IPv4 reassembly memory cap
    pub fn ipv4_fragmentation_set_total_memory_limit(&self, limit: u32) -> CoreResult<()> {
        self.engine_directive(EngineDirective::Ipv4FragmentationTotalLimit(limit))
    }

    /// Total IPv6 reassembly memory cap
    pub fn ipv6_fragmentation_set_total_memory_limit(&self, limit: u32) -> CoreResult<()> {
        self.engine_directive(EngineDirective::Ipv6FragmentationTotalLimit(limit))
    }

    /// IPv4 reassembly timeout
    pub fn ipv4_fragmentation_set_reassembly_timeout(&self, seconds: u8) -> CoreResult<()> {
        self.engine_directive(EngineDirective::Ipv4FragmentationReassemblyTimeout(seconds))
    }

    /// IPv6 reassembly timeout
    pub fn ipv6_fragmentation_set_reassembly_timeout(&self, seconds: u8) -> CoreResult<()> {
        self.engine_directive(EngineDirective::Ipv6FragmentationReassemblyTimeout(seconds))
    }

    /// Reorder out-of-order TCP segments before inspection (default on)
    pub fn tcp_reordering_enable(&self) -> CoreResult<()> {
        self.engine_directive(EngineDirective::TcpReorderingEnable)
    }

    /// Deliver TCP segments as they arrive
    pub fn tcp_reordering_disable(&self) -> CoreResult<()> {
        self.engine_directive(EngineDirective::TcpReorderingDisable)
    }

    /// Enable one protocol inspector
    pub fn protocol_enable(&self, protocol: crate::engine::AppProtocol) -> CoreResult<()> {
        self.engine_directive(EngineDirective::ProtocolEnable(protocol))
    }

    /// Disable one protocol inspector
    pub fn protocol_disable(&self, protocol: crate::engine::AppProtocol) -> CoreResult<()> {
        self.engine_directive(EngineDirective::ProtocolDisable(protocol))
    }

    /// Enable every protocol inspector
    pub fn inspect_all(&self) -> CoreResult<()> {
        self.engine_directive(EngineDirective::InspectAll)
    }

    /// Disable every protocol inspector
    pub fn inspect_nothing(&self) -> CoreResult<()> {
        self.engine_directive(EngineDirective::InspectNothing)
    }

    /// Install the flow cleaner invoked when flows are discarded
    pub fn set_flow_cleaner_callback(&self, cleaner: Option<FlowCleaner>) -> CoreResult<()> {
        self.with_frozen(|_| self.engine.set_flow_cleaner(cleaner))
    }

    /// Activate HTTP inspection callbacks
    pub fn http_activate_callbacks(&self, callbacks: HttpCallbacks) -> CoreResult<()> {
        self.with_frozen(|_| self.engine.http_activate_callbacks(callbacks))
    }

    /// Deactivate HTTP inspection callbacks
    pub fn http_disable_callbacks(&self) -> CoreResult<()> {
        self.with_frozen(|_| self.engine.http_disable_callbacks())
    }
}

impl Drop for DpiRuntime {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::farm::SchedulingMode;
    use crate::io::{Delivery, Packet};
    use bytes::Bytes;
    use dpi_power::{MockCounters, RawSocketCounters, StaticFrequencyControl};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn tcp_v4(src: u32, dst: u32, src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x45;
        pkt[9] = 6;
        pkt[12..16].copy_from_slice(&src.to_be_bytes());
        pkt[16..20].copy_from_slice(&dst.to_be_bytes());
        pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
        pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
        pkt[32] = 5 << 4;
        pkt
    }

    /// Driver context object: owns its packet list and cursor
    struct VecSource {
        packets: Vec<Packet>,
        next: usize,
    }

    impl VecSource {
        fn interleaved_flows(flows: usize, per_flow: usize) -> Self {
            let mut packets = Vec::new();
            for i in 0..per_flow {
                for flow in 0..flows {
                    let pkt = tcp_v4(0x0a000001 + flow as u32, 0xc0a80101, 10000 + flow as u16, 443);
                    packets.push(Packet {
                        data: Bytes::from(pkt),
                        timestamp: i as u32,
                        user_tag: (flow * 1_000_000 + i) as u64,
                    });
                }
            }
            Self { packets, next: 0 }
        }
    }

    impl PacketSource for VecSource {
        fn next_packet(&mut self) -> Option<Packet> {
            let packet = self.packets.get(self.next).cloned();
            self.next += 1;
            packet
        }
    }

    struct VecSink {
        delivered: Arc<parking_lot::Mutex<Vec<u64>>>,
    }

    impl ResultSink for VecSink {
        fn deliver(&mut self, delivery: Delivery<'_>) {
            self.delivered.lock().push(delivery.user_tag);
        }
    }

    fn test_runtime(parallelism: ParallelismConfig) -> DpiRuntime {
        let config = RuntimeConfig {
            parallelism,
            supervisor_tick: Duration::from_millis(5),
            ..RuntimeConfig::default()
        };
        let initial = DpiRuntime::initial_workers(&config).unwrap();
        let engine: Arc<dyn InspectionEngine> =
            Arc::new(PortClassifierEngine::new(EngineLimits::default(), initial));
        DpiRuntime::init_with(
            config,
            engine,
            EnergyCounters::disabled(),
            Box::new(StaticFrequencyControl::new(vec![1_000_000, 2_000_000])),
        )
        .unwrap()
    }

    fn single_farm(processors: usize) -> ParallelismConfig {
        ParallelismConfig {
            available_processors: Some(processors),
            ..ParallelismConfig::default()
        }
    }

    fn assert_per_flow_order(delivered: &[u64], flows: usize, per_flow: usize) {
        let mut seen: HashMap<u64, u64> = HashMap::new();
        for tag in delivered {
            let flow = tag / 1_000_000;
            let seq = tag % 1_000_000;
            if let Some(prev) = seen.insert(flow, seq) {
                assert!(prev < seq, "flow {flow} reordered: {prev} then {seq}");
            }
        }
        assert_eq!(delivered.len(), flows * per_flow);
    }

    #[test]
    fn test_init_leaves_warmed_frozen_state() {
        let rt = test_runtime(single_farm(4));
        assert!(rt.is_frozen());
        assert_eq!(rt.num_workers(), 2);
        // freeze/unfreeze are no-ops before run.
        rt.freeze();
        rt.unfreeze();
        assert!(rt.is_frozen());
        // run without callbacks is rejected.
        assert!(matches!(rt.run(), Err(CoreError::InvalidState(_))));
        rt.terminate();
    }

    #[test]
    fn test_end_to_end_delivery_preserves_flow_order() {
        let rt = test_runtime(single_farm(4));
        let delivered = Arc::new(parking_lot::Mutex::new(Vec::new()));
        rt.set_read_and_process_callbacks(
            Box::new(VecSource::interleaved_flows(4, 25)),
            Box::new(VecSink {
                delivered: delivered.clone(),
            }),
        )
        .unwrap();

        rt.run().unwrap();
        rt.wait_end();
        rt.terminate();

        assert_per_flow_order(&delivered.lock(), 4, 25);
        let stats = rt.stats();
        assert!(stats.completion_time.is_some());
        assert_eq!(stats.tasks_per_worker.iter().sum::<u64>(), 100);
    }

    #[test]
    fn test_freeze_protected_mutation_during_traffic() {
        let rt = Arc::new(test_runtime(single_farm(4)));
        let delivered = Arc::new(parking_lot::Mutex::new(Vec::new()));
        rt.set_read_and_process_callbacks(
            Box::new(VecSource::interleaved_flows(3, 200)),
            Box::new(VecSink {
                delivered: delivered.clone(),
            }),
        )
        .unwrap();
        rt.run().unwrap();

        // Mutate live from another thread while packets are in flight.
        let mutator = {
            let rt = rt.clone();
            std::thread::spawn(move || {
                rt.ipv4_fragmentation_enable(1024).unwrap();
                rt.set_max_trials(16).unwrap();
                rt.tcp_reordering_disable().unwrap();
                rt.tcp_reordering_enable().unwrap();
            })
        };

        rt.wait_end();
        mutator.join().unwrap();
        rt.terminate();

        // Nothing dropped, nothing reordered within a flow.
        assert_per_flow_order(&delivered.lock(), 3, 200);
        assert!(!rt.is_frozen() || rt.stats().completion_time.is_some());
    }

    #[test]
    fn test_set_num_workers_bounds_and_idempotence() {
        let rt = test_runtime(single_farm(5)); // max 3 workers
        assert_eq!(rt.num_workers(), 3);

        assert!(rt.set_num_workers(0).is_err());
        assert!(rt.set_num_workers(4).is_err());
        rt.set_num_workers(3).unwrap(); // same count: no-op success
        rt.set_num_workers(2).unwrap();
        assert_eq!(rt.num_workers(), 2);
        rt.set_num_workers(2).unwrap();
        assert_eq!(rt.num_workers(), 2);
        rt.set_num_workers(3).unwrap(); // exact maximum succeeds
        rt.terminate();
    }

    #[test]
    fn test_live_resize_keeps_flow_order() {
        let rt = Arc::new(test_runtime(single_farm(5)));
        let delivered = Arc::new(parking_lot::Mutex::new(Vec::new()));
        rt.set_read_and_process_callbacks(
            Box::new(VecSource::interleaved_flows(5, 120)),
            Box::new(VecSink {
                delivered: delivered.clone(),
            }),
        )
        .unwrap();
        rt.run().unwrap();

        let resizer = {
            let rt = rt.clone();
            std::thread::spawn(move || {
                rt.set_num_workers(1).unwrap();
                rt.set_num_workers(3).unwrap();
            })
        };

        rt.wait_end();
        resizer.join().unwrap();
        rt.terminate();
        assert_per_flow_order(&delivered.lock(), 5, 120);
    }

    #[test]
    fn test_double_farm_rejects_resizing_and_delivers() {
        for scheduling in [SchedulingMode::Default, SchedulingMode::Ordered, SchedulingMode::OnDemand] {
            let rt = test_runtime(ParallelismConfig {
                available_processors: Some(8),
                topology: TopologyKind::DoubleFarm,
                l34_workers: 2,
                l7_workers: 2,
                scheduling,
                ..ParallelismConfig::default()
            });

            assert!(matches!(
                rt.set_num_workers(1),
                Err(CoreError::TopologyViolation(_))
            ));
            assert!(matches!(
                rt.reconfiguration_set_parameters(ReconfigurationParams::default()),
                Err(CoreError::TopologyViolation(_))
            ));
            assert!(rt.workers_instantaneous_load().is_err());

            let delivered = Arc::new(parking_lot::Mutex::new(Vec::new()));
            rt.set_read_and_process_callbacks(
                Box::new(VecSource::interleaved_flows(4, 50)),
                Box::new(VecSink {
                    delivered: delivered.clone(),
                }),
            )
            .unwrap();
            rt.run().unwrap();
            rt.wait_end();
            rt.terminate();

            // Ingress order through the first farm is only restored in
            // ordered mode; the other modes still deliver everything.
            if scheduling == SchedulingMode::Ordered {
                assert_per_flow_order(&delivered.lock(), 4, 50);
            } else {
                assert_eq!(delivered.lock().len(), 200);
            }
        }
    }

    #[test]
    fn test_stats_interval_validated_against_wrap() {
        let config = RuntimeConfig {
            parallelism: single_farm(4),
            ..RuntimeConfig::default()
        };
        let engine: Arc<dyn InspectionEngine> =
            Arc::new(PortClassifierEngine::new(EngineLimits::default(), 2));
        // 1 J per unit, 2^32/64 W bound: the counters wrap every 64 s.
        let watts = 2f64.powi(32) / 64.0;
        let energy = EnergyCounters::new(Box::new(MockCounters::new(
            vec![vec![RawSocketCounters::default()]],
            1.0,
            watts,
        )));
        let rt = DpiRuntime::init_with(
            config,
            engine,
            energy,
            Box::new(NullFrequencyControl),
        )
        .unwrap();

        assert_eq!(rt.energy_wrapping_interval_secs(), 64);
        assert!(rt
            .set_stats_collection_callback(64, Box::new(|_| {}))
            .is_err());
        assert!(rt
            .set_stats_collection_callback(63, Box::new(|_| {}))
            .is_ok());
        assert!(rt.set_stats_collection_callback(0, Box::new(|_| {})).is_err());
        rt.terminate();
    }

    #[test]
    fn test_stats_callback_fires_with_zeroed_energy_when_disabled() {
        let rt = test_runtime(single_farm(4));
        let snapshots = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = snapshots.clone();
        rt.set_stats_collection_callback(
            1,
            Box::new(move |s: &StatsSnapshot| sink.lock().push(s.clone())),
        )
        .unwrap();

        // Enough packets to keep the pipeline alive across a few ticks.
        let delivered = Arc::new(parking_lot::Mutex::new(Vec::new()));
        rt.set_read_and_process_callbacks(
            Box::new(VecSource::interleaved_flows(2, 3000)),
            Box::new(VecSink {
                delivered: delivered.clone(),
            }),
        )
        .unwrap();
        rt.run().unwrap();
        rt.wait_end();
        rt.terminate();

        let snapshots = snapshots.lock();
        for snapshot in snapshots.iter() {
            assert_eq!(snapshot.energy.socket, 0.0);
            assert_eq!(snapshot.num_workers, 2);
            assert!((0.0..=100.0).contains(&snapshot.system_load_pct));
        }
    }

    #[test]
    fn test_supervisor_samples_and_survives_reconf_params() {
        let rt = test_runtime(single_farm(4));
        rt.reconfiguration_set_parameters(ReconfigurationParams {
            num_samples: 2,
            sampling_interval: 1,
            stabilization_period: 0,
            ..ReconfigurationParams::default()
        })
        .unwrap();

        let delivered = Arc::new(parking_lot::Mutex::new(Vec::new()));
        rt.set_read_and_process_callbacks(
            Box::new(VecSource::interleaved_flows(2, 4000)),
            Box::new(VecSink {
                delivered: delivered.clone(),
            }),
        )
        .unwrap();
        rt.run().unwrap();
        rt.wait_end();
        rt.terminate();
        assert_eq!(delivered.lock().len(), 8000);
    }

    /// Engine wrapper counting configuration traffic
    struct CountingEngine {
        inner: PortClassifierEngine,
        configures: Arc<std::sync::atomic::AtomicUsize>,
        repartitions: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl InspectionEngine for CountingEngine {
        fn prepare(&self, packet: &[u8], timestamp: u32) -> Option<crate::engine::PreparedPacket> {
            self.inner.prepare(packet, timestamp)
        }

        fn classify(
            &self,
            partition: usize,
            prepared: &crate::engine::PreparedPacket,
            packet: &[u8],
            timestamp: u32,
        ) -> crate::engine::Classification {
            self.inner.classify(partition, prepared, packet, timestamp)
        }

        fn repartition(&self, partitions: usize) -> CoreResult<()> {
            self.repartitions.fetch_add(1, Ordering::SeqCst);
            self.inner.repartition(partitions)
        }

        fn configure(&self, directive: EngineDirective) -> CoreResult<()> {
            self.configures.fetch_add(1, Ordering::SeqCst);
            self.inner.configure(directive)
        }

        fn set_flow_cleaner(&self, cleaner: Option<FlowCleaner>) -> CoreResult<()> {
            self.inner.set_flow_cleaner(cleaner)
        }

        fn http_activate_callbacks(&self, callbacks: HttpCallbacks) -> CoreResult<()> {
            self.inner.http_activate_callbacks(callbacks)
        }

        fn http_disable_callbacks(&self) -> CoreResult<()> {
            self.inner.http_disable_callbacks()
        }
    }

    #[test]
    fn test_each_mutator_delegates_exactly_once() {
        let configures = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let repartitions = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let engine = Arc::new(CountingEngine {
            inner: PortClassifierEngine::new(EngineLimits::default(), 2),
            configures: configures.clone(),
            repartitions: repartitions.clone(),
        });
        let config = RuntimeConfig {
            parallelism: single_farm(4),
            supervisor_tick: Duration::from_millis(5),
            ..RuntimeConfig::default()
        };
        let rt = DpiRuntime::init_with(
            config,
            engine,
            EnergyCounters::disabled(),
            Box::new(NullFrequencyControl),
        )
        .unwrap();
        assert_eq!(repartitions.load(Ordering::SeqCst), 1); // init partitioning

        rt.set_max_trials(4).unwrap();
        rt.ipv4_fragmentation_enable(256).unwrap();
        rt.ipv4_fragmentation_set_reassembly_timeout(30).unwrap();
        rt.tcp_reordering_disable().unwrap();
        assert_eq!(configures.load(Ordering::SeqCst), 4);

        // A rejected directive still reaches the engine exactly once.
        assert!(rt.ipv6_fragmentation_set_total_memory_limit(1024).is_err());
        assert_eq!(configures.load(Ordering::SeqCst), 5);

        rt.set_num_workers(1).unwrap();
        assert_eq!(repartitions.load(Ordering::SeqCst), 2);
        rt.terminate();
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let rt = test_runtime(single_farm(4));
        rt.terminate();
        rt.terminate();
        assert!(!rt.flags.running.load(Ordering::Acquire));
    }

    #[test]
    fn test_predictor_requires_installed_params() {
        let rt = test_runtime(single_farm(4));
        assert!(rt
            .set_load_predictor(Box::new(crate::reconf::LinearCapacityPredictor))
            .is_err());
        rt.reconfiguration_set_parameters(ReconfigurationParams::default()).unwrap();
        assert!(rt
            .set_load_predictor(Box::new(crate::reconf::LinearCapacityPredictor))
            .is_ok());
        rt.terminate();
    }

    /// Frequency control that shares its write log with the test
    struct RecordingFreq {
        frequencies: Vec<u64>,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl FrequencyControl for RecordingFreq {
        fn available_frequencies(&self) -> &[u64] {
            &self.frequencies
        }

        fn set_frequency(&mut self, cores: &[usize], khz: u64) -> CoreResult<()> {
            self.log.lock().push(format!("freq {cores:?} {khz}"));
            Ok(())
        }

        fn set_governor(&mut self, core: usize, governor: Governor) -> CoreResult<()> {
            self.log.lock().push(format!("gov {core} {}", governor.as_str()));
            Ok(())
        }

        fn set_bounds(&mut self, core: usize, min_khz: u64, max_khz: u64) -> CoreResult<()> {
            self.log.lock().push(format!("bounds {core} {min_khz}-{max_khz}"));
            Ok(())
        }
    }

    #[test]
    fn test_frequency_setup_writes_governor_and_bounds() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let config = RuntimeConfig {
            parallelism: ParallelismConfig {
                available_processors: Some(4),
                mapping: Some(vec![0, 1, 2, 3]),
                ..ParallelismConfig::default()
            },
            supervisor_tick: Duration::from_millis(5),
            ..RuntimeConfig::default()
        };
        let engine: Arc<dyn InspectionEngine> =
            Arc::new(PortClassifierEngine::new(EngineLimits::default(), 2));
        let rt = DpiRuntime::init_with(
            config,
            engine,
            EnergyCounters::disabled(),
            Box::new(RecordingFreq {
                frequencies: vec![1_000_000, 1_500_000, 2_500_000],
                log: log.clone(),
            }),
        )
        .unwrap();

        rt.reconfiguration_set_parameters(ReconfigurationParams {
            freq_type: FrequencyMode::Single,
            freq_strategy: FrequencyStrategy::PowerConservative,
            ..ReconfigurationParams::default()
        })
        .unwrap();
        rt.terminate();

        let log = log.lock();
        // Userspace governor and full bounds on every mapped core.
        for core in 0..4 {
            assert!(log.contains(&format!("gov {core} userspace")));
            assert!(log.contains(&format!("bounds {core} 1000000-2500000")));
        }
        // Power-conservative starts the workers at the lowest frequency,
        // with the emitter and collector cores pinned to the top one.
        assert!(log.contains(&"freq [1, 2] 1000000".to_string()));
        assert!(log.contains(&"freq [0] 2500000".to_string()));
        assert!(log.contains(&"freq [3] 2500000".to_string()));
    }
}
