//! Load-driven reconfiguration
//!
//! The controller samples every active worker's busy fraction into a
//! rolling window. When the smoothed system load leaves the configured
//! band it enumerates `(workers, frequency)` candidates, predicts the
//! load each would carry, and picks the best feasible one under the
//! installed strategy. Candidates are classified against the band padded
//! by [`ERROR_PERC`]: inside is feasible, below is a fallback kept only
//! if nothing feasible exists, above is discarded.

use serde::{Deserialize, Serialize};

use dpi_common::{CoreError, CoreResult};

/// How explicit frequency writes are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrequencyMode {
    /// Never write frequencies; the governor owns them
    No,
    /// Per worker core; emitter and collector stay at the maximum
    Single,
    /// One write per socket through a representative core
    Global,
}

/// Strategy for choosing among feasible configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrequencyStrategy {
    /// Fewest workers first; first feasible candidate wins
    CoresConservative,
    /// Minimize the power model over all feasible candidates
    PowerConservative,
    /// Kernel ondemand governor; only the worker count varies
    GovernorOnDemand,
    /// Kernel conservative governor; only the worker count varies
    GovernorConservative,
    /// Performance governor; only the worker count varies
    GovernorPerformance,
}

impl FrequencyStrategy {
    /// Whether the frequency index is pinned by a kernel governor
    pub fn governor_pinned(&self) -> bool {
        matches!(
            self,
            Self::GovernorOnDemand | Self::GovernorConservative | Self::GovernorPerformance
        )
    }
}

/// Control-loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigurationParams {
    /// Rolling window length, in samples (> 0)
    pub num_samples: usize,
    /// Ticks between two samples (> 0)
    pub sampling_interval: u32,
    /// Smoothed system load above which the pool grows
    pub system_load_up_threshold: f64,
    /// Smoothed system load below which the pool shrinks
    pub system_load_down_threshold: f64,
    /// Per-worker up trigger; zero disables it
    pub worker_load_up_threshold: f64,
    /// Per-worker down trigger; zero disables it
    pub worker_load_down_threshold: f64,
    /// Re-pin the collector next to the last worker on shrink
    pub migrate_collector: bool,
    /// Extra samples to wait after a change before reacting again
    pub stabilization_period: usize,
    /// How frequency writes are applied
    pub freq_type: FrequencyMode,
    /// Candidate selection strategy
    pub freq_strategy: FrequencyStrategy,
}

impl Default for ReconfigurationParams {
    fn default() -> Self {
        Self {
            num_samples: 4,
            sampling_interval: 1,
            system_load_up_threshold: 90.0,
            system_load_down_threshold: 80.0,
            worker_load_up_threshold: 0.0,
            worker_load_down_threshold: 0.0,
            migrate_collector: false,
            stabilization_period: 4,
            freq_type: FrequencyMode::No,
            freq_strategy: FrequencyStrategy::CoresConservative,
        }
    }
}

impl ReconfigurationParams {
    /// Range-check the parameter set
    pub fn validate(&self) -> CoreResult<()> {
        if self.num_samples == 0 {
            return Err(CoreError::InvalidParameter("num_samples must be > 0".into()));
        }
        if self.sampling_interval == 0 {
            return Err(CoreError::InvalidParameter("sampling_interval must be > 0".into()));
        }
        let pct = |v: f64| (0.0..=100.0).contains(&v);
        if !pct(self.system_load_up_threshold)
            || !pct(self.system_load_down_threshold)
            || !pct(self.worker_load_up_threshold)
            || !pct(self.worker_load_down_threshold)
        {
            return Err(CoreError::InvalidParameter("thresholds must be percentages".into()));
        }
        if self.system_load_down_threshold >= self.system_load_up_threshold {
            return Err(CoreError::InvalidParameter(
                "system down threshold must be below the up threshold".into(),
            ));
        }
        Ok(())
    }
}

/// One point in the configuration space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPoint {
    /// Active worker count
    pub workers: usize,
    /// Worker frequency in kHz
    pub frequency_khz: u64,
}

/// Predicts the load a candidate configuration would carry
pub trait LoadPredictor: Send {
    /// Predicted load percentage under `candidate`, given the measured
    /// `current_load` under `current`.
    fn predict(&self, current: ConfigPoint, candidate: ConfigPoint, current_load: f64) -> f64;
}

/// Utilization is inversely proportional to service capacity, and
/// capacity scales linearly in `workers × frequency`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearCapacityPredictor;

impl LoadPredictor for LinearCapacityPredictor {
    fn predict(&self, current: ConfigPoint, candidate: ConfigPoint, current_load: f64) -> f64 {
        let current_capacity = current.workers as f64 * current.frequency_khz as f64;
        let candidate_capacity = candidate.workers as f64 * candidate.frequency_khz as f64;
        current_load * current_capacity / candidate_capacity
    }
}

/// Band padding: candidates must clear the thresholds by this margin
pub const ERROR_PERC: f64 = 3.0;

/// Power model used by the power-conservative strategy
#[inline]
pub(crate) fn power_metric(frequency_khz: u64, workers: usize) -> f64 {
    (frequency_khz as f64).powf(1.3) * (workers + 2) as f64
}

/// Sampling state and candidate search
pub(crate) struct ReconfController {
    pub params: ReconfigurationParams,
    /// Available frequencies, ascending; a single pseudo-entry when the
    /// platform exposes none
    pub frequencies: Vec<u64>,
    pub current_frequency_idx: usize,
    pub max_workers: usize,
    pub predictor: Box<dyn LoadPredictor>,
    samples: Vec<Vec<f64>>,
    cursor: usize,
    samples_taken: usize,
    /// Smoothed (window mean) system load
    pub system_load: f64,
    /// Mean of the most recent sample only
    pub instantaneous_load: f64,
    pub last_prediction: f64,
}

impl ReconfController {
    pub fn new(params: ReconfigurationParams, max_workers: usize, frequencies: Vec<u64>) -> Self {
        let frequencies = if frequencies.is_empty() { vec![1] } else { frequencies };
        let current_frequency_idx = match params.freq_strategy {
            FrequencyStrategy::CoresConservative | FrequencyStrategy::GovernorPerformance => {
                frequencies.len() - 1
            }
            FrequencyStrategy::PowerConservative
            | FrequencyStrategy::GovernorConservative
            | FrequencyStrategy::GovernorOnDemand => 0,
        };
        let samples = vec![vec![0.0; params.num_samples]; max_workers];
        Self {
            params,
            frequencies,
            current_frequency_idx,
            max_workers,
            predictor: Box::new(LinearCapacityPredictor),
            samples,
            cursor: 0,
            samples_taken: 0,
            system_load: 0.0,
            instantaneous_load: 0.0,
            last_prediction: 0.0,
        }
    }

    /// Current frequency in kHz
    pub fn current_frequency(&self) -> u64 {
        self.frequencies[self.current_frequency_idx]
    }

    /// Record one busy-fraction sample per active worker
    pub fn store_sample(&mut self, loads: &[f64]) {
        if loads.is_empty() {
            return;
        }
        let mut instantaneous = 0.0;
        for (worker, load) in loads.iter().enumerate() {
            self.samples[worker][self.cursor] = *load;
            instantaneous += load;
        }
        self.cursor = (self.cursor + 1) % self.params.num_samples;
        self.instantaneous_load = instantaneous / loads.len() as f64;
        self.samples_taken += 1;
    }

    /// Window-mean load of one worker
    pub fn worker_average(&self, worker: usize) -> f64 {
        let window = self.samples_taken.min(self.params.num_samples);
        if window == 0 {
            return 0.0;
        }
        self.samples[worker][..window].iter().sum::<f64>() / window as f64
    }

    /// Recompute the smoothed system load and decide whether any
    /// threshold is breached. Silent until the stabilization gate opens.
    pub fn evaluate(&mut self, active_workers: usize) -> bool {
        if active_workers == 0 {
            return false;
        }
        let mut worker_out = false;
        let mut sum = 0.0;
        for worker in 0..active_workers {
            let average = self.worker_average(worker);
            if self.params.worker_load_up_threshold > 0.0
                && average > self.params.worker_load_up_threshold
            {
                worker_out = true;
            } else if self.params.worker_load_down_threshold > 0.0
                && average < self.params.worker_load_down_threshold
            {
                worker_out = true;
            }
            sum += average;
        }
        self.system_load = sum / active_workers as f64;

        if self.samples_taken < self.params.stabilization_period + self.params.num_samples {
            return false;
        }

        let system_up = self.params.system_load_up_threshold > 0.0
            && self.system_load > self.params.system_load_up_threshold;
        let system_down = self.system_load < self.params.system_load_down_threshold;
        worker_out || system_up || system_down
    }

    /// Zero the window after an applied reconfiguration
    pub fn reset_window(&mut self) {
        for row in &mut self.samples {
            row.fill(0.0);
        }
        self.cursor = 0;
        self.samples_taken = 0;
    }

    /// Samples taken since the last reconfiguration
    pub fn samples_taken(&self) -> usize {
        self.samples_taken
    }

    /// Search the configuration space for the best feasible candidate.
    ///
    /// Returns `(workers, frequency_index)`. Near saturation the maximum
    /// configuration is returned outright. With no feasible candidate the
    /// best under-loaded one is used, deliberately over-provisioning;
    /// with no candidate at all the current configuration is kept.
    pub fn best_feasible(&mut self, active_workers: usize) -> (usize, usize) {
        let down = self.params.system_load_down_threshold;
        let up = self.params.system_load_up_threshold;

        if self.system_load >= 100.0 - ERROR_PERC {
            return (self.max_workers, self.frequencies.len() - 1);
        }

        let current = ConfigPoint {
            workers: active_workers,
            frequency_khz: self.current_frequency(),
        };

        let mut next = (active_workers, self.current_frequency_idx);
        let mut found = false;
        let mut best_metric = f64::MAX;
        let mut best_suboptimal_load = 0.0;
        let mut suboptimal: Option<(usize, usize)> = None;

        for workers in 1..=self.max_workers {
            for freq in 0..self.frequencies.len() {
                if self.params.freq_strategy.governor_pinned() && freq != self.current_frequency_idx
                {
                    continue;
                }
                let predicted = self.predictor.predict(
                    current,
                    ConfigPoint {
                        workers,
                        frequency_khz: self.frequencies[freq],
                    },
                    self.system_load,
                );

                if predicted < down + ERROR_PERC {
                    if predicted > best_suboptimal_load {
                        best_suboptimal_load = predicted;
                        suboptimal = Some((workers, freq));
                    }
                } else if predicted <= up - ERROR_PERC {
                    match self.params.freq_strategy {
                        FrequencyStrategy::CoresConservative => {
                            self.last_prediction = predicted;
                            return (workers, freq);
                        }
                        // The governor owns the frequency; the scan keeps
                        // overwriting, so the largest feasible worker
                        // count wins.
                        FrequencyStrategy::GovernorOnDemand
                        | FrequencyStrategy::GovernorConservative
                        | FrequencyStrategy::GovernorPerformance => {
                            next = (workers, freq);
                            self.last_prediction = predicted;
                            found = true;
                        }
                        FrequencyStrategy::PowerConservative => {
                            let metric = power_metric(self.frequencies[freq], workers);
                            if metric < best_metric {
                                best_metric = metric;
                                next = (workers, freq);
                                self.last_prediction = predicted;
                            }
                            found = true;
                        }
                    }
                }
            }
        }

        if !found {
            if let Some(fallback) = suboptimal {
                next = fallback;
                self.last_prediction = best_suboptimal_load;
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GHZ: u64 = 1_000_000; // kHz

    fn controller(
        strategy: FrequencyStrategy,
        frequencies: Vec<u64>,
        max_workers: usize,
        up: f64,
        down: f64,
    ) -> ReconfController {
        let params = ReconfigurationParams {
            system_load_up_threshold: up,
            system_load_down_threshold: down,
            freq_strategy: strategy,
            ..ReconfigurationParams::default()
        };
        ReconfController::new(params, max_workers, frequencies)
    }

    fn fill_window(ctl: &mut ReconfController, active: usize, load: f64) {
        let loads = vec![load; active];
        for _ in 0..(ctl.params.num_samples + ctl.params.stabilization_period) {
            ctl.store_sample(&loads);
        }
        ctl.evaluate(active);
    }

    #[test]
    fn test_upscale_picks_first_feasible() {
        // One frequency: only the worker count can move. 95% on 2 workers
        // must grow to 3 (predicted 63.3%) with the band at [58, 87].
        let mut ctl = controller(FrequencyStrategy::CoresConservative, vec![GHZ], 6, 90.0, 55.0);
        ctl.current_frequency_idx = 0;
        fill_window(&mut ctl, 2, 95.0);
        assert_eq!(ctl.best_feasible(2), (3, 0));
        assert!((ctl.last_prediction - 95.0 * 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_cores_conservative_scans_workers_outermost() {
        // With several frequencies, the smallest worker count that has any
        // feasible frequency wins before a larger one is considered.
        let freqs = vec![GHZ, 3 * GHZ / 2, 2 * GHZ, 5 * GHZ / 2];
        let mut ctl = controller(FrequencyStrategy::CoresConservative, freqs, 6, 90.0, 55.0);
        ctl.current_frequency_idx = 0;
        fill_window(&mut ctl, 2, 95.0);
        // w=1: 190, 126.7, 95, 76 → 76 lands inside [58, 87] first.
        assert_eq!(ctl.best_feasible(2), (1, 3));
    }

    #[test]
    fn test_power_conservative_minimizes_power_model() {
        // 8 workers at 2.5 GHz carrying 20%: the cheapest feasible
        // configuration under f^1.3·(w+2) is 5 workers at 1.0 GHz.
        let freqs = vec![GHZ, 3 * GHZ / 2, 2 * GHZ, 5 * GHZ / 2];
        let mut ctl = controller(FrequencyStrategy::PowerConservative, freqs, 8, 90.0, 30.0);
        ctl.current_frequency_idx = 3;
        fill_window(&mut ctl, 8, 20.0);
        assert_eq!(ctl.best_feasible(8), (5, 0));
        assert!((ctl.last_prediction - 80.0).abs() < 1e-6);
    }

    #[test]
    fn test_saturation_short_circuit() {
        let freqs = vec![GHZ, 2 * GHZ];
        let mut ctl = controller(FrequencyStrategy::CoresConservative, freqs, 6, 90.0, 80.0);
        fill_window(&mut ctl, 2, 98.0);
        assert_eq!(ctl.best_feasible(2), (6, 1));
    }

    #[test]
    fn test_governor_strategy_pins_frequency() {
        let freqs = vec![GHZ, 3 * GHZ / 2, 2 * GHZ, 5 * GHZ / 2];
        let mut ctl = controller(FrequencyStrategy::GovernorPerformance, freqs, 6, 90.0, 55.0);
        assert_eq!(ctl.current_frequency_idx, 3);
        fill_window(&mut ctl, 2, 95.0);
        let (workers, freq) = ctl.best_feasible(2);
        assert_eq!(freq, 3);
        assert_eq!(workers, 3); // 95·2/3 ≈ 63.3 inside [58, 87]
    }

    #[test]
    fn test_governor_strategy_takes_largest_feasible_worker_count() {
        // 10 workers at 50% with a pinned frequency: 500/w lands inside
        // [55, 85] for w = 6..=9. The scan overwrites on every feasible
        // candidate, so the largest worker count is kept.
        let mut ctl = controller(FrequencyStrategy::GovernorPerformance, vec![GHZ], 10, 88.0, 52.0);
        fill_window(&mut ctl, 10, 50.0);
        let (workers, freq) = ctl.best_feasible(10);
        assert_eq!(freq, 0);
        assert_eq!(workers, 9);
        assert!((ctl.last_prediction - 500.0 / 9.0).abs() < 1e-6);
    }

    #[test]
    fn test_fallback_overprovisions() {
        // Band [43, 45]: everything is either too high or too low; the
        // largest under-loaded prediction (4 workers → 37.5%) wins.
        let mut ctl = controller(FrequencyStrategy::CoresConservative, vec![GHZ], 6, 48.0, 40.0);
        fill_window(&mut ctl, 3, 50.0);
        assert_eq!(ctl.best_feasible(3), (4, 0));
        assert!((ctl.last_prediction - 37.5).abs() < 1e-6);
    }

    #[test]
    fn test_no_candidate_keeps_current() {
        // Every candidate predicts above the band: stay put.
        let mut ctl = controller(FrequencyStrategy::CoresConservative, vec![GHZ], 2, 20.0, 10.0);
        fill_window(&mut ctl, 1, 90.0);
        assert_eq!(ctl.best_feasible(1), (1, 0));
    }

    #[test]
    fn test_stabilization_gate() {
        let mut ctl = controller(FrequencyStrategy::CoresConservative, vec![GHZ], 4, 90.0, 80.0);
        let loads = [99.0, 99.0];
        for _ in 0..(ctl.params.num_samples + ctl.params.stabilization_period - 1) {
            ctl.store_sample(&loads);
            assert!(!ctl.evaluate(2), "gate must hold until the window is full");
        }
        ctl.store_sample(&loads);
        assert!(ctl.evaluate(2));
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut ctl = controller(FrequencyStrategy::CoresConservative, vec![GHZ], 4, 90.0, 80.0);
        // Exactly on the up threshold: no trigger.
        let loads = [90.0, 90.0];
        for _ in 0..16 {
            ctl.store_sample(&loads);
        }
        assert!(!ctl.evaluate(2));
        // Exactly on the down threshold: no trigger either.
        ctl.reset_window();
        let loads = [80.0, 80.0];
        for _ in 0..16 {
            ctl.store_sample(&loads);
        }
        assert!(!ctl.evaluate(2));
    }

    #[test]
    fn test_worker_level_trigger() {
        let mut ctl = controller(FrequencyStrategy::CoresConservative, vec![GHZ], 4, 99.0, 1.0);
        ctl.params.worker_load_up_threshold = 90.0;
        // System mean is modest but one worker is saturated.
        let loads = [98.0, 10.0];
        for _ in 0..16 {
            ctl.store_sample(&loads);
        }
        assert!(ctl.evaluate(2));

        // Zeroing the worker threshold disables the trigger.
        ctl.params.worker_load_up_threshold = 0.0;
        assert!(!ctl.evaluate(2));
    }

    #[test]
    fn test_reset_window_clears_counters() {
        let mut ctl = controller(FrequencyStrategy::CoresConservative, vec![GHZ], 4, 90.0, 80.0);
        ctl.store_sample(&[50.0, 50.0]);
        assert_eq!(ctl.samples_taken(), 1);
        ctl.reset_window();
        assert_eq!(ctl.samples_taken(), 0);
        assert_eq!(ctl.worker_average(0), 0.0);
    }

    #[test]
    fn test_smoothed_vs_instantaneous() {
        let mut ctl = controller(FrequencyStrategy::CoresConservative, vec![GHZ], 4, 90.0, 80.0);
        ctl.store_sample(&[40.0, 60.0]);
        ctl.store_sample(&[80.0, 100.0]);
        assert!((ctl.instantaneous_load - 90.0).abs() < 1e-9);
        ctl.evaluate(2);
        // Window mean over two samples: (50 + 90) / 2.
        assert!((ctl.system_load - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_params_validation() {
        let mut p = ReconfigurationParams::default();
        assert!(p.validate().is_ok());
        p.num_samples = 0;
        assert!(p.validate().is_err());
        p.num_samples = 4;
        p.system_load_down_threshold = 95.0;
        assert!(p.validate().is_err());
        p.system_load_down_threshold = 101.0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_starting_frequency_per_strategy() {
        let freqs = vec![GHZ, 2 * GHZ];
        let cores = controller(FrequencyStrategy::CoresConservative, freqs.clone(), 2, 90.0, 80.0);
        assert_eq!(cores.current_frequency_idx, 1);
        let power = controller(FrequencyStrategy::PowerConservative, freqs.clone(), 2, 90.0, 80.0);
        assert_eq!(power.current_frequency_idx, 0);
        let perf = controller(FrequencyStrategy::GovernorPerformance, freqs, 2, 90.0, 80.0);
        assert_eq!(perf.current_frequency_idx, 1);
    }

    #[test]
    fn test_linear_predictor() {
        let p = LinearCapacityPredictor;
        let current = ConfigPoint { workers: 2, frequency_khz: GHZ };
        let candidate = ConfigPoint { workers: 4, frequency_khz: 2 * GHZ };
        // Four times the capacity: a quarter of the load.
        assert!((p.predict(current, candidate, 80.0) - 20.0).abs() < 1e-9);
    }
}
