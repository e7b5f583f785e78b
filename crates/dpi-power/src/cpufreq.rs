//! cpufreq frequency and governor control
//!
//! Frequencies are kHz, listed ascending. Writes go through the scaling
//! interface of each core; `StaticFrequencyControl` records them for tests
//! and `NullFrequencyControl` is the degraded no-hardware mode.

use std::path::{Path, PathBuf};

use dpi_common::{CoreError, CoreResult};

/// cpufreq governor kinds the runtime can install
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Governor {
    /// Explicit frequency writes by the runtime
    Userspace,
    /// Kernel ondemand policy
    OnDemand,
    /// Kernel conservative policy
    Conservative,
    /// Pin to the maximum
    Performance,
}

impl Governor {
    /// The sysfs name of this governor
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Userspace => "userspace",
            Self::OnDemand => "ondemand",
            Self::Conservative => "conservative",
            Self::Performance => "performance",
        }
    }
}

/// Frequency-control surface used by the reconfiguration controller
pub trait FrequencyControl: Send {
    /// Available frequencies in kHz, sorted ascending; empty when the
    /// platform exposes no frequency control.
    fn available_frequencies(&self) -> &[u64];

    /// Set `khz` on every core in `cores`
    fn set_frequency(&mut self, cores: &[usize], khz: u64) -> CoreResult<()>;

    /// Install a governor on one core
    fn set_governor(&mut self, core: usize, governor: Governor) -> CoreResult<()>;

    /// Set scaling bounds on one core
    fn set_bounds(&mut self, core: usize, min_khz: u64, max_khz: u64) -> CoreResult<()>;
}

/// Live sysfs cpufreq backend
pub struct SysfsCpuFreq {
    root: PathBuf,
    frequencies: Vec<u64>,
}

impl SysfsCpuFreq {
    /// Default cpufreq location
    pub const DEFAULT_ROOT: &'static str = "/sys/devices/system/cpu";

    /// Open the cpufreq tree, reading the frequency list from cpu0
    pub fn open(root: &Path) -> CoreResult<Self> {
        let list = std::fs::read_to_string(root.join("cpu0/cpufreq/scaling_available_frequencies"))?;
        let mut frequencies = parse_frequency_list(&list);
        if frequencies.is_empty() {
            return Err(CoreError::Hardware("empty frequency list".into()));
        }
        frequencies.sort_unstable();
        Ok(Self {
            root: root.to_path_buf(),
            frequencies,
        })
    }

    fn write(&self, core: usize, file: &str, value: &str) -> CoreResult<()> {
        let path = self.root.join(format!("cpu{core}/cpufreq/{file}"));
        std::fs::write(&path, value)
            .map_err(|e| CoreError::Hardware(format!("writing {}: {e}", path.display())))
    }
}

impl FrequencyControl for SysfsCpuFreq {
    fn available_frequencies(&self) -> &[u64] {
        &self.frequencies
    }

    fn set_frequency(&mut self, cores: &[usize], khz: u64) -> CoreResult<()> {
        for &core in cores {
            self.write(core, "scaling_setspeed", &khz.to_string())?;
        }
        Ok(())
    }

    fn set_governor(&mut self, core: usize, governor: Governor) -> CoreResult<()> {
        self.write(core, "scaling_governor", governor.as_str())
    }

    fn set_bounds(&mut self, core: usize, min_khz: u64, max_khz: u64) -> CoreResult<()> {
        self.write(core, "scaling_min_freq", &min_khz.to_string())?;
        self.write(core, "scaling_max_freq", &max_khz.to_string())
    }
}

/// Parse a space-separated kHz list
pub fn parse_frequency_list(raw: &str) -> Vec<u64> {
    raw.split_whitespace().filter_map(|t| t.parse().ok()).collect()
}

/// No-hardware mode: no frequencies, writes are accepted and dropped
#[derive(Debug, Default)]
pub struct NullFrequencyControl;

impl FrequencyControl for NullFrequencyControl {
    fn available_frequencies(&self) -> &[u64] {
        &[]
    }

    fn set_frequency(&mut self, _cores: &[usize], _khz: u64) -> CoreResult<()> {
        Ok(())
    }

    fn set_governor(&mut self, _core: usize, _governor: Governor) -> CoreResult<()> {
        Ok(())
    }

    fn set_bounds(&mut self, _core: usize, _min_khz: u64, _max_khz: u64) -> CoreResult<()> {
        Ok(())
    }
}

/// In-memory control with a fixed frequency list, recording every write
///
/// Used by tests and simulation drivers.
#[derive(Debug)]
pub struct StaticFrequencyControl {
    frequencies: Vec<u64>,
    /// `(cores, khz)` in call order
    pub frequency_writes: Vec<(Vec<usize>, u64)>,
    /// `(core, governor)` in call order
    pub governor_writes: Vec<(usize, Governor)>,
    /// `(core, min, max)` in call order
    pub bounds_writes: Vec<(usize, u64, u64)>,
}

impl StaticFrequencyControl {
    /// Control exposing `frequencies` (sorted ascending internally)
    pub fn new(mut frequencies: Vec<u64>) -> Self {
        frequencies.sort_unstable();
        Self {
            frequencies,
            frequency_writes: Vec::new(),
            governor_writes: Vec::new(),
            bounds_writes: Vec::new(),
        }
    }
}

impl FrequencyControl for StaticFrequencyControl {
    fn available_frequencies(&self) -> &[u64] {
        &self.frequencies
    }

    fn set_frequency(&mut self, cores: &[usize], khz: u64) -> CoreResult<()> {
        self.frequency_writes.push((cores.to_vec(), khz));
        Ok(())
    }

    fn set_governor(&mut self, core: usize, governor: Governor) -> CoreResult<()> {
        self.governor_writes.push((core, governor));
        Ok(())
    }

    fn set_bounds(&mut self, core: usize, min_khz: u64, max_khz: u64) -> CoreResult<()> {
        self.bounds_writes.push((core, min_khz, max_khz));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frequency_list() {
        assert_eq!(
            parse_frequency_list("1000000 1500000 2000000\n"),
            vec![1000000, 1500000, 2000000]
        );
        assert!(parse_frequency_list("").is_empty());
    }

    #[test]
    fn test_static_control_sorts_and_records() {
        let mut ctl = StaticFrequencyControl::new(vec![2500000, 1000000, 1500000]);
        assert_eq!(ctl.available_frequencies(), &[1000000, 1500000, 2500000]);

        ctl.set_frequency(&[1, 2], 1500000).unwrap();
        ctl.set_governor(0, Governor::Performance).unwrap();
        ctl.set_bounds(3, 1000000, 2500000).unwrap();

        assert_eq!(ctl.frequency_writes, vec![(vec![1, 2], 1500000)]);
        assert_eq!(ctl.governor_writes, vec![(0, Governor::Performance)]);
        assert_eq!(ctl.bounds_writes, vec![(3, 1000000, 2500000)]);
    }

    #[test]
    fn test_null_control() {
        let mut ctl = NullFrequencyControl;
        assert!(ctl.available_frequencies().is_empty());
        assert!(ctl.set_frequency(&[0], 1000000).is_ok());
        assert!(ctl.set_governor(0, Governor::OnDemand).is_ok());
    }
}
