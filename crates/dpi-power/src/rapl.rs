//! Per-socket energy counters
//!
//! Counters are raw 32-bit device units that wrap; only differences taken
//! within the wrapping interval are meaningful. The sysfs backend reads the
//! powercap tree; `MockCounters` drives the same code paths from tests.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use dpi_common::{CoreError, CoreResult};

/// Raw counter values for one socket, in device units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawSocketCounters {
    /// Whole-package counter
    pub socket: u32,
    /// Core domain counter
    pub cores: u32,
    /// Uncore (offcore) domain counter
    pub offcores: u32,
    /// DRAM domain counter
    pub dram: u32,
}

/// One read of every socket's counters
///
/// Meaningless on its own; feed two snapshots to [`EnergyCounters::diff`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSnapshot {
    /// Per-socket raw counters
    pub sockets: Vec<RawSocketCounters>,
}

/// Joules consumed between two snapshots, per socket and domain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergySample {
    /// Number of sockets reported
    pub num_sockets: usize,
    /// Package joules per socket
    pub joules_socket: Vec<f64>,
    /// Core-domain joules per socket
    pub joules_cores: Vec<f64>,
    /// Offcore-domain joules per socket
    pub joules_offcores: Vec<f64>,
    /// DRAM joules per socket
    pub joules_dram: Vec<f64>,
}

impl EnergySample {
    /// Sample with `n` zeroed sockets
    pub fn zeroed(n: usize) -> Self {
        Self {
            num_sockets: n,
            joules_socket: vec![0.0; n],
            joules_cores: vec![0.0; n],
            joules_offcores: vec![0.0; n],
            joules_dram: vec![0.0; n],
        }
    }

    /// Sum of a domain across sockets
    pub fn total(domain: &[f64]) -> f64 {
        domain.iter().sum()
    }
}

/// Source of raw counter values
pub trait CounterBackend: Send {
    /// Number of sockets this backend reports
    fn num_sockets(&self) -> usize;
    /// Joules represented by one device unit on `socket`
    fn joules_per_unit(&self, socket: usize) -> f64;
    /// Sustained package power used to bound the wrap interval, in watts
    fn max_power_watts(&self) -> f64;
    /// Read the current raw counters of `socket`
    fn read_socket(&mut self, socket: usize) -> CoreResult<RawSocketCounters>;
}

/// Wrap-aware energy accounting over a [`CounterBackend`]
///
/// Construction failure degrades to the disabled state: reads return
/// zeroed snapshots and diffs zeroed samples, never an error.
pub struct EnergyCounters {
    backend: Option<Box<dyn CounterBackend>>,
}

impl EnergyCounters {
    /// Wrap a backend
    pub fn new(backend: Box<dyn CounterBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Counters that always read zero
    pub fn disabled() -> Self {
        Self { backend: None }
    }

    /// Open the default sysfs backend, degrading to disabled when the
    /// powercap tree is missing.
    pub fn detect() -> Self {
        match SysfsRapl::open(Path::new(SysfsRapl::DEFAULT_ROOT)) {
            Ok(backend) => Self::new(Box::new(backend)),
            Err(err) => {
                tracing::warn!(%err, "energy counters unavailable, accounting disabled");
                Self::disabled()
            }
        }
    }

    /// Whether real counters are behind this instance
    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Number of sockets (zero when disabled)
    pub fn num_sockets(&self) -> usize {
        self.backend.as_ref().map_or(0, |b| b.num_sockets())
    }

    /// Snapshot every socket's raw counters
    pub fn read(&mut self) -> RawSnapshot {
        let Some(backend) = self.backend.as_mut() else {
            return RawSnapshot::default();
        };
        let mut sockets = Vec::with_capacity(backend.num_sockets());
        for s in 0..backend.num_sockets() {
            match backend.read_socket(s) {
                Ok(raw) => sockets.push(raw),
                Err(err) => {
                    tracing::warn!(socket = s, %err, "energy counter read failed");
                    sockets.push(RawSocketCounters::default());
                }
            }
        }
        RawSnapshot { sockets }
    }

    /// Joules consumed between `before` and `after`.
    ///
    /// Each domain is `after - before` modulo 2^32, scaled to joules, so a
    /// single wrap between the reads is handled; the caller keeps the gap
    /// under [`Self::wrapping_interval_secs`].
    pub fn diff(&self, after: &RawSnapshot, before: &RawSnapshot) -> EnergySample {
        let n = after.sockets.len().min(before.sockets.len());
        let mut sample = EnergySample::zeroed(n);
        for s in 0..n {
            let unit = self.backend.as_ref().map_or(0.0, |b| b.joules_per_unit(s));
            let (a, b) = (&after.sockets[s], &before.sockets[s]);
            sample.joules_socket[s] = a.socket.wrapping_sub(b.socket) as f64 * unit;
            sample.joules_cores[s] = a.cores.wrapping_sub(b.cores) as f64 * unit;
            sample.joules_offcores[s] = a.offcores.wrapping_sub(b.offcores) as f64 * unit;
            sample.joules_dram[s] = a.dram.wrapping_sub(b.dram) as f64 * unit;
        }
        sample
    }

    /// Maximum seconds between two reads before a counter can wrap twice
    pub fn wrapping_interval_secs(&self) -> u32 {
        let Some(backend) = self.backend.as_ref() else {
            return u32::MAX;
        };
        let min_unit = (0..backend.num_sockets())
            .map(|s| backend.joules_per_unit(s))
            .fold(f64::MAX, f64::min);
        let span_joules = min_unit * 2f64.powi(32);
        (span_joules / backend.max_power_watts()).floor() as u32
    }
}

/// Powercap-tree backend
///
/// Layout: `intel-rapl:<socket>` packages with `intel-rapl:<socket>:<n>`
/// subdomains named `core`, `uncore`, `dram`. Values are microjoules, so
/// one device unit is 1e-6 J.
pub struct SysfsRapl {
    packages: Vec<RaplPackage>,
    max_power_watts: f64,
}

struct RaplPackage {
    energy: PathBuf,
    cores: Option<PathBuf>,
    offcores: Option<PathBuf>,
    dram: Option<PathBuf>,
}

impl SysfsRapl {
    /// Default powercap location
    pub const DEFAULT_ROOT: &'static str = "/sys/class/powercap";

    const JOULES_PER_UNIT: f64 = 1e-6;

    /// Open all packages under a powercap-shaped root
    pub fn open(root: &Path) -> CoreResult<Self> {
        let mut packages = Vec::new();
        let mut max_power_watts: f64 = 0.0;
        for socket in 0.. {
            let pkg_dir = root.join(format!("intel-rapl:{socket}"));
            if !pkg_dir.exists() {
                break;
            }
            let mut pkg = RaplPackage {
                energy: pkg_dir.join("energy_uj"),
                cores: None,
                offcores: None,
                dram: None,
            };
            for sub in 0.. {
                let sub_dir = root.join(format!("intel-rapl:{socket}:{sub}"));
                if !sub_dir.exists() {
                    break;
                }
                let name = std::fs::read_to_string(sub_dir.join("name")).unwrap_or_default();
                let energy = sub_dir.join("energy_uj");
                match name.trim() {
                    "core" => pkg.cores = Some(energy),
                    "uncore" => pkg.offcores = Some(energy),
                    "dram" => pkg.dram = Some(energy),
                    _ => {}
                }
            }
            if let Ok(raw) = std::fs::read_to_string(pkg_dir.join("constraint_0_power_limit_uw")) {
                if let Ok(uw) = raw.trim().parse::<u64>() {
                    max_power_watts += uw as f64 * 1e-6;
                }
            }
            packages.push(pkg);
        }
        if packages.is_empty() {
            return Err(CoreError::Hardware("no RAPL packages under powercap root".into()));
        }
        if max_power_watts == 0.0 {
            // No exposed limit; assume a generous package budget.
            max_power_watts = 150.0 * packages.len() as f64;
        }
        Ok(Self {
            packages,
            max_power_watts,
        })
    }

    fn read_units(path: &Path) -> CoreResult<u32> {
        let raw = std::fs::read_to_string(path)?;
        let uj: u64 = raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Hardware(format!("unparseable counter in {}", path.display())))?;
        Ok(uj as u32)
    }
}

impl CounterBackend for SysfsRapl {
    fn num_sockets(&self) -> usize {
        self.packages.len()
    }

    fn joules_per_unit(&self, _socket: usize) -> f64 {
        Self::JOULES_PER_UNIT
    }

    fn max_power_watts(&self) -> f64 {
        self.max_power_watts
    }

    fn read_socket(&mut self, socket: usize) -> CoreResult<RawSocketCounters> {
        let pkg = self
            .packages
            .get(socket)
            .ok_or_else(|| CoreError::Hardware(format!("no such socket {socket}")))?;
        let read_opt = |p: &Option<PathBuf>| p.as_deref().map(Self::read_units).transpose().map(Option::unwrap_or_default);
        Ok(RawSocketCounters {
            socket: Self::read_units(&pkg.energy)?,
            cores: read_opt(&pkg.cores)?,
            offcores: read_opt(&pkg.offcores)?,
            dram: read_opt(&pkg.dram)?,
        })
    }
}

/// Scripted backend for tests and simulation
pub struct MockCounters {
    /// Per-socket sequences of raw counter values, consumed per read
    pub script: Vec<Vec<RawSocketCounters>>,
    /// Joules per device unit
    pub unit: f64,
    /// Assumed package power bound
    pub watts: f64,
    cursor: Vec<usize>,
}

impl MockCounters {
    /// Backend replaying `script[socket][read_index]`; the last value
    /// repeats once the script runs out.
    pub fn new(script: Vec<Vec<RawSocketCounters>>, unit: f64, watts: f64) -> Self {
        let cursor = vec![0; script.len()];
        Self {
            script,
            unit,
            watts,
            cursor,
        }
    }
}

impl CounterBackend for MockCounters {
    fn num_sockets(&self) -> usize {
        self.script.len()
    }

    fn joules_per_unit(&self, _socket: usize) -> f64 {
        self.unit
    }

    fn max_power_watts(&self) -> f64 {
        self.watts
    }

    fn read_socket(&mut self, socket: usize) -> CoreResult<RawSocketCounters> {
        let seq = &self.script[socket];
        if seq.is_empty() {
            return Ok(RawSocketCounters::default());
        }
        let idx = self.cursor[socket].min(seq.len() - 1);
        self.cursor[socket] += 1;
        Ok(seq[idx])
    }
}
