//! CPU topology enumeration
//!
//! The runtime pins one thread per stage to a distinct *real* core, so the
//! facade must dedupe hyperthread siblings and know which socket each core
//! sits on. Parsing works against an injectable sysfs root; the pure
//! helpers are tested against fixture strings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dpi_common::{CoreError, CoreResult};

/// One real (non-sibling) core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCore {
    /// Kernel CPU id (the first sibling of its physical core)
    pub id: usize,
    /// Physical package (socket) id
    pub socket: usize,
}

/// Enumerated machine topology, real cores only
#[derive(Debug, Clone)]
pub struct CpuTopology {
    cores: Vec<CpuCore>,
}

impl CpuTopology {
    /// Enumerate from the live sysfs tree, falling back to a flat layout
    /// when the topology files are unavailable (containers, non-Linux).
    pub fn detect() -> Self {
        match Self::from_sysfs_root(Path::new("/sys/devices/system/cpu")) {
            Ok(t) if !t.cores.is_empty() => t,
            _ => {
                let n = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
                tracing::warn!(cores = n, "cpu topology unavailable, assuming flat single-socket layout");
                Self::flat(n)
            }
        }
    }

    /// Flat single-socket topology with `n` cores
    pub fn flat(n: usize) -> Self {
        Self {
            cores: (0..n).map(|id| CpuCore { id, socket: 0 }).collect(),
        }
    }

    /// Enumerate from a sysfs-shaped directory tree
    pub fn from_sysfs_root(root: &Path) -> CoreResult<Self> {
        let mut entries = Vec::new();
        for cpu in 0.. {
            let topo: PathBuf = root.join(format!("cpu{cpu}/topology"));
            if !topo.exists() {
                break;
            }
            let package = read_usize(&topo.join("physical_package_id"))?;
            let siblings = std::fs::read_to_string(topo.join("thread_siblings_list"))?;
            entries.push((cpu, package, siblings.trim().to_string()));
        }
        if entries.is_empty() {
            return Err(CoreError::Hardware("no cpus under sysfs root".into()));
        }
        Ok(Self::from_entries(&entries))
    }

    /// Build from `(cpu_id, package_id, thread_siblings_list)` triples,
    /// keeping only the first sibling of every physical core.
    pub fn from_entries(entries: &[(usize, usize, String)]) -> Self {
        let mut cores = Vec::new();
        for (cpu, package, siblings) in entries {
            let siblings = parse_cpu_list(siblings);
            if siblings.first() == Some(cpu) {
                cores.push(CpuCore {
                    id: *cpu,
                    socket: *package,
                });
            }
        }
        Self { cores }
    }

    /// Number of real cores
    pub fn num_real_cores(&self) -> usize {
        self.cores.len()
    }

    /// The real cores, ascending by id
    pub fn real_cores(&self) -> &[CpuCore] {
        &self.cores
    }

    /// Number of sockets
    pub fn num_sockets(&self) -> usize {
        let mut sockets: Vec<usize> = self.cores.iter().map(|c| c.socket).collect();
        sockets.sort_unstable();
        sockets.dedup();
        sockets.len()
    }

    /// Linear slot → core mapping over the first `n` real cores
    pub fn linear_mapping(&self, n: usize) -> Vec<usize> {
        self.cores.iter().take(n).map(|c| c.id).collect()
    }

    /// One representative core per socket, restricted to `mapping`.
    ///
    /// Used for global frequency writes: the kernel propagates a
    /// representative's frequency to its siblings.
    pub fn one_core_per_socket(&self, mapping: &[usize]) -> Vec<usize> {
        let mut per_socket: BTreeMap<usize, usize> = BTreeMap::new();
        for &core_id in mapping {
            if let Some(core) = self.cores.iter().find(|c| c.id == core_id) {
                per_socket.entry(core.socket).or_insert(core.id);
            }
        }
        per_socket.into_values().collect()
    }
}

fn read_usize(path: &Path) -> CoreResult<usize> {
    let raw = std::fs::read_to_string(path)?;
    raw.trim()
        .parse()
        .map_err(|_| CoreError::Hardware(format!("unparseable value in {}", path.display())))
}

/// Parse a kernel cpu list like `0,8` or `0-3` or `0-3,8-11`
pub fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut out = Vec::new();
    for part in list.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<usize>(), hi.trim().parse::<usize>()) {
                    out.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(v) = part.trim().parse() {
                    out.push(v);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0,8"), vec![0, 8]);
        assert_eq!(parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0-1,4-5"), vec![0, 1, 4, 5]);
        assert_eq!(parse_cpu_list(" 7 "), vec![7]);
        assert!(parse_cpu_list("").is_empty());
    }

    /// Two sockets, two cores each, hyperthreading on: cpus 0-3 are the
    /// first threads, cpus 4-7 their siblings.
    fn ht_entries() -> Vec<(usize, usize, String)> {
        vec![
            (0, 0, "0,4".into()),
            (1, 0, "1,5".into()),
            (2, 1, "2,6".into()),
            (3, 1, "3,7".into()),
            (4, 0, "0,4".into()),
            (5, 0, "1,5".into()),
            (6, 1, "2,6".into()),
            (7, 1, "3,7".into()),
        ]
    }

    #[test]
    fn test_sibling_dedup() {
        let topo = CpuTopology::from_entries(&ht_entries());
        assert_eq!(topo.num_real_cores(), 4);
        assert_eq!(topo.linear_mapping(4), vec![0, 1, 2, 3]);
        assert_eq!(topo.num_sockets(), 2);
    }

    #[test]
    fn test_one_core_per_socket() {
        let topo = CpuTopology::from_entries(&ht_entries());
        assert_eq!(topo.one_core_per_socket(&[0, 1, 2, 3]), vec![0, 2]);
        // Restricting the mapping restricts the representatives.
        assert_eq!(topo.one_core_per_socket(&[1, 3]), vec![1, 3]);
        assert_eq!(topo.one_core_per_socket(&[1]), vec![1]);
    }

    #[test]
    fn test_flat_topology() {
        let topo = CpuTopology::flat(6);
        assert_eq!(topo.num_real_cores(), 6);
        assert_eq!(topo.num_sockets(), 1);
        assert_eq!(topo.one_core_per_socket(&[2, 3]), vec![2]);
    }
}
