//! Sequential inspection engine seam
//!
//! The pipeline treats the DPI engine as an external collaborator reached
//! through [`InspectionEngine`]: per-partition classification, flow-table
//! repartitioning, and a tagged-variant configuration channel. Every
//! configuration path is only ever invoked with the pipeline quiesced, so
//! implementations never see a half-applied change.
//!
//! [`PortClassifierEngine`] is the reference implementation used by tests
//! and demos: a port-map classifier over partitioned flow tables.

use std::any::Any;
use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use dpi_common::{CoreError, CoreResult, FlowFingerprint, ParsedPacket};

/// Application protocols the runtime can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum AppProtocol {
    Http,
    Https,
    Dns,
    Sip,
    Stun,
    OpenVpn,
    WireGuard,
    Ssh,
    Rdp,
    Unknown,
}

/// How far identification of a flow has progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassificationStatus {
    /// Protocol identified, result is final for the flow
    Identified,
    /// Still inspecting; more packets may settle it
    InProgress,
    /// Gave up or the flow could not be tracked
    Unknown,
    /// The packet was not parseable IP traffic
    NotIp,
}

/// Result of classifying one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Identification progress
    pub status: ClassificationStatus,
    /// Identified protocol (meaningful when status is `Identified`)
    pub protocol: AppProtocol,
}

impl Classification {
    /// The not-IP result
    pub const NOT_IP: Self = Self {
        status: ClassificationStatus::NotIp,
        protocol: AppProtocol::Unknown,
    };
}

/// L3/L4 preprocessing output attached to a task before L7 dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedPacket {
    /// Canonicalized flow identity
    pub fingerprint: FlowFingerprint,
    /// Offset of the application payload in the datagram
    pub payload_offset: u16,
}

/// Per-flow driver state handed to HTTP callbacks and the flow cleaner
pub type FlowUserData = Box<dyn Any + Send>;

/// Callback invoked with per-flow driver state when a flow is discarded
pub type FlowCleaner = Box<dyn Fn(FlowUserData) + Send + Sync>;

/// Context for an HTTP body callback invocation
#[derive(Debug, Clone, Copy)]
pub struct HttpMessageInfo {
    /// Flow the body chunk belongs to
    pub fingerprint: FlowFingerprint,
    /// Bytes in this chunk
    pub chunk_len: usize,
}

/// HTTP inspection callbacks
///
/// Data passed to a callback is valid only for the duration of the call.
pub struct HttpCallbacks {
    /// Invoked with each observed body chunk and the flow's user slot
    pub on_body:
        Box<dyn Fn(&HttpMessageInfo, &[u8], &mut Option<FlowUserData>) + Send + Sync>,
}

/// Configuration mutators delegated to the engine, always under quiescence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EngineDirective {
    SetMaxTrials(u16),
    Ipv4FragmentationEnable { table_size: u16 },
    Ipv6FragmentationEnable { table_size: u16 },
    Ipv4FragmentationDisable,
    Ipv6FragmentationDisable,
    Ipv4FragmentationPerHostLimit(u32),
    Ipv6FragmentationPerHostLimit(u32),
    Ipv4FragmentationTotalLimit(u32),
    Ipv6FragmentationTotalLimit(u32),
    Ipv4FragmentationReassemblyTimeout(u8),
    Ipv6FragmentationReassemblyTimeout(u8),
    TcpReorderingEnable,
    TcpReorderingDisable,
    ProtocolEnable(AppProtocol),
    ProtocolDisable(AppProtocol),
    InspectAll,
    InspectNothing,
}

/// The sequential engine as seen by the pipeline
pub trait InspectionEngine: Send + Sync {
    /// L3/L4 preprocessing: extract the flow identity of a raw datagram.
    /// `None` means the packet is not classifiable IP traffic.
    fn prepare(&self, packet: &[u8], timestamp: u32) -> Option<PreparedPacket>;

    /// Classify one packet against partition `partition`.
    ///
    /// Callers guarantee partition-disjoint access: at any moment at most
    /// one thread classifies against a given partition.
    fn classify(
        &self,
        partition: usize,
        prepared: &PreparedPacket,
        packet: &[u8],
        timestamp: u32,
    ) -> Classification;

    /// Rebuild the flow tables into `partitions` disjoint partitions.
    /// Only called while the pipeline is quiesced.
    fn repartition(&self, partitions: usize) -> CoreResult<()>;

    /// Apply a configuration directive. Only called while quiesced.
    fn configure(&self, directive: EngineDirective) -> CoreResult<()>;

    /// Install or clear the flow cleaner
    fn set_flow_cleaner(&self, cleaner: Option<FlowCleaner>) -> CoreResult<()>;

    /// Activate HTTP callbacks
    fn http_activate_callbacks(&self, callbacks: HttpCallbacks) -> CoreResult<()>;

    /// Deactivate HTTP callbacks
    fn http_disable_callbacks(&self) -> CoreResult<()>;
}

// ============================================================================
// Reference engine
// ============================================================================

/// Sizing limits for the reference engine's flow tables
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineLimits {
    /// v4 table size hint
    pub flow_table_size_v4: u32,
    /// v6 table size hint
    pub flow_table_size_v6: u32,
    /// Maximum concurrently tracked v4 flows
    pub max_active_flows_v4: u32,
    /// Maximum concurrently tracked v6 flows
    pub max_active_flows_v6: u32,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            flow_table_size_v4: 32767,
            flow_table_size_v6: 32767,
            max_active_flows_v4: 500000,
            max_active_flows_v6: 500000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FragSettings {
    table_size: u16,
    per_host_limit: u32,
    total_limit: u32,
    timeout_secs: u8,
}

struct EngineSettings {
    max_trials: u16,
    tcp_reordering: bool,
    frag_v4: Option<FragSettings>,
    frag_v6: Option<FragSettings>,
    enabled: HashSet<AppProtocol>,
}

impl EngineSettings {
    fn all_protocols() -> HashSet<AppProtocol> {
        [
            AppProtocol::Http,
            AppProtocol::Https,
            AppProtocol::Dns,
            AppProtocol::Sip,
            AppProtocol::Stun,
            AppProtocol::OpenVpn,
            AppProtocol::WireGuard,
            AppProtocol::Ssh,
            AppProtocol::Rdp,
        ]
        .into_iter()
        .collect()
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_trials: 8,
            tcp_reordering: true,
            frag_v4: None,
            frag_v6: None,
            enabled: Self::all_protocols(),
        }
    }
}

struct FlowEntry {
    classification: Classification,
    trials: u16,
    user_data: Option<FlowUserData>,
    last_seen: u32,
}

#[derive(Default)]
struct FlowPartition {
    flows: HashMap<FlowFingerprint, FlowEntry>,
    active_v4: u32,
    active_v6: u32,
}

/// Port-map reference engine with partitioned flow tables
///
/// Classification is by well-known server port, with a trial budget per
/// flow; enough to exercise every pipeline path without dragging a full
/// protocol inspector into the tests.
pub struct PortClassifierEngine {
    limits: EngineLimits,
    settings: RwLock<EngineSettings>,
    partitions: RwLock<Vec<Mutex<FlowPartition>>>,
    cleaner: RwLock<Option<FlowCleaner>>,
    http: RwLock<Option<HttpCallbacks>>,
}

impl PortClassifierEngine {
    /// Well-known server ports and the protocols they indicate
    const PORT_MAP: &'static [(u16, AppProtocol)] = &[
        (80, AppProtocol::Http),
        (443, AppProtocol::Https),
        (53, AppProtocol::Dns),
        (5060, AppProtocol::Sip),
        (5061, AppProtocol::Sip),
        (3478, AppProtocol::Stun),
        (3479, AppProtocol::Stun),
        (1194, AppProtocol::OpenVpn),
        (51820, AppProtocol::WireGuard),
        (22, AppProtocol::Ssh),
        (3389, AppProtocol::Rdp),
    ];

    /// Engine with `partitions` initial flow-table partitions
    pub fn new(limits: EngineLimits, partitions: usize) -> Self {
        let parts = (0..partitions.max(1))
            .map(|_| Mutex::new(FlowPartition::default()))
            .collect();
        Self {
            limits,
            settings: RwLock::new(EngineSettings::default()),
            partitions: RwLock::new(parts),
            cleaner: RwLock::new(None),
            http: RwLock::new(None),
        }
    }

    fn port_protocol(ports: (u16, u16)) -> AppProtocol {
        for (port, proto) in Self::PORT_MAP {
            if ports.0 == *port || ports.1 == *port {
                return *proto;
            }
        }
        AppProtocol::Unknown
    }

    fn frag_settings(
        settings: &mut EngineSettings,
        v6: bool,
    ) -> &mut Option<FragSettings> {
        if v6 {
            &mut settings.frag_v6
        } else {
            &mut settings.frag_v4
        }
    }
}

impl InspectionEngine for PortClassifierEngine {
    fn prepare(&self, packet: &[u8], _timestamp: u32) -> Option<PreparedPacket> {
        let parsed = ParsedPacket::parse(packet)?;
        Some(PreparedPacket {
            fingerprint: parsed.fingerprint,
            payload_offset: parsed.payload_offset,
        })
    }

    fn classify(
        &self,
        partition: usize,
        prepared: &PreparedPacket,
        packet: &[u8],
        timestamp: u32,
    ) -> Classification {
        let settings = self.settings.read();
        let partitions = self.partitions.read();
        let Some(slot) = partitions.get(partition) else {
            return Classification::NOT_IP;
        };
        let mut part = slot.lock();

        let fp = prepared.fingerprint;
        if !part.flows.contains_key(&fp) {
            let (active, max) = if fp.v6 {
                (part.active_v6, self.limits.max_active_flows_v6)
            } else {
                (part.active_v4, self.limits.max_active_flows_v4)
            };
            // Per-partition share of the global flow budget.
            let per_partition = (max / partitions.len() as u32).max(1);
            if active >= per_partition {
                return Classification {
                    status: ClassificationStatus::Unknown,
                    protocol: AppProtocol::Unknown,
                };
            }
            if fp.v6 {
                part.active_v6 += 1;
            } else {
                part.active_v4 += 1;
            }
            part.flows.insert(
                fp,
                FlowEntry {
                    classification: Classification {
                        status: ClassificationStatus::InProgress,
                        protocol: AppProtocol::Unknown,
                    },
                    trials: 0,
                    user_data: None,
                    last_seen: timestamp,
                },
            );
        }

        let Some(entry) = part.flows.get_mut(&fp) else {
            return Classification {
                status: ClassificationStatus::Unknown,
                protocol: AppProtocol::Unknown,
            };
        };
        entry.last_seen = timestamp;

        if entry.classification.status == ClassificationStatus::InProgress {
            let guess = Self::port_protocol((fp.port_lo, fp.port_hi));
            if guess != AppProtocol::Unknown && settings.enabled.contains(&guess) {
                entry.classification = Classification {
                    status: ClassificationStatus::Identified,
                    protocol: guess,
                };
            } else {
                entry.trials += 1;
                if entry.trials >= settings.max_trials {
                    entry.classification = Classification {
                        status: ClassificationStatus::Unknown,
                        protocol: AppProtocol::Unknown,
                    };
                }
            }
        }

        let result = entry.classification;
        if result.protocol == AppProtocol::Http {
            if let Some(http) = self.http.read().as_ref() {
                let payload = &packet[(prepared.payload_offset as usize).min(packet.len())..];
                if !payload.is_empty() {
                    let info = HttpMessageInfo {
                        fingerprint: fp,
                        chunk_len: payload.len(),
                    };
                    (http.on_body)(&info, payload, &mut entry.user_data);
                }
            }
        }
        result
    }

    fn repartition(&self, num_partitions: usize) -> CoreResult<()> {
        if num_partitions == 0 {
            return Err(CoreError::InvalidParameter("zero partitions".into()));
        }
        let mut partitions = self.partitions.write();
        let mut next: Vec<Mutex<FlowPartition>> = (0..num_partitions)
            .map(|_| Mutex::new(FlowPartition::default()))
            .collect();
        for slot in partitions.drain(..) {
            let old = slot.into_inner();
            for (fp, entry) in old.flows {
                let target = next[fp.partition(num_partitions)].get_mut();
                if fp.v6 {
                    target.active_v6 += 1;
                } else {
                    target.active_v4 += 1;
                }
                target.flows.insert(fp, entry);
            }
        }
        *partitions = next;
        Ok(())
    }

    fn configure(&self, directive: EngineDirective) -> CoreResult<()> {
        use EngineDirective::*;
        let mut settings = self.settings.write();
        let frag_update = |frag: &mut Option<FragSettings>,
                           f: &dyn Fn(&mut FragSettings)|
         -> CoreResult<()> {
            match frag.as_mut() {
                Some(s) => {
                    f(s);
                    Ok(())
                }
                None => Err(CoreError::UnsupportedConfiguration(
                    "fragmentation is disabled".into(),
                )),
            }
        };
        match directive {
            SetMaxTrials(n) => {
                if n == 0 {
                    return Err(CoreError::InvalidParameter("max_trials must be > 0".into()));
                }
                settings.max_trials = n;
            }
            Ipv4FragmentationEnable { table_size } | Ipv6FragmentationEnable { table_size } => {
                if table_size == 0 {
                    return Err(CoreError::InvalidParameter("zero fragmentation table".into()));
                }
                let v6 = matches!(directive, Ipv6FragmentationEnable { .. });
                *Self::frag_settings(&mut settings, v6) = Some(FragSettings {
                    table_size,
                    ..FragSettings::default()
                });
            }
            Ipv4FragmentationDisable => settings.frag_v4 = None,
            Ipv6FragmentationDisable => settings.frag_v6 = None,
            Ipv4FragmentationPerHostLimit(limit) => {
                frag_update(&mut settings.frag_v4, &|s| s.per_host_limit = limit)?
            }
            Ipv6FragmentationPerHostLimit(limit) => {
                frag_update(&mut settings.frag_v6, &|s| s.per_host_limit = limit)?
            }
            Ipv4FragmentationTotalLimit(limit) => {
                frag_update(&mut settings.frag_v4, &|s| s.total_limit = limit)?
            }
            Ipv6FragmentationTotalLimit(limit) => {
                frag_update(&mut settings.frag_v6, &|s| s.total_limit = limit)?
            }
            Ipv4FragmentationReassemblyTimeout(secs) => {
                frag_update(&mut settings.frag_v4, &|s| s.timeout_secs = secs)?
            }
            Ipv6FragmentationReassemblyTimeout(secs) => {
                frag_update(&mut settings.frag_v6, &|s| s.timeout_secs = secs)?
            }
            TcpReorderingEnable => settings.tcp_reordering = true,
            TcpReorderingDisable => settings.tcp_reordering = false,
            ProtocolEnable(p) => {
                settings.enabled.insert(p);
            }
            ProtocolDisable(p) => {
                settings.enabled.remove(&p);
            }
            InspectAll => settings.enabled = EngineSettings::all_protocols(),
            InspectNothing => settings.enabled.clear(),
        }
        Ok(())
    }

    fn set_flow_cleaner(&self, cleaner: Option<FlowCleaner>) -> CoreResult<()> {
        *self.cleaner.write() = cleaner;
        Ok(())
    }

    fn http_activate_callbacks(&self, callbacks: HttpCallbacks) -> CoreResult<()> {
        *self.http.write() = Some(callbacks);
        Ok(())
    }

    fn http_disable_callbacks(&self) -> CoreResult<()> {
        *self.http.write() = None;
        Ok(())
    }
}

impl Drop for PortClassifierEngine {
    fn drop(&mut self) {
        // Hand surviving per-flow driver state to the cleaner.
        let cleaner = self.cleaner.get_mut().take();
        let Some(cleaner) = cleaner else { return };
        for slot in self.partitions.get_mut().iter_mut() {
            for entry in slot.get_mut().flows.values_mut() {
                if let Some(user_data) = entry.user_data.take() {
                    cleaner(user_data);
                }
            }
        }
    }
}
