//! L3/L4 header extraction
//!
//! Packets enter the runtime as raw IP datagrams (link-layer already
//! stripped by the driver). This module pulls out the 5-tuple and the
//! application payload offset; everything deeper is the inspection
//! engine's business.

use crate::flow::{FlowFingerprint, TransportProtocol};

/// Result of L3/L4 preprocessing on one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPacket {
    /// Canonicalized flow identity
    pub fingerprint: FlowFingerprint,
    /// Transport protocol
    pub transport: TransportProtocol,
    /// Offset of the L4 header from the start of the datagram
    pub l4_offset: u16,
    /// Offset of the application payload from the start of the datagram
    pub payload_offset: u16,
}

impl ParsedPacket {
    /// Extract the 5-tuple and payload offset from an IP datagram.
    ///
    /// Returns `None` for truncated datagrams or IP versions other than
    /// 4 and 6. Transport protocols without ports get a zero port pair.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        match data[0] >> 4 {
            4 => Self::parse_v4(data),
            6 => Self::parse_v6(data),
            _ => None,
        }
    }

    fn parse_v4(data: &[u8]) -> Option<Self> {
        if data.len() < 20 {
            return None;
        }
        let ihl = ((data[0] & 0x0f) as usize) * 4;
        if ihl < 20 || data.len() < ihl {
            return None;
        }
        let protocol = data[9];
        let src = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        let dst = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);

        let (src_port, dst_port, payload_offset) = Self::parse_l4(data, ihl, protocol)?;
        Some(Self {
            fingerprint: FlowFingerprint::new_v4(src, dst, src_port, dst_port, protocol),
            transport: TransportProtocol::from_ip_proto(protocol),
            l4_offset: ihl as u16,
            payload_offset,
        })
    }

    fn parse_v6(data: &[u8]) -> Option<Self> {
        // Fixed header only; extension-header chains go to the engine as
        // opaque payload.
        if data.len() < 40 {
            return None;
        }
        let protocol = data[6];
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&data[8..24]);
        dst.copy_from_slice(&data[24..40]);

        let (src_port, dst_port, payload_offset) = Self::parse_l4(data, 40, protocol)?;
        Some(Self {
            fingerprint: FlowFingerprint::new_v6(
                u128::from_be_bytes(src),
                u128::from_be_bytes(dst),
                src_port,
                dst_port,
                protocol,
            ),
            transport: TransportProtocol::from_ip_proto(protocol),
            l4_offset: 40,
            payload_offset,
        })
    }

    fn parse_l4(data: &[u8], l4: usize, protocol: u8) -> Option<(u16, u16, u16)> {
        match protocol {
            // TCP: ports + data offset
            6 => {
                if data.len() < l4 + 20 {
                    return None;
                }
                let src_port = u16::from_be_bytes([data[l4], data[l4 + 1]]);
                let dst_port = u16::from_be_bytes([data[l4 + 2], data[l4 + 3]]);
                let doff = ((data[l4 + 12] >> 4) as usize) * 4;
                if doff < 20 || data.len() < l4 + doff {
                    return None;
                }
                Some((src_port, dst_port, (l4 + doff) as u16))
            }
            // UDP: fixed 8-byte header
            17 => {
                if data.len() < l4 + 8 {
                    return None;
                }
                let src_port = u16::from_be_bytes([data[l4], data[l4 + 1]]);
                let dst_port = u16::from_be_bytes([data[l4 + 2], data[l4 + 3]]);
                Some((src_port, dst_port, (l4 + 8) as u16))
            }
            _ => Some((0, 0, l4 as u16)),
        }
    }

    /// Application payload of `data` according to this parse
    #[inline]
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let off = self.payload_offset as usize;
        if off <= data.len() {
            &data[off..]
        } else {
            &[]
        }
    }
}

#[cfg(test)]
pub mod testutil {
    //! Synthetic datagram builders for the tests below

    /// Build a minimal IPv4/TCP datagram with the given tuple and payload
    pub fn tcp_v4(src: u32, dst: u32, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x45;
        pkt[9] = 6;
        pkt[12..16].copy_from_slice(&src.to_be_bytes());
        pkt[16..20].copy_from_slice(&dst.to_be_bytes());
        pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
        pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
        pkt[32] = 5 << 4; // data offset: 20 bytes
        pkt.extend_from_slice(payload);
        let total = pkt.len() as u16;
        pkt[2..4].copy_from_slice(&total.to_be_bytes());
        pkt
    }

    /// Build a minimal IPv4/UDP datagram
    pub fn udp_v4(src: u32, dst: u32, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 28];
        pkt[0] = 0x45;
        pkt[9] = 17;
        pkt[12..16].copy_from_slice(&src.to_be_bytes());
        pkt[16..20].copy_from_slice(&dst.to_be_bytes());
        pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
        pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
        pkt.extend_from_slice(payload);
        pkt
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{tcp_v4, udp_v4};
    use super::*;

    #[test]
    fn test_parse_tcp_v4() {
        let pkt = tcp_v4(0xc0a80101, 0x0a000001, 12345, 443, b"hello");
        let parsed = ParsedPacket::parse(&pkt).unwrap();
        assert_eq!(parsed.transport, TransportProtocol::Tcp);
        assert_eq!(parsed.l4_offset, 20);
        assert_eq!(parsed.payload_offset, 40);
        assert_eq!(parsed.payload(&pkt), b"hello");
        assert_eq!(parsed.fingerprint.protocol, 6);
    }

    #[test]
    fn test_parse_udp_v4() {
        let pkt = udp_v4(0xc0a80101, 0x08080808, 40000, 53, b"q");
        let parsed = ParsedPacket::parse(&pkt).unwrap();
        assert_eq!(parsed.transport, TransportProtocol::Udp);
        assert_eq!(parsed.payload_offset, 28);
        assert_eq!(parsed.payload(&pkt), b"q");
    }

    #[test]
    fn test_both_directions_same_fingerprint() {
        let fwd = tcp_v4(0xc0a80101, 0x0a000001, 12345, 443, b"");
        let rev = tcp_v4(0x0a000001, 0xc0a80101, 443, 12345, b"");
        let a = ParsedPacket::parse(&fwd).unwrap();
        let b = ParsedPacket::parse(&rev).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_truncated_rejected() {
        assert!(ParsedPacket::parse(&[]).is_none());
        assert!(ParsedPacket::parse(&[0x45, 0, 0]).is_none());
        let mut pkt = tcp_v4(1, 2, 3, 4, b"");
        pkt.truncate(24); // cuts into the TCP header
        assert!(ParsedPacket::parse(&pkt).is_none());
    }

    #[test]
    fn test_non_ip_rejected() {
        assert!(ParsedPacket::parse(&[0x25; 40]).is_none());
    }

    #[test]
    fn test_parse_v6_udp() {
        let mut pkt = vec![0u8; 48];
        pkt[0] = 0x60;
        pkt[6] = 17;
        pkt[23] = 1; // src ::1
        pkt[39] = 2; // dst ::2
        pkt[40..42].copy_from_slice(&5000u16.to_be_bytes());
        pkt[42..44].copy_from_slice(&53u16.to_be_bytes());
        let parsed = ParsedPacket::parse(&pkt).unwrap();
        assert!(parsed.fingerprint.v6);
        assert_eq!(parsed.payload_offset, 48);
    }
}
