//! Reference service-data-flow classifier.
//!
//! The production deployment plugs a hardware-friendly ACL engine in behind
//! [`SdfLookup`]; this linear matcher implements the same contract (1-based
//! hit index, 0 on miss, the tunnel id matched alongside the 5-tuple) and is
//! what the tests and the software-only build run.

use std::net::IpAddr;

use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet};

use uf_interface::{IpPrefix, SdfFilter, SdfLookup};

/// One compiled entry: a filter plus the 1-based result it reports.
#[derive(Debug, Clone)]
struct SdfEntry {
    filter: SdfFilter,
    teid: Option<u32>,
    result: u32,
}

#[derive(Debug, Default)]
pub struct SdfContext {
    entries: Vec<SdfEntry>,
}

#[derive(Debug, Clone, Copy)]
struct FiveTuple {
    proto: u8,
    src: IpAddr,
    dst: IpAddr,
    src_port: u16,
    dst_port: u16,
}

impl SdfContext {
    pub fn new() -> SdfContext {
        SdfContext::default()
    }

    /// Appends a filter reporting `result` on match. Callers add entries in
    /// precedence order; the first hit wins.
    pub fn push(&mut self, filter: SdfFilter, teid: Option<u32>, result: u32) {
        self.entries.push(SdfEntry {
            filter,
            teid,
            result,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn parse(inner: &[u8]) -> Option<FiveTuple> {
        let (proto, src, dst, l4) = match inner.first()? >> 4 {
            4 => {
                let ip = Ipv4Packet::new_checked(inner).ok()?;
                (
                    ip.protocol(),
                    IpAddr::V4(ip.src_addr().into()),
                    IpAddr::V4(ip.dst_addr().into()),
                    ip.payload(),
                )
            }
            6 => {
                let ip = Ipv6Packet::new_checked(inner).ok()?;
                (
                    ip.next_header(),
                    IpAddr::V6(ip.src_addr().into()),
                    IpAddr::V6(ip.dst_addr().into()),
                    ip.payload(),
                )
            }
            _ => return None,
        };

        let (src_port, dst_port) = match proto {
            IpProtocol::Tcp | IpProtocol::Udp if l4.len() >= 4 => (
                u16::from_be_bytes([l4[0], l4[1]]),
                u16::from_be_bytes([l4[2], l4[3]]),
            ),
            _ => (0, 0),
        };

        Some(FiveTuple {
            proto: proto.into(),
            src,
            dst,
            src_port,
            dst_port,
        })
    }

    fn matches(entry: &SdfEntry, tuple: &FiveTuple, teid: u32) -> bool {
        if let Some(want) = entry.teid {
            if want != teid {
                return false;
            }
        }
        let f = &entry.filter;
        if let Some(p) = f.proto {
            if p != tuple.proto {
                return false;
            }
        }
        if let Some(pfx) = &f.src {
            if !prefix_contains(pfx, tuple.src) {
                return false;
            }
        }
        if let Some(pfx) = &f.dst {
            if !prefix_contains(pfx, tuple.dst) {
                return false;
            }
        }
        if let Some(r) = &f.src_port {
            if !r.contains(tuple.src_port) {
                return false;
            }
        }
        if let Some(r) = &f.dst_port {
            if !r.contains(tuple.dst_port) {
                return false;
            }
        }
        true
    }
}

impl SdfLookup for SdfContext {
    fn classify(&self, inner: &[u8], teid: u32) -> u32 {
        let tuple = match Self::parse(inner) {
            Some(t) => t,
            None => return 0,
        };
        for entry in &self.entries {
            if Self::matches(entry, &tuple, teid) {
                return entry.result;
            }
        }
        0
    }
}

fn prefix_contains(prefix: &IpPrefix, addr: IpAddr) -> bool {
    match (prefix.addr, addr) {
        (IpAddr::V4(p), IpAddr::V4(a)) => {
            let len = prefix.len.min(32);
            if len == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - len as u32);
            (u32::from(p) & mask) == (u32::from(a) & mask)
        }
        (IpAddr::V6(p), IpAddr::V6(a)) => {
            let len = prefix.len.min(128);
            if len == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - len as u32);
            (u128::from(p) & mask) == (u128::from(a) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ip4_tcp_packet, ip4_udp_packet};
    use uf_interface::PortRange;

    fn prefix(s: &str, len: u8) -> IpPrefix {
        IpPrefix {
            addr: s.parse().unwrap(),
            len,
        }
    }

    #[test]
    fn first_matching_entry_reports_its_result() {
        let mut ctx = SdfContext::new();
        ctx.push(
            SdfFilter {
                dst_port: Some(PortRange::single(443)),
                ..Default::default()
            },
            None,
            1,
        );
        ctx.push(
            SdfFilter {
                proto: Some(6),
                ..Default::default()
            },
            None,
            2,
        );

        let https = ip4_tcp_packet([10, 0, 0, 1], [1, 2, 3, 4], 5000, 443, 0x18, b"");
        let http = ip4_tcp_packet([10, 0, 0, 1], [1, 2, 3, 4], 5000, 80, 0x18, b"");
        assert_eq!(ctx.classify(&https, 0), 1);
        assert_eq!(ctx.classify(&http, 0), 2);
    }

    #[test]
    fn miss_is_zero() {
        let mut ctx = SdfContext::new();
        ctx.push(
            SdfFilter {
                proto: Some(6),
                ..Default::default()
            },
            None,
            1,
        );
        let udp = ip4_udp_packet([10, 0, 0, 1], [1, 2, 3, 4], 5000, 53, b"");
        assert_eq!(ctx.classify(&udp, 0), 0);
        assert_eq!(ctx.classify(&[], 0), 0);
    }

    #[test]
    fn prefixes_and_teid_narrow_the_match() {
        let mut ctx = SdfContext::new();
        ctx.push(
            SdfFilter {
                src: Some(prefix("10.0.0.0", 24)),
                ..Default::default()
            },
            Some(0x1234),
            5,
        );

        let pkt = ip4_udp_packet([10, 0, 0, 9], [1, 2, 3, 4], 1, 2, b"");
        assert_eq!(ctx.classify(&pkt, 0x1234), 5);
        assert_eq!(ctx.classify(&pkt, 0x9999), 0);

        let other = ip4_udp_packet([10, 0, 1, 9], [1, 2, 3, 4], 1, 2, b"");
        assert_eq!(ctx.classify(&other, 0x1234), 0);
    }

    #[test]
    fn zero_length_prefix_matches_everything() {
        assert!(prefix_contains(
            &prefix("0.0.0.0", 0),
            "203.0.113.9".parse().unwrap()
        ));
    }
}
