use std::net::IpAddr;

use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet};

/// Canonical 5-tuple of a bidirectional flow. `src` is always the
/// lexicographically smaller endpoint, so both half-duplex directions of a
/// connection produce byte-identical signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowSignature {
    pub proto: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Extracts the canonical signature from an inner IP packet. The boolean is
/// the `is_reverse` bit: set when the observed packet's source address is
/// the canonical one, so the two directions of a flow always disagree on it.
pub fn packet_signature(inner: &[u8]) -> Option<(FlowSignature, bool)> {
    match inner.first()? >> 4 {
        4 => ip4_signature(inner),
        6 => ip6_signature(inner),
        _ => None,
    }
}

fn ports(proto: IpProtocol, l4: &[u8]) -> (u16, u16) {
    match proto {
        // TCP and UDP keep their ports at the same offsets.
        IpProtocol::Tcp | IpProtocol::Udp if l4.len() >= 4 => (
            u16::from_be_bytes([l4[0], l4[1]]),
            u16::from_be_bytes([l4[2], l4[3]]),
        ),
        _ => (0, 0),
    }
}

fn canonical(
    proto: IpProtocol,
    src: IpAddr,
    dst: IpAddr,
    l4: &[u8],
) -> (FlowSignature, bool) {
    let (sp, dp) = ports(proto, l4);
    let is_reverse = src < dst;
    let sig = if is_reverse {
        FlowSignature {
            proto: proto.into(),
            src,
            dst,
            src_port: sp,
            dst_port: dp,
        }
    } else {
        FlowSignature {
            proto: proto.into(),
            src: dst,
            dst: src,
            src_port: dp,
            dst_port: sp,
        }
    };
    (sig, is_reverse)
}

fn ip4_signature(inner: &[u8]) -> Option<(FlowSignature, bool)> {
    let ip = Ipv4Packet::new_checked(inner).ok()?;
    Some(canonical(
        ip.protocol(),
        IpAddr::V4(ip.src_addr().into()),
        IpAddr::V4(ip.dst_addr().into()),
        ip.payload(),
    ))
}

fn ip6_signature(inner: &[u8]) -> Option<(FlowSignature, bool)> {
    let ip = Ipv6Packet::new_checked(inner).ok()?;
    Some(canonical(
        ip.next_header(),
        IpAddr::V6(ip.src_addr().into()),
        IpAddr::V6(ip.dst_addr().into()),
        ip.payload(),
    ))
}

/// Mixes the signature down to the hash key used by the flow table. The
/// xor-then-avalanche shape keeps symmetric tuples from clustering.
pub fn hash_signature(sig: &FlowSignature) -> u64 {
    let addrs = match (sig.src, sig.dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            (u32::from(s) as u64) << 32 ^ u32::from(d) as u64
        }
        (s, d) => {
            let mut x = 0u64;
            for chunk in octets(s).chunks(8).chain(octets(d).chunks(8)) {
                let mut b = [0u8; 8];
                b[..chunk.len()].copy_from_slice(chunk);
                x ^= u64::from_be_bytes(b);
            }
            x
        }
    };
    avalanche(
        addrs
            ^ (sig.proto as u64) << 16
            ^ (sig.src_port as u64) << 32
            ^ sig.dst_port as u64,
    )
}

fn octets(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(a) => a.octets().to_vec(),
        IpAddr::V6(a) => a.octets().to_vec(),
    }
}

fn avalanche(mut v: u64) -> u64 {
    v ^= v >> 33;
    v = v.wrapping_mul(0xff51_afd7_ed55_8ccd);
    v ^= v >> 33;
    v = v.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    v ^ (v >> 33)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ip4_tcp_packet, ip4_udp_packet};

    #[test]
    fn both_directions_share_a_signature() {
        let fwd = ip4_tcp_packet([10, 0, 0, 1], [10, 0, 0, 2], 1111, 80, 0x02, b"");
        let rev = ip4_tcp_packet([10, 0, 0, 2], [10, 0, 0, 1], 80, 1111, 0x12, b"");

        let (sig_f, rev_f) = packet_signature(&fwd).unwrap();
        let (sig_r, rev_r) = packet_signature(&rev).unwrap();

        assert_eq!(sig_f, sig_r);
        assert_ne!(rev_f, rev_r);
        assert_eq!(hash_signature(&sig_f), hash_signature(&sig_r));
    }

    #[test]
    fn canonical_src_is_the_smaller_endpoint() {
        let pkt = ip4_udp_packet([192, 168, 0, 9], [10, 0, 0, 2], 5000, 53, b"x");
        let (sig, is_reverse) = packet_signature(&pkt).unwrap();
        assert_eq!(sig.src, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(sig.dst, "192.168.0.9".parse::<IpAddr>().unwrap());
        // 192.168/16 source sorts above the destination: not reverse.
        assert!(!is_reverse);
        assert_eq!(sig.src_port, 53);
        assert_eq!(sig.dst_port, 5000);
    }

    #[test]
    fn non_transport_protocols_use_zero_ports() {
        let mut pkt = ip4_udp_packet([1, 1, 1, 1], [2, 2, 2, 2], 9, 9, b"");
        pkt[9] = 1; // ICMP
        let (sig, _) = packet_signature(&pkt).unwrap();
        assert_eq!((sig.src_port, sig.dst_port), (0, 0));
        assert_eq!(sig.proto, 1);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(packet_signature(&[]).is_none());
        assert!(packet_signature(&[0x45]).is_none());
        assert!(packet_signature(&[0xf0; 40]).is_none());
    }
}
