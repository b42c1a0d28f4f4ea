use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Marker for "no index" in dense u32 index spaces.
pub const INDEX_NONE: u32 = u32::MAX;

/// Set on `PacketMeta::far_index` when the packet was attached to a
/// redirect connection.
pub const FAR_REDIRECT_BIT: u32 = 0x8000_0000;

/// Interface class a packet entered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrcIntf {
    Access,
    Core,
    SgiLan,
    CpFunction,
}

/// Interface class a forwarded packet leaves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DstIntf {
    Access,
    Core,
    SgiLan,
    CpFunction,
}

/// Traffic direction relative to the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

impl SrcIntf {
    /// Packets from the access side run uplink, everything else downlink.
    pub fn direction(self) -> Direction {
        match self {
            SrcIntf::Access => Direction::Uplink,
            _ => Direction::Downlink,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            SrcIntf::Access => 0,
            SrcIntf::Core => 1,
            SrcIntf::SgiLan => 2,
            SrcIntf::CpFunction => 3,
        }
    }

    pub fn from_wire(v: u8) -> Option<SrcIntf> {
        Some(match v {
            0 => SrcIntf::Access,
            1 => SrcIntf::Core,
            2 => SrcIntf::SgiLan,
            3 => SrcIntf::CpFunction,
            _ => return None,
        })
    }
}

impl DstIntf {
    pub fn to_wire(self) -> u8 {
        match self {
            DstIntf::Access => 0,
            DstIntf::Core => 1,
            DstIntf::SgiLan => 2,
            DstIntf::CpFunction => 3,
        }
    }

    pub fn from_wire(v: u8) -> Option<DstIntf> {
        Some(match v {
            0 => DstIntf::Access,
            1 => DstIntf::Core,
            2 => DstIntf::SgiLan,
            3 => DstIntf::CpFunction,
            _ => return None,
        })
    }
}

/// Encapsulation shape recorded by the tunnel demux for the bytes in front
/// of the inner IP header. Doubles as the PDR outer-header-removal selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OuterHeader {
    GtpUdpIp4,
    GtpUdpIp6,
    UdpIp4,
    UdpIp6,
}

impl OuterHeader {
    pub fn to_wire(self) -> u8 {
        match self {
            OuterHeader::GtpUdpIp4 => 0,
            OuterHeader::GtpUdpIp6 => 1,
            OuterHeader::UdpIp4 => 2,
            OuterHeader::UdpIp6 => 3,
        }
    }

    pub fn from_wire(v: u8) -> Option<OuterHeader> {
        Some(match v {
            0 => OuterHeader::GtpUdpIp4,
            1 => OuterHeader::GtpUdpIp6,
            2 => OuterHeader::UdpIp4,
            3 => OuterHeader::UdpIp6,
            _ => return None,
        })
    }
}

bitflags! {
    /// Per-buffer offload flags; cleared before handing a decapsulated
    /// packet to the IP input path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u8 {
        const OFFLOAD_IP_CKSUM  = 0x01;
        const OFFLOAD_TCP_CKSUM = 0x02;
        const OFFLOAD_UDP_CKSUM = 0x04;
    }
}

/// Next node a classified buffer is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    Drop,
    GtpIp4Encap,
    GtpIp6Encap,
    IpInput,
    IpLocal,
}

/// Buffer metadata travelling with a packet through the pipeline.
///
/// The demux node fills the identification fields; the classifier writes the
/// routing fields consumed by downstream nodes.
#[derive(Debug, Clone)]
pub struct PacketMeta {
    pub session_index: u32,
    pub teid: u32,
    pub src_intf: SrcIntf,
    pub outer: OuterHeader,
    /// Offset from the start of the buffer to the inner IP header.
    pub data_offset: usize,
    pub flags: BufferFlags,

    // Written by the classifier.
    pub pdr_index: Option<u32>,
    pub far_index: Option<u32>,
    pub connection_index: Option<u32>,
    pub tx_fib_index: Option<u32>,
}

impl PacketMeta {
    pub fn new(
        session_index: u32,
        teid: u32,
        src_intf: SrcIntf,
        outer: OuterHeader,
        data_offset: usize,
    ) -> PacketMeta {
        PacketMeta {
            session_index,
            teid,
            src_intf,
            outer,
            data_offset,
            flags: BufferFlags::empty(),
            pdr_index: None,
            far_index: None,
            connection_index: None,
            tx_fib_index: None,
        }
    }
}

/// Maps an egress interface to the FIB bound to it. Identity for unknown
/// interfaces, which is what a flat test topology wants.
#[derive(Debug, Default, Clone)]
pub struct FibTable {
    map: HashMap<u32, u32>,
}

impl FibTable {
    pub fn new() -> FibTable {
        FibTable::default()
    }

    pub fn bind(&mut self, sw_if_index: u32, fib_index: u32) {
        self.map.insert(sw_if_index, fib_index);
    }

    pub fn fib_index(&self, sw_if_index: u32) -> u32 {
        self.map.get(&sw_if_index).copied().unwrap_or(sw_if_index)
    }
}

/// Hands out redirect connections for FARs carrying redirect information.
/// The actual HTTP redirect service lives outside the core.
pub trait RedirectServer: Send + Sync + fmt::Debug {
    /// Returns the connection index the buffer should be attached to.
    fn connection(&self, fib_index: u32) -> u32;
}

/// Counting stub used in tests and as a default.
#[derive(Debug, Default)]
pub struct NullRedirectServer;

impl RedirectServer for NullRedirectServer {
    fn connection(&self, _fib_index: u32) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intf_wire_round_trip() {
        for v in 0..4u8 {
            assert_eq!(SrcIntf::from_wire(v).unwrap().to_wire(), v);
            assert_eq!(DstIntf::from_wire(v).unwrap().to_wire(), v);
            assert_eq!(OuterHeader::from_wire(v).unwrap().to_wire(), v);
        }
        assert!(SrcIntf::from_wire(4).is_none());
        assert!(OuterHeader::from_wire(9).is_none());
    }

    #[test]
    fn direction_by_interface() {
        assert_eq!(SrcIntf::Access.direction(), Direction::Uplink);
        assert_eq!(SrcIntf::Core.direction(), Direction::Downlink);
        assert_eq!(SrcIntf::SgiLan.direction(), Direction::Downlink);
    }

    #[test]
    fn fib_table_defaults_to_identity() {
        let mut fib = FibTable::new();
        assert_eq!(fib.fib_index(7), 7);
        fib.bind(7, 42);
        assert_eq!(fib.fib_index(7), 42);
    }
}
