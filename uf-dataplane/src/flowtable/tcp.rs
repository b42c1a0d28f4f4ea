use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket};

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_ACK: u8 = 0x10;

/// Connection tracking state of a TCP flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed = 0,
    SynSeen,
    Established,
    FinWait,
    Closing,
    ClosedAgain,
    RstSeen,
}

pub const TCP_STATE_COUNT: usize = 7;

/// Compressed view of the flags driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpEvent {
    Syn = 0,
    SynAck,
    Ack,
    Fin,
    Rst,
    Other,
}

pub const TCP_EVENT_COUNT: usize = 6;

/// Classifies a flags byte. RST and FIN dominate, then SYN, then bare ACK.
pub fn tcp_event(flags: u8) -> TcpEvent {
    if flags & TCP_FLAG_RST != 0 {
        TcpEvent::Rst
    } else if flags & TCP_FLAG_FIN != 0 {
        TcpEvent::Fin
    } else if flags & TCP_FLAG_SYN != 0 {
        if flags & TCP_FLAG_ACK != 0 {
            TcpEvent::SynAck
        } else {
            TcpEvent::Syn
        }
    } else if flags & TCP_FLAG_ACK != 0 {
        TcpEvent::Ack
    } else {
        TcpEvent::Other
    }
}

use TcpState::*;

/// `TCP_TRANS[state][event]`, the fixed transition table. Unknown traffic
/// parks in place; a SYN always restarts tracking so port reuse after
/// RST/close is picked up as a fresh handshake.
pub const TCP_TRANS: [[TcpState; TCP_EVENT_COUNT]; TCP_STATE_COUNT] = [
    //          Syn       SynAck       Ack          Fin       Rst      Other
    /* Closed      */ [SynSeen, SynSeen, Established, FinWait, RstSeen, Closed],
    /* SynSeen     */ [SynSeen, Established, Established, FinWait, RstSeen, SynSeen],
    /* Established */ [Established, Established, Established, FinWait, RstSeen, Established],
    /* FinWait     */ [FinWait, FinWait, FinWait, Closing, RstSeen, FinWait],
    /* Closing     */ [SynSeen, Closing, ClosedAgain, Closing, RstSeen, Closing],
    /* ClosedAgain */ [SynSeen, ClosedAgain, ClosedAgain, ClosedAgain, RstSeen, ClosedAgain],
    /* RstSeen     */ [SynSeen, RstSeen, RstSeen, RstSeen, RstSeen, RstSeen],
];

/// Per-state flow lifetime in seconds. Must stay below the wheel span.
pub const TCP_LIFETIME: [u32; TCP_STATE_COUNT] = [10, 30, 300, 30, 15, 5, 5];

pub fn tcp_transition(state: TcpState, event: TcpEvent) -> TcpState {
    TCP_TRANS[state as usize][event as usize]
}

pub fn tcp_lifetime(state: TcpState) -> u32 {
    TCP_LIFETIME[state as usize]
}

/// Flags byte of the TCP header inside an inner IP packet, if it is TCP.
pub fn inner_tcp_flags(inner: &[u8]) -> Option<u8> {
    let l4 = match inner.first()? >> 4 {
        4 => {
            let ip = Ipv4Packet::new_checked(inner).ok()?;
            if ip.protocol() != IpProtocol::Tcp {
                return None;
            }
            ip.payload()
        }
        6 => {
            let ip = Ipv6Packet::new_checked(inner).ok()?;
            if ip.next_header() != IpProtocol::Tcp {
                return None;
            }
            ip.payload()
        }
        _ => return None,
    };
    let tcp = TcpPacket::new_checked(l4).ok()?;
    let mut flags = 0;
    if tcp.fin() {
        flags |= TCP_FLAG_FIN;
    }
    if tcp.syn() {
        flags |= TCP_FLAG_SYN;
    }
    if tcp.rst() {
        flags |= TCP_FLAG_RST;
    }
    if tcp.ack() {
        flags |= TCP_FLAG_ACK;
    }
    Some(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ip4_tcp_packet;

    #[test]
    fn event_classification() {
        assert_eq!(tcp_event(TCP_FLAG_SYN), TcpEvent::Syn);
        assert_eq!(tcp_event(TCP_FLAG_SYN | TCP_FLAG_ACK), TcpEvent::SynAck);
        assert_eq!(tcp_event(TCP_FLAG_ACK), TcpEvent::Ack);
        assert_eq!(tcp_event(TCP_FLAG_FIN | TCP_FLAG_ACK), TcpEvent::Fin);
        assert_eq!(tcp_event(TCP_FLAG_RST | TCP_FLAG_ACK), TcpEvent::Rst);
        assert_eq!(tcp_event(0), TcpEvent::Other);
    }

    #[test]
    fn handshake_walks_to_established() {
        let mut s = TcpState::Closed;
        s = tcp_transition(s, tcp_event(TCP_FLAG_SYN));
        assert_eq!(s, TcpState::SynSeen);
        s = tcp_transition(s, tcp_event(TCP_FLAG_SYN | TCP_FLAG_ACK));
        assert_eq!(s, TcpState::Established);
        s = tcp_transition(s, tcp_event(TCP_FLAG_ACK));
        assert_eq!(s, TcpState::Established);
    }

    #[test]
    fn teardown_walks_to_closed_again() {
        let mut s = TcpState::Established;
        s = tcp_transition(s, TcpEvent::Fin);
        assert_eq!(s, TcpState::FinWait);
        s = tcp_transition(s, TcpEvent::Fin);
        assert_eq!(s, TcpState::Closing);
        s = tcp_transition(s, TcpEvent::Ack);
        assert_eq!(s, TcpState::ClosedAgain);
    }

    #[test]
    fn rst_short_circuits_and_syn_restarts() {
        let s = tcp_transition(TcpState::Established, TcpEvent::Rst);
        assert_eq!(s, TcpState::RstSeen);
        assert_eq!(tcp_transition(s, TcpEvent::Syn), TcpState::SynSeen);
        assert!(tcp_lifetime(TcpState::RstSeen) < tcp_lifetime(TcpState::Established));
    }

    #[test]
    fn flags_extracted_from_inner_packet() {
        let pkt = ip4_tcp_packet(
            [1, 1, 1, 1],
            [2, 2, 2, 2],
            10,
            20,
            TCP_FLAG_SYN | TCP_FLAG_ACK,
            b"",
        );
        assert_eq!(inner_tcp_flags(&pkt), Some(TCP_FLAG_SYN | TCP_FLAG_ACK));

        let mut udp = pkt.clone();
        udp[9] = 17;
        assert_eq!(inner_tcp_flags(&udp), None);
    }
}
