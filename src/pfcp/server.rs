//! The control process: a single task owning the PFCP sockets and the
//! event stream. Everything the data plane wants from the control plane
//! arrives here as an event; workers never block on any of it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

use uf_dataplane::TimeoutMsg;
use uf_interface::{Result, SessionTable};

use crate::pfcp::handlers::{build_usage_report, SessionManager};
use crate::pfcp::message::{decode_packet, encode_packet, Message, PfcpHeader, PFCP_PORT};

/// Events consumed by the control process.
#[derive(Debug)]
pub enum Event {
    /// A decoded inbound request.
    Rx(RxMsg),
    /// An already-encoded datagram to push out.
    Notify(TxMsg),
    /// A URR trigger fired for this session.
    Urr(u32),
}

#[derive(Debug)]
pub struct RxMsg {
    pub header: PfcpHeader,
    pub msg: Message,
    pub peer: SocketAddr,
}

#[derive(Debug)]
pub struct TxMsg {
    pub data: Vec<u8>,
    pub peer: SocketAddr,
}

enum Wake {
    Datagram(usize, SocketAddr),
    Datagram6(usize, SocketAddr),
    Event(Event),
    Urr(u32),
    Timeout(TimeoutMsg),
    Tick,
    Shutdown,
}

pub struct ControlProcess {
    manager: SessionManager,
    sessions: Arc<SessionTable>,
    sock4: UdpSocket,
    sock6: Option<UdpSocket>,
    event_tx: UnboundedSender<Event>,
    event_rx: UnboundedReceiver<Event>,
    urr_rx: UnboundedReceiver<u32>,
    timeout_rx: UnboundedReceiver<TimeoutMsg>,
    sequence: u32,
}

impl ControlProcess {
    pub async fn bind(
        bind4: SocketAddr,
        bind6: Option<SocketAddr>,
        manager: SessionManager,
        sessions: Arc<SessionTable>,
        urr_rx: UnboundedReceiver<u32>,
        timeout_rx: UnboundedReceiver<TimeoutMsg>,
    ) -> Result<ControlProcess> {
        let sock4 = UdpSocket::bind(bind4).await?;
        let sock6 = match bind6 {
            Some(addr) => Some(UdpSocket::bind(addr).await?),
            None => None,
        };
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(ControlProcess {
            manager,
            sessions,
            sock4,
            sock6,
            event_tx,
            event_rx,
            urr_rx,
            timeout_rx,
            sequence: 0,
        })
    }

    /// Handle for injecting events from other components.
    pub fn events(&self) -> UnboundedSender<Event> {
        self.event_tx.clone()
    }

    pub async fn run(mut self) {
        let mut buf4 = vec![0u8; 8192];
        let mut buf6 = vec![0u8; 8192];

        loop {
            let wake = {
                let sock6 = &self.sock6;
                tokio::select! {
                    r = self.sock4.recv_from(&mut buf4) => match r {
                        Ok((n, peer)) => Wake::Datagram(n, peer),
                        Err(e) => {
                            warn!(error = %e, "pfcp socket receive failed");
                            Wake::Tick
                        }
                    },
                    r = recv_opt(sock6, &mut buf6) => match r {
                        Ok((n, peer)) => Wake::Datagram6(n, peer),
                        Err(e) => {
                            warn!(error = %e, "pfcp v6 socket receive failed");
                            Wake::Tick
                        }
                    },
                    ev = self.event_rx.recv() => match ev {
                        Some(ev) => Wake::Event(ev),
                        None => Wake::Shutdown,
                    },
                    si = self.urr_rx.recv() => match si {
                        Some(si) => Wake::Urr(si),
                        None => Wake::Shutdown,
                    },
                    msg = self.timeout_rx.recv() => match msg {
                        Some(msg) => Wake::Timeout(msg),
                        None => Wake::Shutdown,
                    },
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Wake::Tick,
                }
            };

            match wake {
                Wake::Datagram(n, peer) => self.on_datagram(&buf4[..n], peer).await,
                Wake::Datagram6(n, peer) => self.on_datagram(&buf6[..n], peer).await,
                Wake::Event(Event::Rx(rx)) => self.on_rx(rx).await,
                Wake::Event(Event::Notify(tx)) => self.send(tx).await,
                Wake::Event(Event::Urr(si)) | Wake::Urr(si) => self.usage_report(si).await,
                Wake::Timeout(msg) => {
                    trace!(
                        session_index = msg.session_index,
                        flow_id = msg.flow_id,
                        pkts = msg.initiator.pkts + msg.responder.pkts,
                        "flow timed out"
                    );
                    self.usage_report(msg.session_index).await;
                }
                // Wait timeouts are benign.
                Wake::Tick => trace!("control process idle"),
                Wake::Shutdown => {
                    debug!("control process event sources closed");
                    return;
                }
            }
        }
    }

    async fn on_datagram(&mut self, data: &[u8], peer: SocketAddr) {
        match decode_packet(data) {
            Ok((header, msg)) => {
                self.on_rx(RxMsg { header, msg, peer }).await;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, len = data.len(), "undecodable datagram");
            }
        }
    }

    async fn on_rx(&mut self, rx: RxMsg) {
        trace!(peer = %rx.peer, msg_type = rx.header.msg_type, "request");
        if let Some((seid, reply)) = self.manager.handle(&rx.header, rx.msg, rx.peer.ip()) {
            // Replies echo the request sequence.
            let data = encode_packet(seid, rx.header.sequence, &reply);
            self.send(TxMsg {
                data,
                peer: rx.peer,
            })
            .await;
        }
    }

    async fn usage_report(&mut self, session_index: u32) {
        let session = match self.sessions.get(session_index) {
            Some(s) => s,
            None => return,
        };
        let report = match build_usage_report(&session) {
            Some(r) => r,
            None => return,
        };

        self.sequence = self.sequence.wrapping_add(1) & 0x00ff_ffff;
        let data = encode_packet(
            session.cp_seid,
            self.sequence,
            &Message::SessionReportRequest(report),
        );
        let peer = SocketAddr::new(session.cp_address, PFCP_PORT);
        self.send(TxMsg { data, peer }).await;
    }

    async fn send(&self, tx: TxMsg) {
        let result = if tx.peer.is_ipv4() {
            self.sock4.send_to(&tx.data, tx.peer).await
        } else {
            match &self.sock6 {
                Some(sock) => sock.send_to(&tx.data, tx.peer).await,
                None => {
                    warn!(peer = %tx.peer, "no v6 socket bound");
                    return;
                }
            }
        };
        if let Err(e) = result {
            warn!(peer = %tx.peer, error = %e, "transmit failed");
        }
    }
}

async fn recv_opt(
    sock: &Option<UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match sock {
        Some(s) => s.recv_from(buf).await,
        None => std::future::pending().await,
    }
}
