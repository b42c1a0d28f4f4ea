//! Control plane of the upflow user-plane core.
//!
//! [`Upf`] wires the pieces together: the session and application
//! registries mutated over PFCP, the shared flow budget, and factories for
//! per-worker data-plane engines. The embedding packet driver (the GTP
//! demux is outside this crate) calls [`Upf::new_worker`] once per core and
//! feeds each worker decapsulated buffer batches.

pub mod apps;
pub mod cli;
pub mod config;
pub mod pfcp;

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use uf_dataplane::{Classifier, FlowBudget, FlowTable, TimeoutMsg, Worker};
use uf_interface::{FibTable, NullRedirectServer, RedirectServer, SessionTable};

pub use config::Config;

pub struct Upf {
    pub config: Config,
    pub sessions: Arc<SessionTable>,
    pub apps: Arc<Mutex<apps::AppRegistry>>,
    pub budget: Arc<FlowBudget>,
    pub fib: Arc<FibTable>,
    pub redirect: Arc<dyn RedirectServer>,
    pub flow_timeout: Arc<AtomicU32>,
    urr_tx: UnboundedSender<u32>,
    timeout_tx: UnboundedSender<TimeoutMsg>,
    control_rx: Mutex<Option<ControlChannels>>,
}

/// Receive ends of the worker→control channels; claimed once by the
/// control process.
pub struct ControlChannels {
    pub urr_rx: UnboundedReceiver<u32>,
    pub timeout_rx: UnboundedReceiver<TimeoutMsg>,
}

impl Upf {
    pub fn new(config: Config) -> Upf {
        let sessions = Arc::new(SessionTable::new());
        let apps = Arc::new(Mutex::new(apps::AppRegistry::new(sessions.clone())));
        let (urr_tx, urr_rx) = mpsc::unbounded_channel();
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();

        Upf {
            budget: FlowBudget::new(config.flows_max),
            flow_timeout: Arc::new(AtomicU32::new(config.flow_timeout)),
            sessions,
            apps,
            fib: Arc::new(FibTable::new()),
            redirect: Arc::new(NullRedirectServer),
            urr_tx,
            timeout_tx,
            control_rx: Mutex::new(Some(ControlChannels { urr_rx, timeout_rx })),
            config,
        }
    }

    /// Builds one share-nothing worker engine. Call once per data-plane
    /// core.
    pub fn new_worker(&self) -> Worker {
        let flows = FlowTable::new(
            self.budget.clone(),
            self.timeout_tx.clone(),
            self.flow_timeout.clone(),
        );
        let classifier = Classifier::new(
            self.sessions.clone(),
            self.redirect.clone(),
            self.fib.clone(),
            self.urr_tx.clone(),
        );
        Worker::new(flows, classifier)
    }

    pub fn session_manager(&self) -> pfcp::SessionManager {
        pfcp::SessionManager::new(
            self.sessions.clone(),
            self.apps.clone(),
            self.config.up_address,
        )
    }

    pub fn cli_context(&self) -> cli::CliContext {
        cli::CliContext {
            apps: self.apps.clone(),
            flow_timeout: self.flow_timeout.clone(),
        }
    }

    /// The control process claims the channel receive ends exactly once.
    pub fn take_control_channels(&self) -> Option<ControlChannels> {
        self.control_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pfcp::message::{
        CreateFar, CreatePdr, FSeid, ForwardingParamsIe, Message, PdiIe, PfcpHeader,
        SessionEstablishmentRequest, SessionModificationRequest, CAUSE_ACCEPTED,
        CAUSE_SESSION_CONTEXT_NOT_FOUND, MSG_SESSION_MODIFICATION_REQUEST,
    };
    use bytes::{BufMut, BytesMut};
    use uf_interface::{ApplyAction, DstIntf, NextHop, OuterHeader, PacketMeta, SrcIntf};

    fn header(msg_type: u8, seid: u64) -> PfcpHeader {
        PfcpHeader {
            msg_type,
            seid,
            sequence: 1,
        }
    }

    fn establishment(cp_seid: u64, teid: u32, app: Option<&str>) -> SessionEstablishmentRequest {
        SessionEstablishmentRequest {
            f_seid: Some(FSeid {
                seid: cp_seid,
                addr: "192.0.2.1".parse().unwrap(),
            }),
            pdrs: vec![CreatePdr {
                pdr_id: 1,
                precedence: 100,
                pdi: PdiIe {
                    src_intf: SrcIntf::Access,
                    f_teid: Some(crate::pfcp::message::FTeid {
                        teid,
                        addr: "198.51.100.1".parse().unwrap(),
                    }),
                    ue_ip: None,
                    sdf_filters: Vec::new(),
                    app_name: app.map(Into::into),
                },
                outer_header_removal: Some(OuterHeader::GtpUdpIp4),
                far_id: Some(10),
                urr_ids: Vec::new(),
            }],
            fars: vec![CreateFar {
                far_id: 10,
                apply_action: ApplyAction::FORWARD,
                forward: Some(ForwardingParamsIe {
                    dst_intf: DstIntf::Core,
                    network_instance: 1,
                    outer_header_creation: None,
                    redirect: None,
                }),
            }],
            urrs: Vec::new(),
        }
    }

    #[test]
    fn establish_then_classify_end_to_end() {
        let upf = Upf::new(Config::default());
        let manager = upf.session_manager();

        // Application installed over the admin surface.
        {
            let ctx = upf.cli_context();
            cli::execute(&ctx, "create upf application video").unwrap();
            cli::execute(
                &ctx,
                "upf application video rule 1 add l7 http host ^example\\.com$ path ^/a",
            )
            .unwrap();
        }

        let (seid, reply) = manager
            .handle(
                &header(50, 0),
                Message::SessionEstablishmentRequest(establishment(0x99, 0x5000, Some("video"))),
                "192.0.2.1".parse().unwrap(),
            )
            .unwrap();
        assert_eq!(seid, 0x99);
        let up_seid = match reply {
            Message::SessionEstablishmentResponse(resp) => {
                assert_eq!(resp.cause, CAUSE_ACCEPTED);
                resp.up_f_seid.unwrap().seid
            }
            other => panic!("unexpected reply {:?}", other),
        };

        // One uplink GET through a worker binds and forwards.
        let session = upf.sessions.by_up_seid(up_seid).unwrap();
        let mut worker = upf.new_worker();
        let payload = b"GET /abc HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let inner = build_tcp(payload);
        let mut data = BytesMut::new();
        data.put_bytes(0, 36);
        data.put_slice(&inner);
        let mut batch = vec![(
            PacketMeta::new(
                session.session_index,
                0x5000,
                SrcIntf::Access,
                OuterHeader::GtpUdpIp4,
                36,
            ),
            data,
        )];

        let results = worker.process_batch(1, &mut batch);
        assert_eq!(results[0].0, NextHop::IpInput);
        assert_eq!(results[0].1.cp_seid, 0x99);
        let flow = worker.flows.iter().next().unwrap();
        assert_eq!(flow.app_id, Some(upf.apps.lock().app_by_name("video").unwrap().id));
    }

    #[test]
    fn modification_and_deletion_flow() {
        let upf = Upf::new(Config::default());
        let manager = upf.session_manager();

        let (_, reply) = manager
            .handle(
                &header(50, 0),
                Message::SessionEstablishmentRequest(establishment(0x7, 0x600, None)),
                "192.0.2.1".parse().unwrap(),
            )
            .unwrap();
        let up_seid = match reply {
            Message::SessionEstablishmentResponse(resp) => resp.up_f_seid.unwrap().seid,
            other => panic!("unexpected reply {:?}", other),
        };

        // Remove the only PDR.
        let req = SessionModificationRequest {
            remove_pdrs: vec![1],
            ..Default::default()
        };
        let (seid, reply) = manager
            .handle(
                &header(MSG_SESSION_MODIFICATION_REQUEST, up_seid),
                Message::SessionModificationRequest(req),
                "192.0.2.1".parse().unwrap(),
            )
            .unwrap();
        assert_eq!(seid, 0x7);
        match reply {
            Message::SessionModificationResponse(resp) => assert_eq!(resp.cause, CAUSE_ACCEPTED),
            other => panic!("unexpected reply {:?}", other),
        }
        let session = upf.sessions.by_up_seid(up_seid).unwrap();
        assert!(session.active().pdrs.is_empty());

        // Delete, then the session is gone.
        let (_, reply) = manager
            .handle(
                &header(54, up_seid),
                Message::SessionDeletionRequest(Default::default()),
                "192.0.2.1".parse().unwrap(),
            )
            .unwrap();
        match reply {
            Message::SessionDeletionResponse(resp) => assert_eq!(resp.cause, CAUSE_ACCEPTED),
            other => panic!("unexpected reply {:?}", other),
        }
        let (_, reply) = manager
            .handle(
                &header(54, up_seid),
                Message::SessionDeletionRequest(Default::default()),
                "192.0.2.1".parse().unwrap(),
            )
            .unwrap();
        match reply {
            Message::SessionDeletionResponse(resp) => {
                assert_eq!(resp.cause, CAUSE_SESSION_CONTEXT_NOT_FOUND)
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    fn build_tcp(payload: &[u8]) -> Vec<u8> {
        let total_len = 40 + payload.len();
        let mut pkt = vec![0u8; total_len];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        pkt[8] = 64;
        pkt[9] = 6;
        pkt[12..16].copy_from_slice(&[10, 8, 0, 1]);
        pkt[16..20].copy_from_slice(&[172, 16, 0, 1]);
        let tcp = &mut pkt[20..];
        tcp[0..2].copy_from_slice(&40000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = 0x18;
        tcp[20..].copy_from_slice(payload);
        pkt
    }
}
