//! Per-packet classification: PDR selection, outer-header removal, flow
//! tracking, one-shot DPI binding, forwarding-action resolution and URR
//! accounting.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use uf_interface::{
    ApplyAction, Direction, DstIntf, FarId, FibTable, NextHop, OuterHeader, OuterHeaderCreation,
    PacketMeta, Pdr, PdrId, RedirectServer, RuleSet, SessionTable, SrcIntf, BufferFlags,
    FAR_REDIRECT_BIT,
};

use crate::adf;
use crate::flowtable::{hash_signature, inner_tcp_flags, packet_signature, FlowTable};

const IP4_UDP_HEADER_LEN: usize = 20 + 8;
const IP6_UDP_HEADER_LEN: usize = 40 + 8;

/// Per-node counters; drops are attributed to the specific cause.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyCounters {
    pub classified: u64,
    pub no_session: u64,
    pub no_pdr: u64,
    pub no_far: u64,
    pub outer_header_mismatch: u64,
    pub malformed: u64,
    pub flow_exhausted: u64,
    pub not_yet: u64,
    pub action_drop: u64,
}

/// Trace record of one classified buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifyTrace {
    pub session_index: u32,
    pub cp_seid: u64,
    pub pdr_id: Option<PdrId>,
    pub far_id: Option<FarId>,
}

pub struct Classifier {
    sessions: Arc<SessionTable>,
    redirect: Arc<dyn RedirectServer>,
    fib: Arc<FibTable>,
    urr_tx: UnboundedSender<u32>,
    pub counters: ClassifyCounters,
}

impl Classifier {
    pub fn new(
        sessions: Arc<SessionTable>,
        redirect: Arc<dyn RedirectServer>,
        fib: Arc<FibTable>,
        urr_tx: UnboundedSender<u32>,
    ) -> Classifier {
        Classifier {
            sessions,
            redirect,
            fib,
            urr_tx,
            counters: ClassifyCounters::default(),
        }
    }

    /// Classifies one decapsulated buffer. Errors never propagate: a packet
    /// that cannot be handled goes to [`NextHop::Drop`] with its cause
    /// counted, and nothing is allocated on that path.
    pub fn process(
        &mut self,
        flows: &mut FlowTable,
        meta: &mut PacketMeta,
        data: &mut BytesMut,
        now: u32,
    ) -> (NextHop, ClassifyTrace) {
        let mut tr = ClassifyTrace {
            session_index: meta.session_index,
            ..ClassifyTrace::default()
        };

        let session = match self.sessions.get(meta.session_index) {
            Some(s) => s,
            None => {
                self.counters.no_session += 1;
                return (NextHop::Drop, tr);
            }
        };
        tr.cp_seid = session.cp_seid;

        // Snapshot of the installed rules; stays valid for this whole
        // packet even if the control process publishes a new version.
        let active = session.active();
        let direction = meta.src_intf.direction();

        if meta.data_offset > data.len() {
            self.counters.malformed += 1;
            return (NextHop::Drop, tr);
        }

        let pdr_idx = match self.match_pdr(&active, meta, direction, &data[meta.data_offset..]) {
            Some(idx) => idx,
            None => {
                self.counters.no_pdr += 1;
                return (NextHop::Drop, tr);
            }
        };
        let pdr = &active.pdrs[pdr_idx];
        meta.pdr_index = Some(pdr_idx as u32);
        tr.pdr_id = Some(pdr.id);

        let far = match pdr.far_id.and_then(|id| active.far_by_id(id)) {
            Some(f) => f,
            None => {
                self.counters.no_far += 1;
                return (NextHop::Drop, tr);
            }
        };
        tr.far_id = Some(far.id);

        // Outer header removal. A shape mismatch drops the packet before
        // any flow state is touched.
        if let Some(removal) = pdr.outer_header_removal {
            if removal != meta.outer {
                self.counters.outer_header_mismatch += 1;
                return (NextHop::Drop, tr);
            }
            let advance = match removal {
                OuterHeader::GtpUdpIp4 | OuterHeader::GtpUdpIp6 => meta.data_offset,
                OuterHeader::UdpIp4 => IP4_UDP_HEADER_LEN,
                OuterHeader::UdpIp6 => IP6_UDP_HEADER_LEN,
            };
            if advance > data.len() {
                self.counters.malformed += 1;
                return (NextHop::Drop, tr);
            }
            data.advance(advance);
            meta.data_offset = meta.data_offset.saturating_sub(advance);
        }

        let inner_len = {
            let inner = &data[meta.data_offset..];

            // Flow tracking on the canonical inner 5-tuple.
            match packet_signature(inner) {
                Some((sig, is_reverse)) => {
                    let sig_hash = hash_signature(&sig);
                    match flows.lookup_or_create(&sig, sig_hash, now, meta.session_index) {
                        Ok((flow_idx, created)) => {
                            let dir_bit = is_reverse as usize;
                            {
                                let flow = flows.get_mut(flow_idx);
                                if created {
                                    flow.initiator_direction = dir_bit as u8;
                                }
                                flow.stats[dir_bit].pkts += 1;
                                flow.stats[dir_bit].bytes += inner.len() as u64;
                                if dir_bit == flow.initiator_direction as usize {
                                    if flow.initiator_pdr_id.is_none() {
                                        flow.initiator_pdr_id = Some(pdr.id);
                                    }
                                } else if flow.responder_pdr_id.is_none() {
                                    flow.responder_pdr_id = Some(pdr.id);
                                }
                            }

                            if let Some(flags) = inner_tcp_flags(inner) {
                                flows.tcp_update(flow_idx, flags, now);
                            }

                            // One-shot application binding.
                            if pdr.app_id.is_some() && flows.get(flow_idx).app_id.is_none() {
                                if let (Some(path_db), Some(host_db)) =
                                    (&pdr.path_db, &pdr.host_db)
                                {
                                    if let Some(app) = adf::parse_ip4_packet(
                                        inner,
                                        path_db.as_ref(),
                                        host_db.as_ref(),
                                    ) {
                                        trace!(app, "flow bound to application");
                                        flows.get_mut(flow_idx).app_id = Some(app);
                                    }
                                }
                            }
                        }
                        Err(_) => {
                            self.counters.flow_exhausted += 1;
                            return (NextHop::Drop, tr);
                        }
                    }
                }
                None => {
                    self.counters.malformed += 1;
                    return (NextHop::Drop, tr);
                }
            }

            inner.len() as u64
        };

        let next = self.apply_far(&active, far, meta);

        // Volume accounting runs for every detected packet, whatever the
        // action turned out to be.
        let dst_intf = far.forward.as_ref().map(|f| f.dst_intf);
        let is_dl = pdr.pdi.src_intf == SrcIntf::Core || dst_intf == Some(DstIntf::Access);
        let is_ul = pdr.pdi.src_intf == SrcIntf::Access || dst_intf == Some(DstIntf::Core);
        self.process_urrs(&active, pdr, inner_len, is_dl, is_ul, meta.session_index);

        if next != NextHop::Drop {
            self.counters.classified += 1;
        }
        (next, tr)
    }

    /// SDF lookup first, TEID wildcard on miss or when no ACL is installed.
    fn match_pdr(
        &self,
        active: &RuleSet,
        meta: &PacketMeta,
        direction: Direction,
        inner: &[u8],
    ) -> Option<usize> {
        if let Some(acl) = &active.sdf[direction as usize] {
            let result = acl.classify(inner, meta.teid);
            if result != 0 {
                let idx = (result - 1) as usize;
                if idx < active.pdrs.len() {
                    return Some(idx);
                }
            }
        }
        let pdr_id = active.wildcard_teid.get(&(meta.src_intf, meta.teid))?;
        active.pdr_index_by_id(*pdr_id)
    }

    fn apply_far(
        &mut self,
        active: &RuleSet,
        far: &uf_interface::Far,
        meta: &mut PacketMeta,
    ) -> NextHop {
        if far.apply_action.contains(ApplyAction::FORWARD) {
            let fwd = match &far.forward {
                Some(f) => f,
                None => {
                    self.counters.no_far += 1;
                    return NextHop::Drop;
                }
            };

            if let Some(creation) = fwd.outer_header_creation {
                if creation.contains(OuterHeaderCreation::GTP_IP4) {
                    NextHop::GtpIp4Encap
                } else if creation.contains(OuterHeaderCreation::GTP_IP6) {
                    NextHop::GtpIp6Encap
                } else {
                    // UDP encapsulation targets are not wired up.
                    self.counters.not_yet += 1;
                    NextHop::Drop
                }
            } else if fwd.redirect.is_some() {
                let fib_index = self.fib.fib_index(fwd.dst_sw_if_index);
                let far_index = active
                    .fars
                    .iter()
                    .position(|f| f.id == far.id)
                    .unwrap_or_default() as u32;
                meta.tx_fib_index = Some(fwd.dst_sw_if_index);
                meta.far_index = Some(far_index | FAR_REDIRECT_BIT);
                meta.connection_index = Some(self.redirect.connection(fib_index));
                NextHop::IpLocal
            } else {
                meta.flags.remove(
                    BufferFlags::OFFLOAD_IP_CKSUM
                        | BufferFlags::OFFLOAD_TCP_CKSUM
                        | BufferFlags::OFFLOAD_UDP_CKSUM,
                );
                meta.tx_fib_index = Some(self.fib.fib_index(fwd.dst_sw_if_index));
                NextHop::IpInput
            }
        } else if far.apply_action.contains(ApplyAction::BUFFER) {
            // Buffering is stubbed in this core.
            self.counters.not_yet += 1;
            NextHop::Drop
        } else {
            self.counters.action_drop += 1;
            NextHop::Drop
        }
    }

    fn process_urrs(
        &mut self,
        active: &RuleSet,
        pdr: &Pdr,
        len: u64,
        is_dl: bool,
        is_ul: bool,
        session_index: u32,
    ) {
        for urr_id in &pdr.urr_ids {
            let urr = match active.urr_by_id(*urr_id) {
                Some(u) => u,
                None => continue,
            };
            urr.volume.account(len, is_ul, is_dl);
            let new_triggers = urr.poll_triggers();
            if !new_triggers.is_empty() {
                trace!(urr = urr.id, ?new_triggers, "usage trigger raised");
                let _ = self.urr_tx.send(session_index);
            }
        }
    }
}
