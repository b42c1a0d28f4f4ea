//! Typed PFCP request handlers: they mutate the session registry, build
//! rule-set versions and leave the wire framing to the server loop.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use uf_dataplane::sdf::SdfContext;
use uf_interface::{
    Error, Far, ForwardingParams, Pdi, Pdr, RedirectInformation, Result, RuleSet, Session,
    SessionTable, Urr,
};

use crate::apps::AppRegistry;
use crate::pfcp::message::{
    CreateFar, CreatePdr, CreateUrr, FSeid, Message, PfcpHeader, SessionDeletionResponse,
    SessionEstablishmentResponse, SessionModificationResponse, SessionReportRequest,
    UsageReportIe, CAUSE_ACCEPTED, CAUSE_INVALID_LENGTH, CAUSE_MANDATORY_IE_MISSING,
    CAUSE_NO_RESOURCES_AVAILABLE, CAUSE_REQUEST_REJECTED, CAUSE_RULE_CREATION_FAILURE,
    CAUSE_SESSION_CONTEXT_NOT_FOUND, REPORT_TYPE_USAR,
};

/// Maps a control-plane error onto the PFCP cause of the response.
pub fn cause_of(err: &Error) -> u8 {
    match err {
        Error::AlreadyExists => CAUSE_REQUEST_REJECTED,
        Error::NotFound => CAUSE_SESSION_CONTEXT_NOT_FOUND,
        Error::Compile(_) => CAUSE_RULE_CREATION_FAILURE,
        Error::ResourceExhausted => CAUSE_NO_RESOURCES_AVAILABLE,
        Error::MalformedPacket => CAUSE_INVALID_LENGTH,
        _ => CAUSE_REQUEST_REJECTED,
    }
}

pub struct SessionManager {
    sessions: Arc<SessionTable>,
    apps: Arc<Mutex<AppRegistry>>,
    up_address: IpAddr,
}

impl SessionManager {
    pub fn new(
        sessions: Arc<SessionTable>,
        apps: Arc<Mutex<AppRegistry>>,
        up_address: IpAddr,
    ) -> SessionManager {
        SessionManager {
            sessions,
            apps,
            up_address,
        }
    }

    /// Dispatches one decoded request. Returns the SEID to frame the reply
    /// with and the reply itself; `None` for messages that take no reply.
    pub fn handle(
        &self,
        header: &PfcpHeader,
        msg: Message,
        peer: IpAddr,
    ) -> Option<(u64, Message)> {
        match msg {
            Message::SessionEstablishmentRequest(req) => Some(self.establish(req, peer)),
            Message::SessionModificationRequest(req) => Some(self.modify(header, req)),
            Message::SessionDeletionRequest(_) => Some(self.delete(header)),
            Message::SessionReportResponse(resp) => {
                debug!(cause = resp.cause, "session report acknowledged");
                None
            }
            other => {
                warn!(msg_type = other.msg_type(), "unexpected message");
                None
            }
        }
    }

    fn establish(
        &self,
        req: crate::pfcp::message::SessionEstablishmentRequest,
        peer: IpAddr,
    ) -> (u64, Message) {
        let f_seid = match req.f_seid {
            Some(f) => f,
            None => {
                return (
                    0,
                    Message::SessionEstablishmentResponse(SessionEstablishmentResponse {
                        cause: CAUSE_MANDATORY_IE_MISSING,
                        up_f_seid: None,
                    }),
                )
            }
        };

        let session = match self
            .sessions
            .create(f_seid.seid, f_seid.addr, self.up_address, 0)
        {
            Ok(s) => s,
            Err(e) => {
                warn!(cp_seid = f_seid.seid, error = %e, "session setup refused");
                return (
                    f_seid.seid,
                    Message::SessionEstablishmentResponse(SessionEstablishmentResponse {
                        cause: cause_of(&e),
                        up_f_seid: None,
                    }),
                );
            }
        };

        let rules = {
            let apps = self.apps.lock();
            build_ruleset(&apps, &req.pdrs, &req.fars, &req.urrs)
        };
        match rules {
            Ok(rules) => {
                session.publish(rules);
                debug!(
                    cp_seid = session.cp_seid,
                    up_seid = session.up_seid,
                    peer = %peer,
                    "session established"
                );
                (
                    session.cp_seid,
                    Message::SessionEstablishmentResponse(SessionEstablishmentResponse {
                        cause: CAUSE_ACCEPTED,
                        up_f_seid: Some(FSeid {
                            seid: session.up_seid,
                            addr: self.up_address,
                        }),
                    }),
                )
            }
            Err(e) => {
                // Rejected atomically: the half-made session goes away.
                let _ = self.sessions.remove(session.up_seid);
                (
                    f_seid.seid,
                    Message::SessionEstablishmentResponse(SessionEstablishmentResponse {
                        cause: cause_of(&e),
                        up_f_seid: None,
                    }),
                )
            }
        }
    }

    fn modify(
        &self,
        header: &PfcpHeader,
        req: crate::pfcp::message::SessionModificationRequest,
    ) -> (u64, Message) {
        let session = match self.find(header.seid) {
            Some(s) => s,
            None => {
                return (
                    header.seid,
                    Message::SessionModificationResponse(SessionModificationResponse {
                        cause: CAUSE_SESSION_CONTEXT_NOT_FOUND,
                    }),
                )
            }
        };

        let next = {
            let apps = self.apps.lock();
            apply_modification(&apps, &session.active(), &req)
        };
        let cause = match next {
            Ok(rules) => {
                session.publish(rules);
                debug!(up_seid = session.up_seid, "session modified");
                CAUSE_ACCEPTED
            }
            Err(e) => cause_of(&e),
        };
        (
            session.cp_seid,
            Message::SessionModificationResponse(SessionModificationResponse { cause }),
        )
    }

    fn delete(&self, header: &PfcpHeader) -> (u64, Message) {
        match self.find(header.seid) {
            Some(session) => {
                let _ = self.sessions.remove(session.up_seid);
                debug!(up_seid = session.up_seid, "session deleted");
                (
                    session.cp_seid,
                    Message::SessionDeletionResponse(SessionDeletionResponse {
                        cause: CAUSE_ACCEPTED,
                    }),
                )
            }
            None => (
                header.seid,
                Message::SessionDeletionResponse(SessionDeletionResponse {
                    cause: CAUSE_SESSION_CONTEXT_NOT_FOUND,
                }),
            ),
        }
    }

    fn find(&self, seid: u64) -> Option<Arc<Session>> {
        self.sessions
            .by_up_seid(seid)
            .or_else(|| self.sessions.by_cp_seid(seid))
    }
}

/// Builds a usage report covering every URR whose counters crossed a
/// threshold or quota. `None` when the session has no URRs at all.
pub fn build_usage_report(session: &Session) -> Option<SessionReportRequest> {
    let active = session.active();
    if active.urrs.is_empty() {
        return None;
    }

    let usage_reports = active
        .urrs
        .iter()
        .filter_map(|urr| {
            let trigger = urr.volume.triggers();
            if trigger.is_empty() {
                return None;
            }
            Some(UsageReportIe {
                urr_id: urr.id,
                trigger,
                volume: urr.volume.bytes.snapshot(),
            })
        })
        .collect();

    Some(SessionReportRequest {
        report_type: REPORT_TYPE_USAR,
        usage_reports,
    })
}

fn far_from_wire(w: &CreateFar) -> Far {
    Far {
        id: w.far_id,
        apply_action: w.apply_action,
        forward: w.forward.as_ref().map(|f| ForwardingParams {
            dst_intf: f.dst_intf,
            dst_sw_if_index: f.network_instance,
            outer_header_creation: f.outer_header_creation,
            redirect: f.redirect.clone().map(|address| RedirectInformation { address }),
        }),
    }
}

fn urr_from_wire(w: &CreateUrr) -> Arc<Urr> {
    Arc::new(Urr::new(w.urr_id, w.threshold, w.quota))
}

fn pdr_from_wire(apps: &AppRegistry, w: &CreatePdr) -> Result<Pdr> {
    let (app_id, path_db, host_db) = match &w.pdi.app_name {
        Some(name) => {
            let app = apps.app_by_name(name).ok_or(Error::NotFound)?;
            let (path_db, host_db) = apps.handles(app.id);
            (Some(app.id), path_db, host_db)
        }
        None => (None, None, None),
    };

    Ok(Pdr {
        id: w.pdr_id,
        precedence: w.precedence,
        pdi: Pdi {
            src_intf: w.pdi.src_intf,
            teid: w.pdi.f_teid.map(|f| f.teid),
            ue_addr: w.pdi.ue_ip,
            sdf_filters: w.pdi.sdf_filters.clone(),
        },
        outer_header_removal: w.outer_header_removal,
        app_id,
        far_id: w.far_id,
        urr_ids: w.urr_ids.clone(),
        path_db,
        host_db,
    })
}

/// Sorts the PDRs and rebuilds the lookup structures derived from them:
/// per-direction SDF contexts (entries in precedence order, reporting the
/// 1-based position of their PDR) and the TEID wildcard map.
fn index_ruleset(rules: &mut RuleSet) {
    rules.sort_pdrs();

    let mut sdf = [SdfContext::new(), SdfContext::new()];
    rules.wildcard_teid.clear();

    for (pos, pdr) in rules.pdrs.iter().enumerate() {
        let direction = pdr.pdi.src_intf.direction() as usize;
        if pdr.pdi.sdf_filters.is_empty() {
            if let Some(teid) = pdr.pdi.teid {
                rules
                    .wildcard_teid
                    .entry((pdr.pdi.src_intf, teid))
                    .or_insert(pdr.id);
            }
        } else {
            for filter in &pdr.pdi.sdf_filters {
                sdf[direction].push(filter.clone(), pdr.pdi.teid, (pos + 1) as u32);
            }
        }
    }

    let [ul, dl] = sdf;
    rules.sdf = [
        if ul.is_empty() { None } else { Some(Arc::new(ul)) },
        if dl.is_empty() { None } else { Some(Arc::new(dl)) },
    ];
}

fn build_ruleset(
    apps: &AppRegistry,
    pdrs: &[CreatePdr],
    fars: &[CreateFar],
    urrs: &[CreateUrr],
) -> Result<RuleSet> {
    let mut rules = RuleSet::default();
    for far in fars {
        rules.fars.push(far_from_wire(far));
    }
    for urr in urrs {
        rules.urrs.push(urr_from_wire(urr));
    }
    for pdr in pdrs {
        rules.pdrs.push(pdr_from_wire(apps, pdr)?);
    }
    index_ruleset(&mut rules);
    Ok(rules)
}

fn apply_modification(
    apps: &AppRegistry,
    active: &RuleSet,
    req: &crate::pfcp::message::SessionModificationRequest,
) -> Result<RuleSet> {
    let mut rules = active.clone();

    for id in &req.remove_pdrs {
        if rules.pdr_by_id(*id).is_none() {
            return Err(Error::NotFound);
        }
        rules.pdrs.retain(|p| p.id != *id);
    }
    for id in &req.remove_fars {
        if rules.far_by_id(*id).is_none() {
            return Err(Error::NotFound);
        }
        rules.fars.retain(|f| f.id != *id);
    }
    for id in &req.remove_urrs {
        if rules.urr_by_id(*id).is_none() {
            return Err(Error::NotFound);
        }
        rules.urrs.retain(|u| u.id != *id);
    }

    for w in &req.update_pdrs {
        let pdr = pdr_from_wire(apps, w)?;
        let slot = rules
            .pdrs
            .iter_mut()
            .find(|p| p.id == w.pdr_id)
            .ok_or(Error::NotFound)?;
        *slot = pdr;
    }
    for w in &req.update_fars {
        let far = far_from_wire(w);
        let slot = rules
            .fars
            .iter_mut()
            .find(|f| f.id == w.far_id)
            .ok_or(Error::NotFound)?;
        *slot = far;
    }
    for w in &req.update_urrs {
        let urr = urr_from_wire(w);
        let slot = rules
            .urrs
            .iter_mut()
            .find(|u| u.id == w.urr_id)
            .ok_or(Error::NotFound)?;
        *slot = urr;
    }

    for w in &req.create_pdrs {
        if rules.pdr_by_id(w.pdr_id).is_some() {
            return Err(Error::AlreadyExists);
        }
        let pdr = pdr_from_wire(apps, w)?;
        rules.pdrs.push(pdr);
    }
    for w in &req.create_fars {
        if rules.far_by_id(w.far_id).is_some() {
            return Err(Error::AlreadyExists);
        }
        rules.fars.push(far_from_wire(w));
    }
    for w in &req.create_urrs {
        if rules.urr_by_id(w.urr_id).is_some() {
            return Err(Error::AlreadyExists);
        }
        rules.urrs.push(urr_from_wire(w));
    }

    index_ruleset(&mut rules);
    Ok(rules)
}
