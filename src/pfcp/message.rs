//! PFCP wire codec for the message set the control channel speaks:
//! session establishment, modification, deletion and session reports.
//!
//! Grouped information elements are encoded TLV-in-TLV; unknown IEs inside
//! a group are skipped on decode so peers may send more than we understand.

use std::net::IpAddr;

use bytes::{BufMut, BytesMut};

use uf_interface::{
    ApplyAction, DstIntf, Error, IpPrefix, OuterHeader, OuterHeaderCreation, PortRange, Result,
    SdfFilter, SrcIntf, UsageTrigger, VolumeTriple,
};

pub const PFCP_PORT: u16 = 8805;
pub const PFCP_VERSION: u8 = 1;
/// Session header: flags, type, length, SEID, sequence, spare.
pub const PFCP_HEADER_LEN: usize = 16;

pub const MSG_SESSION_ESTABLISHMENT_REQUEST: u8 = 50;
pub const MSG_SESSION_ESTABLISHMENT_RESPONSE: u8 = 51;
pub const MSG_SESSION_MODIFICATION_REQUEST: u8 = 52;
pub const MSG_SESSION_MODIFICATION_RESPONSE: u8 = 53;
pub const MSG_SESSION_DELETION_REQUEST: u8 = 54;
pub const MSG_SESSION_DELETION_RESPONSE: u8 = 55;
pub const MSG_SESSION_REPORT_REQUEST: u8 = 56;
pub const MSG_SESSION_REPORT_RESPONSE: u8 = 57;

pub const CAUSE_ACCEPTED: u8 = 1;
pub const CAUSE_REQUEST_REJECTED: u8 = 64;
pub const CAUSE_SESSION_CONTEXT_NOT_FOUND: u8 = 65;
pub const CAUSE_MANDATORY_IE_MISSING: u8 = 66;
pub const CAUSE_INVALID_LENGTH: u8 = 68;
pub const CAUSE_RULE_CREATION_FAILURE: u8 = 72;
pub const CAUSE_NO_RESOURCES_AVAILABLE: u8 = 73;

pub const REPORT_TYPE_USAR: u8 = 0x02;

const IE_CREATE_PDR: u16 = 1;
const IE_PDI: u16 = 2;
const IE_CREATE_FAR: u16 = 3;
const IE_FORWARDING_PARAMETERS: u16 = 4;
const IE_CREATE_URR: u16 = 6;
const IE_UPDATE_PDR: u16 = 9;
const IE_UPDATE_FAR: u16 = 10;
const IE_UPDATE_URR: u16 = 13;
const IE_REMOVE_PDR: u16 = 15;
const IE_REMOVE_FAR: u16 = 16;
const IE_REMOVE_URR: u16 = 17;
const IE_CAUSE: u16 = 19;
const IE_SOURCE_INTERFACE: u16 = 20;
const IE_F_TEID: u16 = 21;
const IE_NETWORK_INSTANCE: u16 = 22;
const IE_SDF_FILTER: u16 = 23;
const IE_APPLICATION_ID: u16 = 24;
const IE_PRECEDENCE: u16 = 29;
const IE_VOLUME_THRESHOLD: u16 = 31;
const IE_REDIRECT_INFORMATION: u16 = 38;
const IE_REPORT_TYPE: u16 = 39;
const IE_DESTINATION_INTERFACE: u16 = 42;
const IE_APPLY_ACTION: u16 = 44;
const IE_PDR_ID: u16 = 56;
const IE_F_SEID: u16 = 57;
const IE_USAGE_REPORT_TRIGGER: u16 = 63;
const IE_VOLUME_MEASUREMENT: u16 = 66;
const IE_VOLUME_QUOTA: u16 = 73;
const IE_USAGE_REPORT: u16 = 80;
const IE_URR_ID: u16 = 81;
const IE_FAR_ID: u16 = 108;
const IE_OUTER_HEADER_CREATION: u16 = 84;
const IE_UE_IP_ADDRESS: u16 = 93;
const IE_OUTER_HEADER_REMOVAL: u16 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfcpHeader {
    pub msg_type: u8,
    pub seid: u64,
    pub sequence: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FTeid {
    pub teid: u32,
    pub addr: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FSeid {
    pub seid: u64,
    pub addr: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdiIe {
    pub src_intf: SrcIntf,
    pub f_teid: Option<FTeid>,
    pub ue_ip: Option<IpAddr>,
    pub sdf_filters: Vec<SdfFilter>,
    pub app_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePdr {
    pub pdr_id: u16,
    pub precedence: u32,
    pub pdi: PdiIe,
    pub outer_header_removal: Option<OuterHeader>,
    pub far_id: Option<u32>,
    pub urr_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingParamsIe {
    pub dst_intf: DstIntf,
    /// Egress interface id; stands in for the network-instance mapping the
    /// full product resolves through its FIB configuration.
    pub network_instance: u32,
    pub outer_header_creation: Option<OuterHeaderCreation>,
    pub redirect: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateFar {
    pub far_id: u32,
    pub apply_action: ApplyAction,
    pub forward: Option<ForwardingParamsIe>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateUrr {
    pub urr_id: u32,
    pub threshold: VolumeTriple,
    pub quota: VolumeTriple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageReportIe {
    pub urr_id: u32,
    pub trigger: UsageTrigger,
    pub volume: VolumeTriple,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionEstablishmentRequest {
    pub f_seid: Option<FSeid>,
    pub pdrs: Vec<CreatePdr>,
    pub fars: Vec<CreateFar>,
    pub urrs: Vec<CreateUrr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEstablishmentResponse {
    pub cause: u8,
    pub up_f_seid: Option<FSeid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionModificationRequest {
    pub create_pdrs: Vec<CreatePdr>,
    pub create_fars: Vec<CreateFar>,
    pub create_urrs: Vec<CreateUrr>,
    pub update_pdrs: Vec<CreatePdr>,
    pub update_fars: Vec<CreateFar>,
    pub update_urrs: Vec<CreateUrr>,
    pub remove_pdrs: Vec<u16>,
    pub remove_fars: Vec<u32>,
    pub remove_urrs: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionModificationResponse {
    pub cause: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDeletionRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDeletionResponse {
    pub cause: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionReportRequest {
    pub report_type: u8,
    pub usage_reports: Vec<UsageReportIe>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReportResponse {
    pub cause: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SessionEstablishmentRequest(SessionEstablishmentRequest),
    SessionEstablishmentResponse(SessionEstablishmentResponse),
    SessionModificationRequest(SessionModificationRequest),
    SessionModificationResponse(SessionModificationResponse),
    SessionDeletionRequest(SessionDeletionRequest),
    SessionDeletionResponse(SessionDeletionResponse),
    SessionReportRequest(SessionReportRequest),
    SessionReportResponse(SessionReportResponse),
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::SessionEstablishmentRequest(_) => MSG_SESSION_ESTABLISHMENT_REQUEST,
            Message::SessionEstablishmentResponse(_) => MSG_SESSION_ESTABLISHMENT_RESPONSE,
            Message::SessionModificationRequest(_) => MSG_SESSION_MODIFICATION_REQUEST,
            Message::SessionModificationResponse(_) => MSG_SESSION_MODIFICATION_RESPONSE,
            Message::SessionDeletionRequest(_) => MSG_SESSION_DELETION_REQUEST,
            Message::SessionDeletionResponse(_) => MSG_SESSION_DELETION_RESPONSE,
            Message::SessionReportRequest(_) => MSG_SESSION_REPORT_REQUEST,
            Message::SessionReportResponse(_) => MSG_SESSION_REPORT_RESPONSE,
        }
    }
}

// ---------------------------------------------------------------- encoding

fn ie<F: FnOnce(&mut BytesMut)>(out: &mut BytesMut, ie_type: u16, body: F) {
    out.put_u16(ie_type);
    let len_at = out.len();
    out.put_u16(0);
    body(out);
    let len = (out.len() - len_at - 2) as u16;
    out[len_at..len_at + 2].copy_from_slice(&len.to_be_bytes());
}

fn put_addr(out: &mut BytesMut, addr: IpAddr) {
    match addr {
        IpAddr::V4(a) => {
            out.put_u8(2);
            out.put_slice(&a.octets());
        }
        IpAddr::V6(a) => {
            out.put_u8(1);
            out.put_slice(&a.octets());
        }
    }
}

fn put_volume(out: &mut BytesMut, ie_type: u16, v: &VolumeTriple) {
    ie(out, ie_type, |out| {
        out.put_u8(0x07); // total + ul + dl present
        out.put_u64(v.total);
        out.put_u64(v.ul);
        out.put_u64(v.dl);
    });
}

fn put_prefix(out: &mut BytesMut, prefix: &IpPrefix) {
    put_addr(out, prefix.addr);
    out.put_u8(prefix.len);
}

fn put_sdf_filter(out: &mut BytesMut, f: &SdfFilter) {
    ie(out, IE_SDF_FILTER, |out| {
        let mut flags = 0u8;
        if f.proto.is_some() {
            flags |= 0x01;
        }
        if f.src.is_some() {
            flags |= 0x02;
        }
        if f.dst.is_some() {
            flags |= 0x04;
        }
        if f.src_port.is_some() {
            flags |= 0x08;
        }
        if f.dst_port.is_some() {
            flags |= 0x10;
        }
        out.put_u8(flags);
        if let Some(p) = f.proto {
            out.put_u8(p);
        }
        if let Some(p) = &f.src {
            put_prefix(out, p);
        }
        if let Some(p) = &f.dst {
            put_prefix(out, p);
        }
        if let Some(r) = &f.src_port {
            out.put_u16(r.min);
            out.put_u16(r.max);
        }
        if let Some(r) = &f.dst_port {
            out.put_u16(r.min);
            out.put_u16(r.max);
        }
    });
}

fn put_pdi(out: &mut BytesMut, pdi: &PdiIe) {
    ie(out, IE_PDI, |out| {
        ie(out, IE_SOURCE_INTERFACE, |out| {
            out.put_u8(pdi.src_intf.to_wire())
        });
        if let Some(f_teid) = &pdi.f_teid {
            ie(out, IE_F_TEID, |out| {
                out.put_u32(f_teid.teid);
                put_addr(out, f_teid.addr);
            });
        }
        if let Some(ue_ip) = pdi.ue_ip {
            ie(out, IE_UE_IP_ADDRESS, |out| put_addr(out, ue_ip));
        }
        for f in &pdi.sdf_filters {
            put_sdf_filter(out, f);
        }
        if let Some(name) = &pdi.app_name {
            ie(out, IE_APPLICATION_ID, |out| {
                out.put_slice(name.as_bytes())
            });
        }
    });
}

// ---------------------------------------------------------------- decoding

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::MalformedPacket);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut v = [0u8; 8];
        v.copy_from_slice(b);
        Ok(u64::from_be_bytes(v))
    }

    /// Next TLV inside a group; `None` at end of group.
    fn next_ie(&mut self) -> Result<Option<(u16, &'a [u8])>> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        let ie_type = self.u16()?;
        let len = self.u16()? as usize;
        Ok(Some((ie_type, self.take(len)?)))
    }
}

fn read_addr(r: &mut Reader) -> Result<IpAddr> {
    match r.u8()? {
        2 => {
            let b = r.take(4)?;
            Ok(IpAddr::from([b[0], b[1], b[2], b[3]]))
        }
        1 => {
            let b = r.take(16)?;
            let mut v = [0u8; 16];
            v.copy_from_slice(b);
            Ok(IpAddr::from(v))
        }
        _ => Err(Error::MalformedPacket),
    }
}

fn read_volume(body: &[u8]) -> Result<VolumeTriple> {
    let mut r = Reader::new(body);
    let flags = r.u8()?;
    let mut v = VolumeTriple::default();
    if flags & 0x01 != 0 {
        v.total = r.u64()?;
    }
    if flags & 0x02 != 0 {
        v.ul = r.u64()?;
    }
    if flags & 0x04 != 0 {
        v.dl = r.u64()?;
    }
    Ok(v)
}

fn read_sdf_filter(body: &[u8]) -> Result<SdfFilter> {
    let mut r = Reader::new(body);
    let flags = r.u8()?;
    let mut f = SdfFilter::default();
    if flags & 0x01 != 0 {
        f.proto = Some(r.u8()?);
    }
    if flags & 0x02 != 0 {
        let addr = read_addr(&mut r)?;
        f.src = Some(IpPrefix { addr, len: r.u8()? });
    }
    if flags & 0x04 != 0 {
        let addr = read_addr(&mut r)?;
        f.dst = Some(IpPrefix { addr, len: r.u8()? });
    }
    if flags & 0x08 != 0 {
        f.src_port = Some(PortRange {
            min: r.u16()?,
            max: r.u16()?,
        });
    }
    if flags & 0x10 != 0 {
        f.dst_port = Some(PortRange {
            min: r.u16()?,
            max: r.u16()?,
        });
    }
    Ok(f)
}

fn read_pdi(body: &[u8]) -> Result<PdiIe> {
    let mut r = Reader::new(body);
    let mut src_intf = None;
    let mut pdi = PdiIe {
        src_intf: SrcIntf::Access,
        f_teid: None,
        ue_ip: None,
        sdf_filters: Vec::new(),
        app_name: None,
    };
    while let Some((ie_type, val)) = r.next_ie()? {
        match ie_type {
            IE_SOURCE_INTERFACE => {
                let mut vr = Reader::new(val);
                src_intf =
                    Some(SrcIntf::from_wire(vr.u8()?).ok_or(Error::MalformedPacket)?);
            }
            IE_F_TEID => {
                let mut vr = Reader::new(val);
                pdi.f_teid = Some(FTeid {
                    teid: vr.u32()?,
                    addr: read_addr(&mut vr)?,
                });
            }
            IE_UE_IP_ADDRESS => {
                let mut vr = Reader::new(val);
                pdi.ue_ip = Some(read_addr(&mut vr)?);
            }
            IE_SDF_FILTER => pdi.sdf_filters.push(read_sdf_filter(val)?),
            IE_APPLICATION_ID => {
                pdi.app_name = Some(
                    String::from_utf8(val.to_vec()).map_err(|_| Error::MalformedPacket)?,
                )
            }
            _ => {}
        }
    }
    pdi.src_intf = src_intf.ok_or(Error::MalformedPacket)?;
    Ok(pdi)
}

fn read_pdr(body: &[u8]) -> Result<CreatePdr> {
    let mut r = Reader::new(body);
    let mut pdr_id = None;
    let mut precedence = 0;
    let mut pdi = None;
    let mut outer_header_removal = None;
    let mut far_id = None;
    let mut urr_ids = Vec::new();
    while let Some((ie_type, val)) = r.next_ie()? {
        let mut vr = Reader::new(val);
        match ie_type {
            IE_PDR_ID => pdr_id = Some(vr.u16()?),
            IE_PRECEDENCE => precedence = vr.u32()?,
            IE_PDI => pdi = Some(read_pdi(val)?),
            IE_OUTER_HEADER_REMOVAL => {
                outer_header_removal =
                    Some(OuterHeader::from_wire(vr.u8()?).ok_or(Error::MalformedPacket)?)
            }
            IE_FAR_ID => far_id = Some(vr.u32()?),
            IE_URR_ID => urr_ids.push(vr.u32()?),
            _ => {}
        }
    }
    Ok(CreatePdr {
        pdr_id: pdr_id.ok_or(Error::MalformedPacket)?,
        precedence,
        pdi: pdi.ok_or(Error::MalformedPacket)?,
        outer_header_removal,
        far_id,
        urr_ids,
    })
}

fn read_forwarding_params(body: &[u8]) -> Result<ForwardingParamsIe> {
    let mut r = Reader::new(body);
    let mut dst_intf = None;
    let mut network_instance = 0;
    let mut outer_header_creation = None;
    let mut redirect = None;
    while let Some((ie_type, val)) = r.next_ie()? {
        let mut vr = Reader::new(val);
        match ie_type {
            IE_DESTINATION_INTERFACE => {
                dst_intf = Some(DstIntf::from_wire(vr.u8()?).ok_or(Error::MalformedPacket)?)
            }
            IE_NETWORK_INSTANCE => network_instance = vr.u32()?,
            IE_OUTER_HEADER_CREATION => {
                outer_header_creation = Some(
                    OuterHeaderCreation::from_bits(vr.u16()?).ok_or(Error::MalformedPacket)?,
                )
            }
            IE_REDIRECT_INFORMATION => {
                redirect = Some(
                    String::from_utf8(val.to_vec()).map_err(|_| Error::MalformedPacket)?,
                )
            }
            _ => {}
        }
    }
    Ok(ForwardingParamsIe {
        dst_intf: dst_intf.ok_or(Error::MalformedPacket)?,
        network_instance,
        outer_header_creation,
        redirect,
    })
}

fn read_far(body: &[u8]) -> Result<CreateFar> {
    let mut r = Reader::new(body);
    let mut far_id = None;
    let mut apply_action = ApplyAction::empty();
    let mut forward = None;
    while let Some((ie_type, val)) = r.next_ie()? {
        let mut vr = Reader::new(val);
        match ie_type {
            IE_FAR_ID => far_id = Some(vr.u32()?),
            IE_APPLY_ACTION => {
                apply_action =
                    ApplyAction::from_bits(vr.u8()?).ok_or(Error::MalformedPacket)?
            }
            IE_FORWARDING_PARAMETERS => forward = Some(read_forwarding_params(val)?),
            _ => {}
        }
    }
    Ok(CreateFar {
        far_id: far_id.ok_or(Error::MalformedPacket)?,
        apply_action,
        forward,
    })
}

fn read_urr(body: &[u8]) -> Result<CreateUrr> {
    let mut r = Reader::new(body);
    let mut urr_id = None;
    let mut threshold = VolumeTriple::default();
    let mut quota = VolumeTriple::default();
    while let Some((ie_type, val)) = r.next_ie()? {
        let mut vr = Reader::new(val);
        match ie_type {
            IE_URR_ID => urr_id = Some(vr.u32()?),
            IE_VOLUME_THRESHOLD => threshold = read_volume(val)?,
            IE_VOLUME_QUOTA => quota = read_volume(val)?,
            _ => {}
        }
    }
    Ok(CreateUrr {
        urr_id: urr_id.ok_or(Error::MalformedPacket)?,
        threshold,
        quota,
    })
}

fn read_usage_report(body: &[u8]) -> Result<UsageReportIe> {
    let mut r = Reader::new(body);
    let mut urr_id = None;
    let mut trigger = UsageTrigger::empty();
    let mut volume = VolumeTriple::default();
    while let Some((ie_type, val)) = r.next_ie()? {
        let mut vr = Reader::new(val);
        match ie_type {
            IE_URR_ID => urr_id = Some(vr.u32()?),
            IE_USAGE_REPORT_TRIGGER => {
                trigger = UsageTrigger::from_bits_truncate(vr.u16()?)
            }
            IE_VOLUME_MEASUREMENT => volume = read_volume(val)?,
            _ => {}
        }
    }
    Ok(UsageReportIe {
        urr_id: urr_id.ok_or(Error::MalformedPacket)?,
        trigger,
        volume,
    })
}

fn read_f_seid(body: &[u8]) -> Result<FSeid> {
    let mut r = Reader::new(body);
    let seid = r.u64()?;
    Ok(FSeid {
        seid,
        addr: read_addr(&mut r)?,
    })
}

fn read_cause(body: &[u8]) -> Result<u8> {
    Reader::new(body).u8()
}

// ------------------------------------------------------------ group bodies

impl SessionEstablishmentRequest {
    fn encode(&self, out: &mut BytesMut) {
        if let Some(f_seid) = &self.f_seid {
            ie(out, IE_F_SEID, |out| {
                out.put_u64(f_seid.seid);
                put_addr(out, f_seid.addr);
            });
        }
        for pdr in &self.pdrs {
            encode_pdr(out, IE_CREATE_PDR, pdr);
        }
        for far in &self.fars {
            encode_far(out, IE_CREATE_FAR, far);
        }
        for urr in &self.urrs {
            encode_urr(out, IE_CREATE_URR, urr);
        }
    }

    fn decode(body: &[u8]) -> Result<SessionEstablishmentRequest> {
        let mut r = Reader::new(body);
        let mut msg = SessionEstablishmentRequest::default();
        while let Some((ie_type, val)) = r.next_ie()? {
            match ie_type {
                IE_F_SEID => msg.f_seid = Some(read_f_seid(val)?),
                IE_CREATE_PDR => msg.pdrs.push(read_pdr(val)?),
                IE_CREATE_FAR => msg.fars.push(read_far(val)?),
                IE_CREATE_URR => msg.urrs.push(read_urr(val)?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

fn encode_pdr(out: &mut BytesMut, ie_type: u16, pdr: &CreatePdr) {
    ie(out, ie_type, |out| {
        ie(out, IE_PDR_ID, |out| out.put_u16(pdr.pdr_id));
        ie(out, IE_PRECEDENCE, |out| out.put_u32(pdr.precedence));
        put_pdi(out, &pdr.pdi);
        if let Some(removal) = pdr.outer_header_removal {
            ie(out, IE_OUTER_HEADER_REMOVAL, |out| {
                out.put_u8(removal.to_wire())
            });
        }
        if let Some(far_id) = pdr.far_id {
            ie(out, IE_FAR_ID, |out| out.put_u32(far_id));
        }
        for urr_id in &pdr.urr_ids {
            ie(out, IE_URR_ID, |out| out.put_u32(*urr_id));
        }
    });
}

fn encode_far(out: &mut BytesMut, ie_type: u16, far: &CreateFar) {
    ie(out, ie_type, |out| {
        ie(out, IE_FAR_ID, |out| out.put_u32(far.far_id));
        ie(out, IE_APPLY_ACTION, |out| {
            out.put_u8(far.apply_action.bits())
        });
        if let Some(fwd) = &far.forward {
            ie(out, IE_FORWARDING_PARAMETERS, |out| {
                ie(out, IE_DESTINATION_INTERFACE, |out| {
                    out.put_u8(fwd.dst_intf.to_wire())
                });
                ie(out, IE_NETWORK_INSTANCE, |out| {
                    out.put_u32(fwd.network_instance)
                });
                if let Some(creation) = fwd.outer_header_creation {
                    ie(out, IE_OUTER_HEADER_CREATION, |out| {
                        out.put_u16(creation.bits())
                    });
                }
                if let Some(redirect) = &fwd.redirect {
                    ie(out, IE_REDIRECT_INFORMATION, |out| {
                        out.put_slice(redirect.as_bytes())
                    });
                }
            });
        }
    });
}

fn encode_urr(out: &mut BytesMut, ie_type: u16, urr: &CreateUrr) {
    ie(out, ie_type, |out| {
        ie(out, IE_URR_ID, |out| out.put_u32(urr.urr_id));
        put_volume(out, IE_VOLUME_THRESHOLD, &urr.threshold);
        put_volume(out, IE_VOLUME_QUOTA, &urr.quota);
    });
}

impl SessionEstablishmentResponse {
    fn encode(&self, out: &mut BytesMut) {
        ie(out, IE_CAUSE, |out| out.put_u8(self.cause));
        if let Some(f_seid) = &self.up_f_seid {
            ie(out, IE_F_SEID, |out| {
                out.put_u64(f_seid.seid);
                put_addr(out, f_seid.addr);
            });
        }
    }

    fn decode(body: &[u8]) -> Result<SessionEstablishmentResponse> {
        let mut r = Reader::new(body);
        let mut cause = None;
        let mut up_f_seid = None;
        while let Some((ie_type, val)) = r.next_ie()? {
            match ie_type {
                IE_CAUSE => cause = Some(read_cause(val)?),
                IE_F_SEID => up_f_seid = Some(read_f_seid(val)?),
                _ => {}
            }
        }
        Ok(SessionEstablishmentResponse {
            cause: cause.ok_or(Error::MalformedPacket)?,
            up_f_seid,
        })
    }
}

impl SessionModificationRequest {
    fn encode(&self, out: &mut BytesMut) {
        for id in &self.remove_pdrs {
            ie(out, IE_REMOVE_PDR, |out| {
                ie(out, IE_PDR_ID, |out| out.put_u16(*id))
            });
        }
        for id in &self.remove_fars {
            ie(out, IE_REMOVE_FAR, |out| {
                ie(out, IE_FAR_ID, |out| out.put_u32(*id))
            });
        }
        for id in &self.remove_urrs {
            ie(out, IE_REMOVE_URR, |out| {
                ie(out, IE_URR_ID, |out| out.put_u32(*id))
            });
        }
        for pdr in &self.create_pdrs {
            encode_pdr(out, IE_CREATE_PDR, pdr);
        }
        for far in &self.create_fars {
            encode_far(out, IE_CREATE_FAR, far);
        }
        for urr in &self.create_urrs {
            encode_urr(out, IE_CREATE_URR, urr);
        }
        for pdr in &self.update_pdrs {
            encode_pdr(out, IE_UPDATE_PDR, pdr);
        }
        for far in &self.update_fars {
            encode_far(out, IE_UPDATE_FAR, far);
        }
        for urr in &self.update_urrs {
            encode_urr(out, IE_UPDATE_URR, urr);
        }
    }

    fn decode(body: &[u8]) -> Result<SessionModificationRequest> {
        let mut r = Reader::new(body);
        let mut msg = SessionModificationRequest::default();
        while let Some((ie_type, val)) = r.next_ie()? {
            match ie_type {
                IE_CREATE_PDR => msg.create_pdrs.push(read_pdr(val)?),
                IE_CREATE_FAR => msg.create_fars.push(read_far(val)?),
                IE_CREATE_URR => msg.create_urrs.push(read_urr(val)?),
                IE_UPDATE_PDR => msg.update_pdrs.push(read_pdr(val)?),
                IE_UPDATE_FAR => msg.update_fars.push(read_far(val)?),
                IE_UPDATE_URR => msg.update_urrs.push(read_urr(val)?),
                IE_REMOVE_PDR => {
                    let mut gr = Reader::new(val);
                    while let Some((t, v)) = gr.next_ie()? {
                        if t == IE_PDR_ID {
                            msg.remove_pdrs.push(Reader::new(v).u16()?);
                        }
                    }
                }
                IE_REMOVE_FAR => {
                    let mut gr = Reader::new(val);
                    while let Some((t, v)) = gr.next_ie()? {
                        if t == IE_FAR_ID {
                            msg.remove_fars.push(Reader::new(v).u32()?);
                        }
                    }
                }
                IE_REMOVE_URR => {
                    let mut gr = Reader::new(val);
                    while let Some((t, v)) = gr.next_ie()? {
                        if t == IE_URR_ID {
                            msg.remove_urrs.push(Reader::new(v).u32()?);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(msg)
    }
}

impl SessionReportRequest {
    fn encode(&self, out: &mut BytesMut) {
        ie(out, IE_REPORT_TYPE, |out| out.put_u8(self.report_type));
        for report in &self.usage_reports {
            ie(out, IE_USAGE_REPORT, |out| {
                ie(out, IE_URR_ID, |out| out.put_u32(report.urr_id));
                ie(out, IE_USAGE_REPORT_TRIGGER, |out| {
                    out.put_u16(report.trigger.bits())
                });
                put_volume(out, IE_VOLUME_MEASUREMENT, &report.volume);
            });
        }
    }

    fn decode(body: &[u8]) -> Result<SessionReportRequest> {
        let mut r = Reader::new(body);
        let mut msg = SessionReportRequest::default();
        while let Some((ie_type, val)) = r.next_ie()? {
            match ie_type {
                IE_REPORT_TYPE => msg.report_type = Reader::new(val).u8()?,
                IE_USAGE_REPORT => msg.usage_reports.push(read_usage_report(val)?),
                _ => {}
            }
        }
        Ok(msg)
    }
}

fn encode_cause_only(out: &mut BytesMut, cause: u8) {
    ie(out, IE_CAUSE, |out| out.put_u8(cause));
}

fn decode_cause_only(body: &[u8]) -> Result<u8> {
    let mut r = Reader::new(body);
    while let Some((ie_type, val)) = r.next_ie()? {
        if ie_type == IE_CAUSE {
            return read_cause(val);
        }
    }
    Err(Error::MalformedPacket)
}

// ------------------------------------------------------------- datagrams

impl Message {
    pub fn encode_body(&self) -> BytesMut {
        let mut out = BytesMut::new();
        match self {
            Message::SessionEstablishmentRequest(m) => m.encode(&mut out),
            Message::SessionEstablishmentResponse(m) => m.encode(&mut out),
            Message::SessionModificationRequest(m) => m.encode(&mut out),
            Message::SessionModificationResponse(m) => encode_cause_only(&mut out, m.cause),
            Message::SessionDeletionRequest(_) => {}
            Message::SessionDeletionResponse(m) => encode_cause_only(&mut out, m.cause),
            Message::SessionReportRequest(m) => m.encode(&mut out),
            Message::SessionReportResponse(m) => encode_cause_only(&mut out, m.cause),
        }
        out
    }

    pub fn decode_body(msg_type: u8, body: &[u8]) -> Result<Message> {
        Ok(match msg_type {
            MSG_SESSION_ESTABLISHMENT_REQUEST => Message::SessionEstablishmentRequest(
                SessionEstablishmentRequest::decode(body)?,
            ),
            MSG_SESSION_ESTABLISHMENT_RESPONSE => Message::SessionEstablishmentResponse(
                SessionEstablishmentResponse::decode(body)?,
            ),
            MSG_SESSION_MODIFICATION_REQUEST => Message::SessionModificationRequest(
                SessionModificationRequest::decode(body)?,
            ),
            MSG_SESSION_MODIFICATION_RESPONSE => {
                Message::SessionModificationResponse(SessionModificationResponse {
                    cause: decode_cause_only(body)?,
                })
            }
            MSG_SESSION_DELETION_REQUEST => {
                Message::SessionDeletionRequest(SessionDeletionRequest)
            }
            MSG_SESSION_DELETION_RESPONSE => {
                Message::SessionDeletionResponse(SessionDeletionResponse {
                    cause: decode_cause_only(body)?,
                })
            }
            MSG_SESSION_REPORT_REQUEST => {
                Message::SessionReportRequest(SessionReportRequest::decode(body)?)
            }
            MSG_SESSION_REPORT_RESPONSE => {
                Message::SessionReportResponse(SessionReportResponse {
                    cause: decode_cause_only(body)?,
                })
            }
            _ => return Err(Error::Unsupported),
        })
    }
}

/// Frames a message: version 1, S flag set, `length = total - 4`, SEID in
/// network order, 24-bit sequence.
pub fn encode_packet(seid: u64, sequence: u32, msg: &Message) -> Vec<u8> {
    let body = msg.encode_body();
    let mut out = BytesMut::with_capacity(PFCP_HEADER_LEN + body.len());
    out.put_u8((PFCP_VERSION << 5) | 0x01);
    out.put_u8(msg.msg_type());
    out.put_u16((body.len() + PFCP_HEADER_LEN - 4) as u16);
    out.put_u64(seid);
    out.put_uint(sequence as u64, 3);
    out.put_u8(0);
    out.extend_from_slice(&body);
    out.to_vec()
}

pub fn decode_packet(data: &[u8]) -> Result<(PfcpHeader, Message)> {
    let mut r = Reader::new(data);
    let flags = r.u8()?;
    if flags >> 5 != PFCP_VERSION || flags & 0x01 == 0 {
        return Err(Error::Unsupported);
    }
    let msg_type = r.u8()?;
    let length = r.u16()? as usize;
    let seid = r.u64()?;
    let sequence = r.u24()?;
    r.u8()?; // spare

    let body_len = length
        .checked_sub(PFCP_HEADER_LEN - 4)
        .ok_or(Error::MalformedPacket)?;
    let body = r.take(body_len)?;

    Ok((
        PfcpHeader {
            msg_type,
            seid,
            sequence,
        },
        Message::decode_body(msg_type, body)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uf_interface::PortRange;

    fn sample_pdr() -> CreatePdr {
        CreatePdr {
            pdr_id: 7,
            precedence: 200,
            pdi: PdiIe {
                src_intf: SrcIntf::Access,
                f_teid: Some(FTeid {
                    teid: 0xdead_0001,
                    addr: "198.51.100.7".parse().unwrap(),
                }),
                ue_ip: Some("10.45.0.2".parse().unwrap()),
                sdf_filters: vec![SdfFilter {
                    proto: Some(6),
                    src: Some(IpPrefix {
                        addr: "10.45.0.0".parse().unwrap(),
                        len: 16,
                    }),
                    dst: None,
                    src_port: None,
                    dst_port: Some(PortRange { min: 80, max: 443 }),
                }],
                app_name: Some("video".to_string()),
            },
            outer_header_removal: Some(OuterHeader::GtpUdpIp4),
            far_id: Some(10),
            urr_ids: vec![5, 6],
        }
    }

    fn sample_far() -> CreateFar {
        CreateFar {
            far_id: 10,
            apply_action: ApplyAction::FORWARD,
            forward: Some(ForwardingParamsIe {
                dst_intf: DstIntf::Core,
                network_instance: 3,
                outer_header_creation: Some(OuterHeaderCreation::GTP_IP4),
                redirect: Some("http://portal.invalid/".to_string()),
            }),
        }
    }

    fn sample_urr() -> CreateUrr {
        CreateUrr {
            urr_id: 5,
            threshold: VolumeTriple {
                ul: 1000,
                dl: 2000,
                total: 3000,
            },
            quota: VolumeTriple {
                ul: 0,
                dl: 0,
                total: 50_000,
            },
        }
    }

    fn round_trip(seid: u64, sequence: u32, msg: Message) {
        let wire = encode_packet(seid, sequence, &msg);
        let (header, decoded) = decode_packet(&wire).unwrap();
        assert_eq!(header.msg_type, msg.msg_type());
        assert_eq!(header.seid, seid);
        assert_eq!(header.sequence, sequence);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn establishment_request_round_trip() {
        round_trip(
            0,
            1,
            Message::SessionEstablishmentRequest(SessionEstablishmentRequest {
                f_seid: Some(FSeid {
                    seid: 0xc0ffee,
                    addr: "192.0.2.1".parse().unwrap(),
                }),
                pdrs: vec![sample_pdr()],
                fars: vec![sample_far()],
                urrs: vec![sample_urr()],
            }),
        );
    }

    #[test]
    fn establishment_response_round_trip() {
        round_trip(
            0xc0ffee,
            2,
            Message::SessionEstablishmentResponse(SessionEstablishmentResponse {
                cause: CAUSE_ACCEPTED,
                up_f_seid: Some(FSeid {
                    seid: 42,
                    addr: "2001:db8::1".parse().unwrap(),
                }),
            }),
        );
    }

    #[test]
    fn modification_round_trip() {
        round_trip(
            42,
            3,
            Message::SessionModificationRequest(SessionModificationRequest {
                create_pdrs: vec![sample_pdr()],
                create_fars: vec![sample_far()],
                create_urrs: vec![sample_urr()],
                update_pdrs: vec![sample_pdr()],
                update_fars: vec![sample_far()],
                update_urrs: vec![sample_urr()],
                remove_pdrs: vec![1, 2],
                remove_fars: vec![11],
                remove_urrs: vec![9],
            }),
        );
        round_trip(
            42,
            4,
            Message::SessionModificationResponse(SessionModificationResponse {
                cause: CAUSE_SESSION_CONTEXT_NOT_FOUND,
            }),
        );
    }

    #[test]
    fn deletion_round_trip() {
        round_trip(7, 5, Message::SessionDeletionRequest(SessionDeletionRequest));
        round_trip(
            7,
            6,
            Message::SessionDeletionResponse(SessionDeletionResponse {
                cause: CAUSE_ACCEPTED,
            }),
        );
    }

    #[test]
    fn report_round_trip() {
        round_trip(
            9,
            7,
            Message::SessionReportRequest(SessionReportRequest {
                report_type: REPORT_TYPE_USAR,
                usage_reports: vec![UsageReportIe {
                    urr_id: 5,
                    trigger: UsageTrigger::VOLUME_QUOTA | UsageTrigger::VOLUME_THRESHOLD,
                    volume: VolumeTriple {
                        ul: 1,
                        dl: 2,
                        total: 3,
                    },
                }],
            }),
        );
        round_trip(
            9,
            8,
            Message::SessionReportResponse(SessionReportResponse {
                cause: CAUSE_ACCEPTED,
            }),
        );
    }

    #[test]
    fn header_length_is_total_minus_four() {
        let wire = encode_packet(
            1,
            1,
            &Message::SessionDeletionRequest(SessionDeletionRequest),
        );
        assert_eq!(wire.len(), PFCP_HEADER_LEN);
        let length = u16::from_be_bytes([wire[2], wire[3]]) as usize;
        assert_eq!(length, wire.len() - 4);
    }

    #[test]
    fn truncated_and_foreign_datagrams_are_rejected() {
        let wire = encode_packet(
            1,
            1,
            &Message::SessionReportResponse(SessionReportResponse {
                cause: CAUSE_ACCEPTED,
            }),
        );
        assert!(decode_packet(&wire[..wire.len() - 1]).is_err());
        assert!(decode_packet(&[]).is_err());

        let mut bad_version = wire.clone();
        bad_version[0] = 0x41; // version 2
        assert!(decode_packet(&bad_version).is_err());

        let mut unknown_type = wire;
        unknown_type[1] = 200;
        assert!(decode_packet(&unknown_type).is_err());
    }
}
