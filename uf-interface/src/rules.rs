use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::packet::{Direction, DstIntf, OuterHeader, SrcIntf};

pub type AppId = u32;
pub type PdrId = u16;
pub type FarId = u32;
pub type UrrId = u32;

/// A compiled application-detection database. The concrete matcher lives in
/// the data-plane crate; rule sets only hold shared handles to it.
pub trait AdfDatabase: Send + Sync + fmt::Debug {
    /// Scans `data` in block mode; reports the id of the first pattern to
    /// match, none if no pattern matches.
    fn scan(&self, data: &[u8]) -> Option<AppId>;

    /// The `(id, pattern)` pairs the database was compiled from, in order.
    fn patterns(&self) -> Vec<(AppId, String)>;
}

pub type AdfHandle = Arc<dyn AdfDatabase>;

/// Per-direction service-data-flow classifier. The production engine is an
/// external ACL; the data-plane crate ships a reference implementation.
pub trait SdfLookup: Send + Sync + fmt::Debug {
    /// Classifies the inner IP header (with the tunnel id appended the way
    /// the ACL tables expect). Returns a 1-based match index, 0 on miss.
    fn classify(&self, inner: &[u8], teid: u32) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPrefix {
    pub addr: IpAddr,
    pub len: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn single(port: u16) -> PortRange {
        PortRange { min: port, max: port }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.min <= port && port <= self.max
    }
}

/// One service-data-flow filter of a PDI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdfFilter {
    pub proto: Option<u8>,
    pub src: Option<IpPrefix>,
    pub dst: Option<IpPrefix>,
    pub src_port: Option<PortRange>,
    pub dst_port: Option<PortRange>,
}

/// Packet-detection information of a PDR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdi {
    pub src_intf: SrcIntf,
    pub teid: Option<u32>,
    pub ue_addr: Option<IpAddr>,
    pub sdf_filters: Vec<SdfFilter>,
}

/// Packet detection rule. `precedence` orders overlapping detection, lower
/// wins; ties resolve by installation order.
#[derive(Debug, Clone)]
pub struct Pdr {
    pub id: PdrId,
    pub precedence: u32,
    pub pdi: Pdi,
    pub outer_header_removal: Option<OuterHeader>,
    pub app_id: Option<AppId>,
    pub far_id: Option<FarId>,
    pub urr_ids: Vec<UrrId>,
    /// Cached detection databases of `app_id`; refreshed by the registry
    /// whenever the application's rules change.
    pub path_db: Option<AdfHandle>,
    pub host_db: Option<AdfHandle>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ApplyAction: u8 {
        const DROP    = 0x01;
        const FORWARD = 0x02;
        const BUFFER  = 0x04;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OuterHeaderCreation: u16 {
        const GTP_IP4 = 0x01;
        const GTP_IP6 = 0x02;
        const UDP_IP4 = 0x04;
        const UDP_IP6 = 0x08;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInformation {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingParams {
    pub dst_intf: DstIntf,
    pub dst_sw_if_index: u32,
    pub outer_header_creation: Option<OuterHeaderCreation>,
    pub redirect: Option<RedirectInformation>,
}

/// Forwarding action rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Far {
    pub id: FarId,
    pub apply_action: ApplyAction,
    pub forward: Option<ForwardingParams>,
}

bitflags! {
    /// Usage-report trigger bits, wire-compatible with the report IE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsageTrigger: u16 {
        const VOLUME_THRESHOLD = 0x0002;
        const VOLUME_QUOTA     = 0x0100;
    }
}

/// Byte counters split per traffic axis.
#[derive(Debug, Default)]
pub struct VolumeCounters {
    pub ul: AtomicU64,
    pub dl: AtomicU64,
    pub total: AtomicU64,
}

impl VolumeCounters {
    pub fn snapshot(&self) -> VolumeTriple {
        VolumeTriple {
            ul: self.ul.load(Ordering::Relaxed),
            dl: self.dl.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeTriple {
    pub ul: u64,
    pub dl: u64,
    pub total: u64,
}

/// Volume accounting of a URR. Counters are atomic so workers on different
/// cores and the control process compose without ordering requirements.
#[derive(Debug, Default)]
pub struct UrrVolume {
    pub bytes: VolumeCounters,
    pub consumed: VolumeCounters,
    pub threshold: VolumeTriple,
    pub quota: VolumeTriple,
}

impl UrrVolume {
    pub fn account(&self, len: u64, is_ul: bool, is_dl: bool) {
        if is_ul {
            self.bytes.ul.fetch_add(len, Ordering::Relaxed);
            self.consumed.ul.fetch_add(len, Ordering::Relaxed);
        }
        if is_dl {
            self.bytes.dl.fetch_add(len, Ordering::Relaxed);
            self.consumed.dl.fetch_add(len, Ordering::Relaxed);
        }
        self.bytes.total.fetch_add(len, Ordering::Relaxed);
        self.consumed.total.fetch_add(len, Ordering::Relaxed);
    }

    fn check_axis(bytes: u64, consumed: u64, threshold: u64, quota: u64) -> UsageTrigger {
        let mut t = UsageTrigger::empty();
        if quota != 0 && consumed >= quota {
            t |= UsageTrigger::VOLUME_QUOTA;
        }
        if threshold != 0 && bytes > threshold {
            t |= UsageTrigger::VOLUME_THRESHOLD;
        }
        t
    }

    /// Trigger bits currently raised by any axis.
    pub fn triggers(&self) -> UsageTrigger {
        let bytes = self.bytes.snapshot();
        let consumed = self.consumed.snapshot();
        Self::check_axis(bytes.ul, consumed.ul, self.threshold.ul, self.quota.ul)
            | Self::check_axis(bytes.dl, consumed.dl, self.threshold.dl, self.quota.dl)
            | Self::check_axis(
                bytes.total,
                consumed.total,
                self.threshold.total,
                self.quota.total,
            )
    }
}

/// Usage reporting rule. Shared by `Arc` across rule-set versions so the
/// counters survive session modification.
#[derive(Debug, Default)]
pub struct Urr {
    pub id: UrrId,
    pub volume: UrrVolume,
    reported: AtomicU16,
}

impl Urr {
    pub fn new(id: UrrId, threshold: VolumeTriple, quota: VolumeTriple) -> Urr {
        Urr {
            id,
            volume: UrrVolume {
                threshold,
                quota,
                ..UrrVolume::default()
            },
            reported: AtomicU16::new(0),
        }
    }

    /// Trigger bits that fired since the last poll. Workers on different
    /// cores may race here; `fetch_or` makes sure each crossing is observed
    /// exactly once.
    pub fn poll_triggers(&self) -> UsageTrigger {
        let current = self.volume.triggers();
        let prev = self.reported.fetch_or(current.bits(), Ordering::Relaxed);
        UsageTrigger::from_bits_truncate(current.bits() & !prev)
    }

    /// Trigger bits raised so far; what a usage report carries.
    pub fn raised_triggers(&self) -> UsageTrigger {
        UsageTrigger::from_bits_truncate(self.reported.load(Ordering::Relaxed))
    }
}

/// One installed version of a session's rules. Workers read it through an
/// `Arc` snapshot; the control process publishes whole replacement versions.
#[derive(Debug, Default, Clone)]
pub struct RuleSet {
    /// Sorted by `(precedence, installation order)`.
    pub pdrs: Vec<Pdr>,
    pub fars: Vec<Far>,
    pub urrs: Vec<Arc<Urr>>,
    /// Per-direction SDF classifiers, indexed by `Direction`.
    pub sdf: [Option<Arc<dyn SdfLookup>>; 2],
    /// TEID-only matches for PDRs without SDF filters.
    pub wildcard_teid: HashMap<(SrcIntf, u32), PdrId>,
}

impl RuleSet {
    /// Restores the precedence ordering after edits.
    pub fn sort_pdrs(&mut self) {
        self.pdrs.sort_by_key(|p| p.precedence);
    }

    pub fn pdr_by_id(&self, id: PdrId) -> Option<&Pdr> {
        self.pdrs.iter().find(|p| p.id == id)
    }

    pub fn pdr_index_by_id(&self, id: PdrId) -> Option<usize> {
        self.pdrs.iter().position(|p| p.id == id)
    }

    pub fn far_by_id(&self, id: FarId) -> Option<&Far> {
        self.fars.iter().find(|f| f.id == id)
    }

    pub fn urr_by_id(&self, id: UrrId) -> Option<&Arc<Urr>> {
        self.urrs.iter().find(|u| u.id == id)
    }

    /// Minimum-precedence PDR carrying an application binding for the given
    /// direction. Relies on `pdrs` being precedence-sorted.
    pub fn highest_dpi_pdr(&self, direction: Direction) -> Option<&Pdr> {
        self.pdrs
            .iter()
            .find(|p| p.app_id.is_some() && p.pdi.src_intf.direction() == direction)
    }

    /// First PDR bound to `app_id` for the given direction.
    pub fn dpi_pdr_by_app(&self, direction: Direction, app_id: AppId) -> Option<&Pdr> {
        self.pdrs
            .iter()
            .find(|p| p.app_id == Some(app_id) && p.pdi.src_intf.direction() == direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pdr(id: PdrId, precedence: u32, src_intf: SrcIntf, app_id: Option<AppId>) -> Pdr {
        Pdr {
            id,
            precedence,
            pdi: Pdi {
                src_intf,
                teid: None,
                ue_addr: None,
                sdf_filters: Vec::new(),
            },
            outer_header_removal: None,
            app_id,
            far_id: None,
            urr_ids: Vec::new(),
            path_db: None,
            host_db: None,
        }
    }

    #[test]
    fn pdrs_sort_by_precedence_keeps_insertion_order_on_ties() {
        let mut rs = RuleSet::default();
        rs.pdrs.push(pdr(1, 100, SrcIntf::Access, None));
        rs.pdrs.push(pdr(2, 10, SrcIntf::Access, None));
        rs.pdrs.push(pdr(3, 10, SrcIntf::Access, None));
        rs.sort_pdrs();
        let ids: Vec<_> = rs.pdrs.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn highest_dpi_pdr_picks_min_precedence_with_binding() {
        let mut rs = RuleSet::default();
        rs.pdrs.push(pdr(1, 5, SrcIntf::Access, None));
        rs.pdrs.push(pdr(2, 20, SrcIntf::Access, Some(7)));
        rs.pdrs.push(pdr(3, 10, SrcIntf::Access, Some(9)));
        rs.pdrs.push(pdr(4, 1, SrcIntf::Core, Some(3)));
        rs.sort_pdrs();

        assert_eq!(rs.highest_dpi_pdr(Direction::Uplink).unwrap().id, 3);
        assert_eq!(rs.highest_dpi_pdr(Direction::Downlink).unwrap().id, 4);
        assert_eq!(rs.dpi_pdr_by_app(Direction::Uplink, 7).unwrap().id, 2);
        assert!(rs.dpi_pdr_by_app(Direction::Downlink, 7).is_none());
    }

    #[test]
    fn urr_volume_triggers() {
        let urr = Urr::new(
            1,
            VolumeTriple {
                total: 100,
                ..Default::default()
            },
            VolumeTriple {
                ul: 50,
                ..Default::default()
            },
        );
        assert!(urr.volume.triggers().is_empty());

        urr.volume.account(60, true, false);
        assert_eq!(urr.volume.triggers(), UsageTrigger::VOLUME_QUOTA);

        urr.volume.account(60, false, true);
        assert_eq!(
            urr.volume.triggers(),
            UsageTrigger::VOLUME_QUOTA | UsageTrigger::VOLUME_THRESHOLD
        );
    }

    #[test]
    fn urr_accounting_is_per_axis() {
        let urr = Urr::new(9, VolumeTriple::default(), VolumeTriple::default());
        urr.volume.account(10, true, false);
        urr.volume.account(4, false, true);
        let bytes = urr.volume.bytes.snapshot();
        assert_eq!(bytes.ul, 10);
        assert_eq!(bytes.dl, 4);
        assert_eq!(bytes.total, 14);
    }
}
