//! Shared data model of the upflow user-plane core: error kinds, the
//! packet-metadata contract between pipeline nodes, the PDR/FAR/URR rule
//! model and the session registry.
//!
//! The crate deliberately contains no packet processing; the per-worker
//! engine lives in `uf-dataplane` and the control plane in `upflow`.

mod error;
pub mod packet;
pub mod rules;
pub mod session;

pub use error::{Error, Result};
pub use packet::{
    BufferFlags, Direction, DstIntf, FibTable, NextHop, NullRedirectServer, OuterHeader,
    PacketMeta, RedirectServer, SrcIntf, FAR_REDIRECT_BIT, INDEX_NONE,
};
pub use rules::{
    AdfDatabase, AdfHandle, AppId, ApplyAction, Far, FarId, ForwardingParams, IpPrefix,
    OuterHeaderCreation, Pdi, Pdr, PdrId, PortRange, RedirectInformation, RuleSet, SdfFilter,
    SdfLookup, Urr, UrrId, UrrVolume, UsageTrigger, VolumeTriple,
};
pub use session::{Session, SessionTable};
