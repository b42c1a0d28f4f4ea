use std::io;
use thiserror::Error;

/// Errors shared by the control plane and the per-packet engine.
///
/// Control-plane operations return these directly; the PFCP dispatcher maps
/// them onto cause codes. The data plane never propagates an `Err` per
/// packet: a failing packet is routed to drop and counted at the node.
#[derive(Debug, Error)]
pub enum Error {
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("regex compile error: {0}")]
    Compile(String),
    #[error("resource exhausted")]
    ResourceExhausted,
    #[error("malformed packet")]
    MalformedPacket,
    #[error("outer header mismatch")]
    OuterHeaderMismatch,
    #[error("unsupported")]
    Unsupported,
    #[error("IO error")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Error {
        Error::InvalidArgument(msg.into())
    }
}
