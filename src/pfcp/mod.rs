//! PFCP control channel: wire codec, request handlers and the control
//! process event loop.

pub mod handlers;
pub mod message;
pub mod server;

pub use handlers::{build_usage_report, SessionManager};
pub use message::{decode_packet, encode_packet, Message, PfcpHeader, PFCP_PORT};
pub use server::{ControlProcess, Event, RxMsg, TxMsg};
