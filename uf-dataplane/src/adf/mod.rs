//! Application detection: compiled regex databases and the HTTP request
//! sniffing that binds flows to applications.

mod db;
mod http;

pub use db::AdfDb;
pub use http::{parse_http_get, parse_ip4_packet};
