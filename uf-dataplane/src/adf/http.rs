use smoltcp::wire::{IpProtocol, Ipv4Packet, TcpPacket};

use uf_interface::{AdfDatabase, AppId};

/// Shortest TCP payload worth inspecting ("GET /a HTTP..." needs at least
/// the method and a URI byte).
const MIN_HTTP_LEN: usize = 8;

/// Classifies an HTTP GET by matching the request URI against the path
/// database and the Host header value against the host database. Both must
/// report the same application; anything else is "no match" and the flow
/// stays unbound so later packets get another chance.
pub fn parse_http_get(
    payload: &[u8],
    path_db: &dyn AdfDatabase,
    host_db: &dyn AdfDatabase,
) -> Option<AppId> {
    if payload.len() < MIN_HTTP_LEN || !payload.starts_with(b"GET ") {
        return None;
    }

    let rest = &payload[4..];
    let uri_end = rest.iter().position(|&b| b == b' ')?;
    let path_app = path_db.scan(&rest[..uri_end])?;

    let host_app = host_db.scan(host_header_value(payload)?)?;

    if path_app != host_app {
        return None;
    }
    Some(path_app)
}

/// The Host header value: bytes after `Host:` (optional whitespace skipped)
/// up to the terminating `\r`. Absent or unterminated header is a miss.
fn host_header_value(payload: &[u8]) -> Option<&[u8]> {
    let at = payload.windows(5).position(|w| w == b"Host:")?;
    let mut value = &payload[at + 5..];
    while let Some((&b, rest)) = value.split_first() {
        if b == b' ' || b == b'\t' {
            value = rest;
        } else {
            break;
        }
    }
    let end = value.iter().position(|&b| b == b'\r')?;
    Some(&value[..end])
}

/// DPI entry point for an inner IPv4 packet. Non-TCP packets and payloads
/// shorter than the HTTP minimum are skipped; the scan buffer is bounded by
/// the IP total length, never by the raw buffer.
pub fn parse_ip4_packet(
    inner: &[u8],
    path_db: &dyn AdfDatabase,
    host_db: &dyn AdfDatabase,
) -> Option<AppId> {
    let ip = Ipv4Packet::new_checked(inner).ok()?;
    if ip.protocol() != IpProtocol::Tcp {
        return None;
    }

    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    parse_http_get(tcp.payload(), path_db, host_db)
}
