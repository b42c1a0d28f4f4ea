use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::fs::read_to_string;

use uf_dataplane::TIMER_DEFAULT_LIFETIME;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// PFCP control-channel bind address (IPv4).
    pub pfcp_bind: SocketAddr,
    /// Optional IPv6 bind for the same service.
    pub pfcp_bind6: Option<SocketAddr>,
    /// Address advertised in UP F-SEIDs.
    pub up_address: IpAddr,
    /// Global cap on concurrently tracked flows.
    pub flows_max: usize,
    /// Default flow lifetime in seconds; adjustable at runtime.
    pub flow_timeout: u32,
    /// Data-plane worker count the embedding driver should spawn.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            pfcp_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8805),
            pfcp_bind6: None,
            up_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            flows_max: 1 << 16,
            flow_timeout: TIMER_DEFAULT_LIFETIME,
            workers: 1,
        }
    }
}

pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let raw = read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}
