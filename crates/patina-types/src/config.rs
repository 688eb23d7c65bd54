use std::net::SocketAddr;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

pub const DEFAULT_EDGE_PORT: u16 = 5656;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(alias = "addr")]
    pub bind_addr: SocketAddr,

    /// Emit backend diagnostics (the `pgaddr` status parameter) during
    /// the handshake.
    #[serde(default)]
    pub dev_mode: bool,

    /// Per-connection compiled-query cache. Fixed at connection
    /// construction.
    #[serde(default = "default_true")]
    pub query_cache: bool,

    #[serde(default = "default_module")]
    pub default_module: CompactString,
}

impl EdgeConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            dev_mode: false,
            query_cache: true,
            default_module: default_module(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_module() -> CompactString {
    CompactString::const_new("default")
}
