//! Agent identity and bridge configuration.
//!
//! The agent's host name scopes broadcast FDB messages (a message targeted
//! at another host is a no-op here), and its local tunnel endpoint IP is
//! stripped from remote-port listings before any flow install.

use serde::Deserialize;

/// Default tunnel bridge name.
pub const DEFAULT_TUNNEL_BRIDGE: &str = "br-tun";

/// Static configuration for one agent process.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Host identity used to filter host-scoped FDB messages.
    pub host: String,

    /// This agent's tunnel endpoint IP, as carried in FDB messages.
    pub local_ip: String,

    /// The OVS bridge carrying tunnel ports.
    #[serde(default = "default_bridge")]
    pub tunnel_bridge: String,
}

fn default_bridge() -> String {
    DEFAULT_TUNNEL_BRIDGE.to_string()
}

impl AgentConfig {
    /// Creates a config with the default tunnel bridge.
    pub fn new(host: impl Into<String>, local_ip: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            local_ip: local_ip.into(),
            tunnel_bridge: default_bridge(),
        }
    }

    /// Loads configuration from `L2POP_*` environment variables.
    ///
    /// `L2POP_HOST` defaults to the system hostname, `L2POP_LOCAL_IP` is
    /// required, `L2POP_TUNNEL_BRIDGE` defaults to `br-tun`.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("L2POP_HOST")
            .ok()
            .or_else(default_hostname)?;
        let local_ip = std::env::var("L2POP_LOCAL_IP").ok()?;
        let tunnel_bridge =
            std::env::var("L2POP_TUNNEL_BRIDGE").unwrap_or_else(|_| default_bridge());
        Some(Self {
            host,
            local_ip,
            tunnel_bridge,
        })
    }
}

fn default_hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
