#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Proxy protocol spoken by the upstream server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Socks5,
    Shadowsocks,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socks5 => f.write_str("socks5"),
            Self::Shadowsocks => f.write_str("shadowsocks"),
        }
    }
}

/// Upstream proxy server.
///
/// Field names follow the server JSON layout used by earlier releases, so an
/// old `server.json` deserializes unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Server {
    #[serde(rename = "type")]
    pub kind: ProxyKind,

    /// Host name or IPv4 address of the proxy server.
    ///
    /// Its traffic is excluded from capture, otherwise the proxied connection
    /// itself would be diverted.
    pub server: String,

    pub server_port: u16,

    pub password: Option<String>,

    /// Cipher name (shadowsocks only).
    pub method: Option<String>,

    /// SIP003 plugin executable. Launching plugins is left to the operator.
    pub plugin: Option<String>,

    pub plugin_opts: Option<String>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            kind: ProxyKind::default(),
            server: "127.0.0.1".into(),
            server_port: 1080,
            password: None,
            method: None,
            plugin: None,
            plugin_opts: None,
        }
    }
}

impl Server {
    /// `host:port` form suitable for address resolution.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server, self.server_port)
    }
}
