use crate::capture::CaptureError;
use config::ProxyKind;

/// Represents all possible errors that can occur in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration was rejected before anything was opened.
    #[error("Invalid config: {0}")]
    Config(#[from] config::Error),

    /// A whitelist pattern could not be compiled.
    #[error("Invalid domain rule `{rule}`: {reason}")]
    InvalidRule { rule: String, reason: String },

    /// The compiled rule set exceeded the regex engine's limits.
    #[error("Failed to compile domain rules: {0}")]
    RuleSet(#[from] regex::Error),

    /// The proxy server address does not resolve to an IPv4 address.
    #[error("Cannot resolve proxy server `{0}` to an IPv4 address")]
    Unresolvable(String),

    /// No route towards the proxy server could be found.
    #[error("No egress interface towards {0}")]
    NoInterface(std::net::Ipv4Addr),

    /// No TCP/IP stack constructor is registered for the proxy kind.
    #[error("Unsupported proxy type: {0}")]
    UnsupportedProxy(ProxyKind),

    /// The TCP/IP stack refused to start or accept packets.
    #[error("TCP/IP stack error: {0}")]
    Stack(String),

    /// The reinjection writer no longer accepts packets.
    #[error("Reinjection writer is closed")]
    WriterClosed,

    /// Error reported by the capture layer.
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Error occurred while performing socket or file I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error occurred during joining blocking tasks.
    #[error("Failed to join pipeline task: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}
