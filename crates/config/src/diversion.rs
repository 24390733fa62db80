#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// What gets diverted.
///
/// Field names follow the process JSON layout used by earlier releases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Diversion {
    /// Executable basenames whose connections are diverted, e.g. `game.exe`.
    pub processes: Vec<String>,

    /// Ad-block style domain patterns. DNS questions matching any of them are
    /// diverted.
    pub whitelist: Vec<String>,

    /// Upstream DNS server handed to the TCP/IP stack.
    pub dns: Option<String>,
}
