#![forbid(unsafe_code)]

use crate::bridge::UdpBridgeStack;
use config::{Config, ProxyKind};
use engine::{Error, NetStack, StackFactory, StackOutput};
use tracing::{info, warn};

/// Stacks for every supported proxy kind. Both hand packets to the external
/// stack process over the UDP bridge.
pub fn factory() -> StackFactory {
    StackFactory::new()
        .register(ProxyKind::Socks5, socks5)
        .register(ProxyKind::Shadowsocks, shadowsocks)
}

fn socks5(config: &Config, output: StackOutput) -> Result<Box<dyn NetStack>, Error> {
    info!(
        endpoint = %config.server.endpoint(),
        dns = ?config.diversion.dns,
        "socks5 upstream"
    );
    Ok(Box::new(UdpBridgeStack::connect(&config.bridge, output)?))
}

fn shadowsocks(config: &Config, output: StackOutput) -> Result<Box<dyn NetStack>, Error> {
    let server = &config.server;
    let method = required("server.method", server.method.as_deref())?;
    required("server.password", server.password.as_deref())?;
    if let Some(plugin) = &server.plugin {
        warn!(%plugin, "plugins are not launched, start it separately");
    }
    info!(
        endpoint = %server.endpoint(),
        %method,
        dns = ?config.diversion.dns,
        "shadowsocks upstream"
    );
    Ok(Box::new(UdpBridgeStack::connect(&config.bridge, output)?))
}

fn required<'a>(field: &'static str, value: Option<&'a str>) -> Result<&'a str, Error> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(config::Error::Invalid {
            field,
            reason: "required for shadowsocks".into(),
        }
        .into()),
    }
}
