#![forbid(unsafe_code)]

mod bridge;
mod capture;
mod diversion;
mod error;
mod pipeline;
mod server;

pub use bridge::Bridge;
pub use capture::{
    Capture, MAX_BATCH, PRIORITY_RANGE, QUEUE_LENGTH_RANGE, QUEUE_SIZE_RANGE, QUEUE_TIME_RANGE,
    check_range,
};
pub use diversion::Diversion;
pub use error::Error;
pub use pipeline::{IntentErrorPolicy, Pipeline};
pub use server::{ProxyKind, Server};

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of environment variables overriding file values, e.g.
/// `DIVERT_CAPTURE__BATCH_SIZE=64`.
pub const ENV_PREFIX: &str = "DIVERT_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub server: Server,
    pub diversion: Diversion,
    pub capture: Capture,
    pub pipeline: Pipeline,
    pub bridge: Bridge,
}

impl Config {
    /// Built-in defaults only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a single config file (TOML, or JSON for `.json` files) layered
    /// over the defaults, then over environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = existing(path.as_ref())?;
        let figment = Figment::from(Serialized::defaults(Self::default()));
        let figment = if is_json(path) {
            figment.merge(Json::file(path))
        } else {
            figment.merge(Toml::file(path))
        };
        Ok(figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Load the two-file JSON layout: one file describing the proxy server,
    /// one listing processes, whitelist and DNS.
    pub fn load_split(
        server: impl AsRef<Path>,
        diversion: impl AsRef<Path>,
    ) -> Result<Self, Error> {
        let server: Server = Figment::from(Serialized::defaults(Server::default()))
            .merge(Json::file(existing(server.as_ref())?))
            .extract()?;
        let diversion: Diversion = Figment::from(Serialized::defaults(Diversion::default()))
            .merge(Json::file(existing(diversion.as_ref())?))
            .extract()?;

        Ok(Figment::from(Serialized::defaults(Self {
            server,
            diversion,
            ..Default::default()
        }))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?)
    }

    /// Reject values the engine cannot start with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.server.server.trim().is_empty() {
            return Err(Error::Invalid {
                field: "server.server",
                reason: "proxy server address is empty".into(),
            });
        }
        if self.server.server_port == 0 {
            return Err(Error::Invalid {
                field: "server.server_port",
                reason: "port 0 is not routable".into(),
            });
        }
        self.capture.validate()?;
        self.pipeline.validate()?;
        Ok(())
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, Error> {
        Ok(toml_edit::ser::to_string_pretty(self)?)
    }
}

fn existing(path: &Path) -> Result<&Path, Error> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::InvalidPath(path.to_path_buf()))
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}
