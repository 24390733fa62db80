use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use config::Config;
use std::path::{Path, PathBuf};

/// divert-rs: per-process and per-domain traffic diversion
///
/// Connections of the configured processes, and DNS questions for the
/// whitelisted domains, are diverted into a user-space TCP/IP stack that
/// forwards them through a SOCKS5 or Shadowsocks proxy. Everything else is
/// reinjected untouched.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file (TOML, or JSON for `.json` files).
    #[arg(short, long, value_parser = validate_file)]
    pub conffile: Option<PathBuf>,

    /// Proxy server description in the legacy JSON layout.
    #[arg(long, value_parser = validate_file)]
    #[arg(requires = "process_config", conflicts_with = "conffile")]
    pub server_config: Option<PathBuf>,

    /// Process list and whitelist in the legacy JSON layout.
    #[arg(long, value_parser = validate_file)]
    #[arg(requires = "server_config", conflicts_with = "conffile")]
    pub process_config: Option<PathBuf>,

    /// Path to log file.
    ///
    /// Logs go to stderr when unset.
    #[arg(short, long)]
    pub logfile: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    pub dump_config: bool,

    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,
}

impl Cli {
    /// Configuration selected by the command line, defaults when no file is
    /// given.
    pub fn load_config(&self) -> Result<Config, config::Error> {
        match (&self.conffile, &self.server_config, &self.process_config) {
            (Some(path), _, _) => Config::load(path),
            (None, Some(server), Some(process)) => Config::load_split(server, process),
            _ => Ok(Config::new()),
        }
    }
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.is_file() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {path:?}"))
    }
}
