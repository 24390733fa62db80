#![forbid(unsafe_code)]

//! Seam towards the user-space TCP/IP stack that terminates diverted flows.

use crate::{error::Error, writer::StackOutput};
use config::{Config, ProxyKind};
use std::{collections::HashMap, fmt, sync::Arc};

/// A TCP/IP stack fed with diverted packets.
///
/// Packets the stack produces for the local host go to the [`StackOutput`]
/// it was built with.
pub trait NetStack: Send + Sync {
    /// Hand one outbound IP packet to the stack.
    fn input(&self, packet: &[u8]) -> Result<(), Error>;

    /// Stop the stack. Further input is an error.
    fn close(&self) -> Result<(), Error>;
}

/// Builds the stack for one proxy kind.
pub type StackCtor =
    Arc<dyn Fn(&Config, StackOutput) -> Result<Box<dyn NetStack>, Error> + Send + Sync>;

/// Proxy kind to stack constructor table, handed to the engine at startup.
#[derive(Clone, Default)]
pub struct StackFactory {
    ctors: HashMap<ProxyKind, StackCtor>,
}

impl fmt::Debug for StackFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ctors.keys()).finish()
    }
}

impl StackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ctor` for `kind`, replacing any previous one.
    pub fn register<F>(mut self, kind: ProxyKind, ctor: F) -> Self
    where
        F: Fn(&Config, StackOutput) -> Result<Box<dyn NetStack>, Error> + Send + Sync + 'static,
    {
        self.ctors.insert(kind, Arc::new(ctor));
        self
    }

    pub fn supports(&self, kind: ProxyKind) -> bool {
        self.ctors.contains_key(&kind)
    }

    /// Build the stack for `config.server.kind`.
    pub fn build(&self, config: &Config, output: StackOutput) -> Result<Box<dyn NetStack>, Error> {
        let kind = config.server.kind;
        let ctor = self.ctors.get(&kind).ok_or(Error::UnsupportedProxy(kind))?;
        ctor(config, output)
    }
}
