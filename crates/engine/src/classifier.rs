#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, trace};

/// Resolves a pid to its executable name.
pub trait ProcessNames: Send {
    /// Executable basename of `pid`, or an empty string if it cannot be
    /// resolved (exited, access denied, ...).
    fn name_for_pid(&mut self, pid: u32) -> String;
}

/// [`ProcessNames`] backed by the OS process table.
pub struct SystemProcessNames {
    system: System,
}

impl SystemProcessNames {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemProcessNames {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessNames for SystemProcessNames {
    fn name_for_pid(&mut self, pid: u32) -> String {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing(),
        );
        self.system
            .process(pid)
            .map(|process| process.name().to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Decides whether a pid belongs to the configured processes.
///
/// Decisions are cached per pid for the lifetime of the classifier. A pid
/// that is reused by another program keeps its first decision.
pub struct ProcessClassifier {
    names: Box<dyn ProcessNames>,
    included: HashSet<String>,
    cache: HashMap<u32, bool>,
}

impl ProcessClassifier {
    /// `processes` are executable names; directories are ignored and names
    /// compare case-insensitively.
    pub fn new<I, S>(names: Box<dyn ProcessNames>, processes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let included = processes
            .into_iter()
            .map(|name| basename(name.as_ref()))
            .filter(|name| !name.is_empty())
            .collect();
        Self {
            names,
            included,
            cache: HashMap::new(),
        }
    }

    pub fn classify(&mut self, pid: u32) -> bool {
        if let Some(&included) = self.cache.get(&pid) {
            return included;
        }

        let name = self.names.name_for_pid(pid);
        if name.is_empty() {
            trace!(pid, "process name unresolved");
            return false;
        }
        let included = self.included.contains(&basename(&name));
        debug!(pid, name = %name, included, "classified process");
        self.cache.insert(pid, included);
        included
    }

    /// Number of cached decisions.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

fn basename(name: &str) -> String {
    name.rsplit(['\\', '/'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
