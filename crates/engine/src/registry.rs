#![forbid(unsafe_code)]

use crate::flow::FlowKey;
use dashmap::DashSet;

/// Flows decided as diverted.
///
/// Entries are never removed. Sharded, so inserting one key does not block
/// lookups of unrelated keys.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashSet<FlowKey>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `key` was not registered before.
    pub fn insert_if_absent(&self, key: FlowKey) -> bool {
        self.sessions.insert(key)
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.sessions.contains(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
