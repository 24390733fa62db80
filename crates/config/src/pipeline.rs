#![forbid(unsafe_code)]

use crate::Error;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

/// What the intent watcher does when a receive fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntentErrorPolicy {
    /// Stop the watcher on the first receive error.
    Exit,
    /// Keep receiving, sleeping with exponential backoff between failures.
    #[default]
    Retry,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Pipeline {
    /// Longest time a stack-produced packet waits before reinjection.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub flush_interval: Duration,

    pub intent_errors: IntentErrorPolicy,

    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub retry_backoff_min: Duration,

    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub retry_backoff_max: Duration,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(1),
            intent_errors: IntentErrorPolicy::default(),
            retry_backoff_min: Duration::from_millis(10),
            retry_backoff_max: Duration::from_secs(1),
        }
    }
}

impl Pipeline {
    pub fn validate(&self) -> Result<(), Error> {
        if self.flush_interval.is_zero() {
            return Err(Error::Invalid {
                field: "pipeline.flush_interval",
                reason: "must be at least 1ms".into(),
            });
        }
        if self.retry_backoff_min.is_zero() || self.retry_backoff_min > self.retry_backoff_max {
            return Err(Error::Invalid {
                field: "pipeline.retry_backoff_min",
                reason: format!(
                    "{:?} must be non-zero and not above retry_backoff_max ({:?})",
                    self.retry_backoff_min, self.retry_backoff_max
                ),
            });
        }
        Ok(())
    }
}
