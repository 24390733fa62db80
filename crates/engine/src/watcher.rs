#![forbid(unsafe_code)]

use crate::{
    capture::{CaptureError, EventHandle, SocketEvent, SocketEventKind},
    classifier::ProcessClassifier,
    error::Error,
    registry::SessionRegistry,
};
use config::{IntentErrorPolicy, Pipeline};
use std::{sync::Arc, thread, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registers the flows of classified processes as they connect.
pub struct IntentWatcher {
    handle: Arc<dyn EventHandle>,
    classifier: ProcessClassifier,
    registry: Arc<SessionRegistry>,
    batch_size: usize,
    policy: IntentErrorPolicy,
    backoff: (Duration, Duration),
    cancel: CancellationToken,
}

impl IntentWatcher {
    pub fn new(
        handle: Arc<dyn EventHandle>,
        classifier: ProcessClassifier,
        registry: Arc<SessionRegistry>,
        batch_size: usize,
        pipeline: &Pipeline,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handle,
            classifier,
            registry,
            batch_size: batch_size.clamp(1, config::MAX_BATCH),
            policy: pipeline.intent_errors,
            backoff: (pipeline.retry_backoff_min, pipeline.retry_backoff_max),
            cancel,
        }
    }

    /// Register the flow of `event` if its process is included.
    ///
    /// Returns `true` when a new flow was registered.
    pub fn observe(&mut self, event: &SocketEvent) -> bool {
        if event.kind != SocketEventKind::Connect {
            return false;
        }
        let Some(key) = event.flow_key() else {
            return false;
        };
        if !self.classifier.classify(event.pid) {
            return false;
        }
        let inserted = self.registry.insert_if_absent(key);
        if inserted {
            info!(flow = %key, pid = event.pid, "diverting flow");
        }
        inserted
    }

    /// Run until the handle is shut down, or a receive fails and the policy
    /// says to stop. Blocking.
    pub fn run(mut self) -> Result<(), Error> {
        let span = tracing::debug_span!("intent_watcher");
        let _enter = span.enter();

        let (min, max) = self.backoff;
        let mut backoff = min;
        loop {
            let err = match self.handle.recv_events(self.batch_size) {
                Ok(events) => {
                    backoff = min;
                    for event in &events {
                        self.observe(event);
                    }
                    continue;
                }
                Err(CaptureError::Shutdown) => {
                    debug!("intent handle shut down");
                    return Ok(());
                }
                Err(err) => err,
            };

            match self.policy {
                IntentErrorPolicy::Exit => return Err(err.into()),
                IntentErrorPolicy::Retry => {
                    warn!(%err, ?backoff, "failed to receive CONNECT events, retrying");
                    thread::sleep(backoff);
                    if self.cancel.is_cancelled() {
                        return Ok(());
                    }
                    backoff = (backoff * 2).min(max);
                }
            }
        }
    }
}
