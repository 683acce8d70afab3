//! Broadcast sink: forwards lifecycle events to a push channel.
//!
//! Backed by [`tokio::sync::broadcast`]. Delivery is best-effort -- a slow
//! consumer that falls behind the bounded buffer observes a `Lagged` error
//! on its next `recv` and simply resumes from the oldest retained event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::{BuildId, JobId};

/// A lifecycle event pushed to the websocket layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum BuildEvent {
    NewBuild { build_id: BuildId, timestamp: DateTime<Utc> },
    BuildStopped { build_id: BuildId, timestamp: DateTime<Utc> },
    BuildRestarted { build_id: BuildId, timestamp: DateTime<Utc> },
    JobStatusChanged { job_id: JobId, build_id: BuildId, status: String, timestamp: DateTime<Utc> },
}

/// Non-blocking pub/sub sink for build/job lifecycle events.
#[derive(Clone)]
pub struct BroadcastSink {
    inner: Arc<broadcast::Sender<BuildEvent>>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (inner, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Publish an event to all current subscribers. Never blocks; if there
    /// are no subscribers the event is silently dropped.
    pub fn publish(&self, event: BuildEvent) {
        if self.inner.send(event).is_err() {
            tracing::trace!("build event published with no active subscribers");
        }
    }

    pub fn broadcast_new_build(&self, build_id: BuildId) {
        self.publish(BuildEvent::NewBuild {
            build_id,
            timestamp: Utc::now(),
        });
    }

    pub fn broadcast_build_stopped(&self, build_id: BuildId) {
        self.publish(BuildEvent::BuildStopped {
            build_id,
            timestamp: Utc::now(),
        });
    }

    pub fn broadcast_build_restarted(&self, build_id: BuildId) {
        self.publish(BuildEvent::BuildRestarted {
            build_id,
            timestamp: Utc::now(),
        });
    }

    pub fn broadcast_job_status(&self, job_id: JobId, build_id: BuildId, status: &str) {
        self.publish(BuildEvent::JobStatusChanged {
            job_id,
            build_id,
            status: status.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.inner.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}
