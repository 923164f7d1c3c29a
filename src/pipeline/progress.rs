//! Per-session progress stream.
//!
//! Events go out on a broadcast channel in completion order. A subscriber
//! sees only events published after it subscribed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::session::SessionSummary;
use crate::models::{DocumentType, Field, JobState};

/// Event emitted while a session runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    JobStarted {
        session_id: Uuid,
        job_id: Uuid,
        file_name: Option<String>,
    },
    JobCompleted {
        session_id: Uuid,
        job_id: Uuid,
        status: JobState,
        document_type: Option<DocumentType>,
        /// Cleaned field values, present on success.
        partial_fields: Option<BTreeMap<Field, String>>,
        error: Option<String>,
        cached: bool,
        elapsed_ms: u64,
    },
    SessionComplete {
        summary: Box<SessionSummary>,
    },
}

impl ProgressEvent {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Self::JobStarted { job_id, .. } | Self::JobCompleted { job_id, .. } => Some(*job_id),
            Self::SessionComplete { .. } => None,
        }
    }
}

pub struct ProgressPublisher {
    session_id: Uuid,
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressPublisher {
    /// Publisher sized for `jobs` jobs, plus the first receiver.
    pub fn new(session_id: Uuid, jobs: usize) -> (Self, broadcast::Receiver<ProgressEvent>) {
        // Two events per job plus the summary; a receiver never lags.
        let capacity = (jobs * 2 + 1).max(16);
        let (sender, receiver) = broadcast::channel(capacity);
        (Self { session_id, sender }, receiver)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<ProgressEvent> {
        self.sender.clone()
    }

    /// Publish to current subscribers; with none, the event is dropped.
    pub fn publish(&self, event: ProgressEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!(session_id = %self.session_id, "No progress subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(session_id: Uuid) -> ProgressEvent {
        ProgressEvent::JobStarted {
            session_id,
            job_id: Uuid::new_v4(),
            file_name: Some("id_budi.jpg".into()),
        }
    }

    #[test]
    fn events_are_tagged() {
        let event = started(Uuid::nil());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_started");
        assert_eq!(json["file_name"], "id_budi.jpg");

        let completed = ProgressEvent::JobCompleted {
            session_id: Uuid::nil(),
            job_id: Uuid::nil(),
            status: JobState::Failed,
            document_type: None,
            partial_fields: None,
            error: Some("All recognition engines failed".into()),
            cached: false,
            elapsed_ms: 12,
        };
        let json = serde_json::to_value(&completed).unwrap();
        assert_eq!(json["type"], "job_completed");
        assert_eq!(json["status"], "failed");
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_replay() {
        let session = Uuid::new_v4();
        let (publisher, mut first) = ProgressPublisher::new(session, 2);

        let early = started(session);
        let early_id = early.job_id();
        publisher.publish(early);

        let mut late = publisher.subscribe();
        let next = started(session);
        let next_id = next.job_id();
        publisher.publish(next);

        assert_eq!(first.recv().await.unwrap().job_id(), early_id);
        assert_eq!(first.recv().await.unwrap().job_id(), next_id);
        assert_eq!(late.recv().await.unwrap().job_id(), next_id);
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let (publisher, receiver) = ProgressPublisher::new(Uuid::new_v4(), 1);
        drop(receiver);
        publisher.publish(started(publisher.session_id()));
    }
}
