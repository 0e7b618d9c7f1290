//! Event types for streaming engine progress
//!
//! Events are sent from the engine to the host (or any consumer) to report
//! job outcomes, artifacts and progress snapshots. Sending is purely a
//! notification: nothing the sink returns changes engine state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::batch::{BatchProgress, BatchStatus};
use crate::download::DownloadProgress;
use crate::history::ExecutionStatus;
use crate::types::{Artifact, BlockId};

/// Receiver of engine notifications: progress snapshots, job artifacts and
/// download and history lifecycle events.
///
/// Implementations must not block; the engine calls `send` while work is in
/// flight.
pub trait EventSink: Send + Sync {
    fn send(&self, event: EngineEvent) -> Result<(), EventError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// The receiving side of a channel sink was dropped
    #[error("event receiver dropped")]
    ReceiverDropped,
}

/// Events emitted by the batch queue, the download orchestrator and the history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A batch run was constructed and dispatch began
    #[serde(rename_all = "camelCase")]
    BatchStarted { batch_id: String, total: usize },

    /// A job was handed to the generation callback
    #[serde(rename_all = "camelCase")]
    JobStarted { batch_id: String, job_id: String },

    /// A job produced an artifact
    ///
    /// This is the artifact sink: the host decides whether to write it back
    /// onto the source block, create a new block, or enqueue a download.
    #[serde(rename_all = "camelCase")]
    JobCompleted {
        batch_id: String,
        job_id: String,
        source_block_id: Option<BlockId>,
        artifact: Artifact,
    },

    /// A job failed and will be attempted again
    #[serde(rename_all = "camelCase")]
    JobRetrying {
        batch_id: String,
        job_id: String,
        retry_count: u32,
        error: String,
    },

    /// A job exhausted its retries or was cancelled
    #[serde(rename_all = "camelCase")]
    JobFailed {
        batch_id: String,
        job_id: String,
        retry_count: u32,
        error: String,
    },

    /// Batch counters changed
    #[serde(rename_all = "camelCase")]
    BatchProgress { progress: BatchProgress },

    /// A batch run reached a terminal status
    #[serde(rename_all = "camelCase")]
    BatchFinished {
        batch_id: String,
        status: BatchStatus,
        completed: usize,
        failed: usize,
    },

    /// A download item started transferring
    #[serde(rename_all = "camelCase")]
    DownloadStarted { item_id: String, url: String },

    /// A download item was written to disk
    #[serde(rename_all = "camelCase")]
    DownloadCompleted { item_id: String, path: String },

    /// A download item failed permanently
    #[serde(rename_all = "camelCase")]
    DownloadFailed {
        item_id: String,
        retry_count: u32,
        error: String,
    },

    /// Download counters changed (global, per batch and per execution)
    #[serde(rename_all = "camelCase")]
    DownloadProgress { progress: DownloadProgress },

    /// Every item of a download batch settled; fired once per batch
    #[serde(rename_all = "camelCase")]
    DownloadBatchCompleted {
        batch_id: String,
        completed: usize,
        failed: usize,
    },

    /// An execution record was opened
    #[serde(rename_all = "camelCase")]
    ExecutionStarted {
        execution_id: String,
        template_id: String,
    },

    /// An execution record reached a terminal status
    #[serde(rename_all = "camelCase")]
    ExecutionFinished {
        execution_id: String,
        status: ExecutionStatus,
    },
}

/// Discards every event
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: EngineEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Keeps every event in memory for hosts that poll instead of subscribing.
///
/// Besides the raw log it answers the questions a polling UI asks: which
/// artifacts have arrived and what the latest batch and download snapshots
/// were.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Take the recorded events, leaving the log empty
    pub fn drain(&self) -> Vec<EngineEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Artifacts of completed jobs in arrival order, with their source block
    pub fn artifacts(&self) -> Vec<(Option<BlockId>, Artifact)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                EngineEvent::JobCompleted {
                    source_block_id,
                    artifact,
                    ..
                } => Some((source_block_id.clone(), artifact.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn latest_batch_progress(&self) -> Option<BatchProgress> {
        self.events.lock().iter().rev().find_map(|event| match event {
            EngineEvent::BatchProgress { progress } => Some(progress.clone()),
            _ => None,
        })
    }

    pub fn latest_download_progress(&self) -> Option<DownloadProgress> {
        self.events.lock().iter().rev().find_map(|event| match event {
            EngineEvent::DownloadProgress { progress } => Some(progress.clone()),
            _ => None,
        })
    }
}

impl EventSink for RecordingEventSink {
    fn send(&self, event: EngineEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Event sink that forwards into a tokio channel
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiver the host reads from
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: EngineEvent) -> Result<(), EventError> {
        self.sender
            .send(event)
            .map_err(|_| EventError::ReceiverDropped)
    }
}

/// Send an event and log instead of failing when the sink is gone
pub(crate) fn emit(sink: &dyn EventSink, event: EngineEvent) {
    if let Err(e) = sink.send(event) {
        log::debug!("Dropped engine event: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_answers_polling_queries() {
        let sink = RecordingEventSink::new();
        sink.send(EngineEvent::JobStarted {
            batch_id: "batch1".to_string(),
            job_id: "job1".to_string(),
        })
        .unwrap();
        sink.send(EngineEvent::JobCompleted {
            batch_id: "batch1".to_string(),
            job_id: "job1".to_string(),
            source_block_id: Some("b1".to_string()),
            artifact: Artifact::text("a lighthouse"),
        })
        .unwrap();
        sink.send(EngineEvent::DownloadProgress {
            progress: DownloadProgress::default(),
        })
        .unwrap();

        let artifacts = sink.artifacts();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].0.as_deref(), Some("b1"));
        assert_eq!(artifacts[0].1.value, "a lighthouse");
        assert!(sink.latest_download_progress().is_some());
        assert!(sink.latest_batch_progress().is_none());

        assert_eq!(sink.drain().len(), 3);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_null_event_sink() {
        let sink = NullEventSink;
        // Should not panic
        sink.send(EngineEvent::BatchStarted {
            batch_id: "batch1".to_string(),
            total: 2,
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_channel_event_sink() {
        let (sink, mut rx) = ChannelEventSink::new();
        sink.send(EngineEvent::DownloadCompleted {
            item_id: "d1".to_string(),
            path: "/tmp/a.mp4".to_string(),
        })
        .unwrap();

        match rx.recv().await {
            Some(EngineEvent::DownloadCompleted { item_id, .. }) => assert_eq!(item_id, "d1"),
            other => panic!("Unexpected event: {:?}", other),
        }

        drop(rx);
        let err = sink
            .send(EngineEvent::BatchStarted {
                batch_id: "b".to_string(),
                total: 1,
            })
            .unwrap_err();
        assert_eq!(err, EventError::ReceiverDropped);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = EngineEvent::DownloadBatchCompleted {
            batch_id: "b1".to_string(),
            completed: 2,
            failed: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "downloadBatchCompleted");
        assert_eq!(json["batchId"], "b1");
    }
}
