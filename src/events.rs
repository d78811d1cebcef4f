use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::domain::{GroupLabel, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    RetrievalStarted { file: String },
    RetrievalSkipped { file: String },
    RetrievalRetry { file: String, retry: u32, delay_ms: u64, cause: String },
    RetrievalFinished { file: String, bytes: u64, latency_ms: u64 },
    RetrievalFailed { file: String, cause: String },
    AlignmentDropped { group: GroupLabel, dropped: usize, retained: usize },
    MarkersAbsent { features: Vec<String> },
    CacheHit { stage: Stage },
    CacheMiss { stage: Stage },
    CacheInvalid { stage: Stage, reason: String },
    StageCompleted { stage: Stage, elapsed_ms: u64 },
    RunSucceeded { records: usize },
    RunFailed { stage: Option<Stage>, cause: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineEvent {
    pub dataset_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl PipelineEvent {
    pub fn new(dataset_id: &str, kind: EventKind) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            kind,
        }
    }

    pub fn severity(&self) -> Severity {
        match &self.kind {
            EventKind::RetrievalRetry { .. }
            | EventKind::AlignmentDropped { .. }
            | EventKind::MarkersAbsent { .. }
            | EventKind::CacheInvalid { .. } => Severity::Warn,
            EventKind::RetrievalFailed { .. } | EventKind::RunFailed { .. } => Severity::Error,
            EventKind::CacheHit { .. } | EventKind::CacheMiss { .. } => Severity::Debug,
            _ => Severity::Info,
        }
    }
}

pub trait EventSink {
    fn emit(&self, event: PipelineEvent);
}

/// Forwards pipeline events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        let dataset_id = event.dataset_id.as_str();
        match &event.kind {
            EventKind::RetrievalStarted { file } => {
                tracing::info!(dataset_id, %file, "downloading");
            }
            EventKind::RetrievalSkipped { file } => {
                tracing::info!(dataset_id, %file, "already present, skipping download");
            }
            EventKind::RetrievalRetry {
                file,
                retry,
                delay_ms,
                cause,
            } => {
                tracing::warn!(dataset_id, %file, retry, delay_ms, %cause, "retrying download");
            }
            EventKind::RetrievalFinished {
                file,
                bytes,
                latency_ms,
            } => {
                tracing::info!(dataset_id, %file, bytes, latency_ms, "download complete");
            }
            EventKind::RetrievalFailed { file, cause } => {
                tracing::error!(dataset_id, %file, %cause, "download failed");
            }
            EventKind::AlignmentDropped {
                group,
                dropped,
                retained,
            } => {
                tracing::warn!(
                    dataset_id,
                    group = group.as_str(),
                    dropped,
                    retained,
                    "matrix columns without metadata dropped"
                );
            }
            EventKind::MarkersAbsent { features } => {
                tracing::warn!(
                    dataset_id,
                    features = %features.join(","),
                    "marker panel features not found in any matrix"
                );
            }
            EventKind::CacheHit { stage } => {
                tracing::debug!(dataset_id, stage = stage.as_str(), "cache hit");
            }
            EventKind::CacheMiss { stage } => {
                tracing::debug!(dataset_id, stage = stage.as_str(), "cache miss");
            }
            EventKind::CacheInvalid { stage, reason } => {
                tracing::warn!(
                    dataset_id,
                    stage = stage.as_str(),
                    %reason,
                    "discarding cached artifact"
                );
            }
            EventKind::StageCompleted { stage, elapsed_ms } => {
                tracing::info!(dataset_id, stage = stage.as_str(), elapsed_ms, "stage done");
            }
            EventKind::RunSucceeded { records } => {
                tracing::info!(dataset_id, records, "run finished");
            }
            EventKind::RunFailed { stage, cause } => {
                tracing::error!(
                    dataset_id,
                    stage = stage.map(|s| s.as_str()).unwrap_or("-"),
                    %cause,
                    "run failed"
                );
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: PipelineEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

/// Fans an event out to two sinks.
pub struct Tee<'a>(pub &'a dyn EventSink, pub &'a dyn EventSink);

impl EventSink for Tee<'_> {
    fn emit(&self, event: PipelineEvent) {
        self.0.emit(event.clone());
        self.1.emit(event);
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_are_warnings() {
        let event = PipelineEvent::new(
            "GSE1",
            EventKind::AlignmentDropped {
                group: "tissue".parse().unwrap(),
                dropped: 2,
                retained: 4,
            },
        );
        assert_eq!(event.severity(), Severity::Warn);
    }

    #[test]
    fn event_serializes_flat() {
        let event = PipelineEvent::new("GSE1", EventKind::CacheHit { stage: Stage::Align });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["dataset_id"], "GSE1");
        assert_eq!(json["event"], "cache_hit");
        assert_eq!(json["stage"], "align");
    }

    #[test]
    fn tee_forwards_to_both() {
        let left = RecordingSink::default();
        let right = RecordingSink::default();
        Tee(&left, &right).emit(PipelineEvent::new(
            "GSE1",
            EventKind::RunSucceeded { records: 3 },
        ));
        assert_eq!(left.events().len(), 1);
        assert_eq!(right.events().len(), 1);
    }
}
