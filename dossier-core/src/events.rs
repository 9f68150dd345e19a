//! Progress events for running pipelines.
//!
//! Events go out on a `tokio::sync::broadcast` channel. The bus also keeps a
//! per-run replay log so late subscribers can catch up; a subscriber that
//! replays and then listens live may see an event twice.

use crate::stages::StageKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: Uuid,
    pub stage: StageKind,
    pub status: StageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn new(run_id: Uuid, stage: StageKind, status: StageStatus) -> Self {
        Self {
            run_id,
            stage,
            status,
            timestamp: Utc::now(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Whether the run stops after this event: the publisher finished, or a
    /// stage failed fatally or was cancelled.
    pub fn is_terminal(&self) -> bool {
        self.status == StageStatus::Error
            || (self.stage == StageKind::Publisher && self.status == StageStatus::Completed)
    }
}

/// Broadcast bus with a per-run replay log.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
    log: Mutex<HashMap<Uuid, Vec<ProgressEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            log: Mutex::new(HashMap::new()),
        }
    }

    /// Record and broadcast an event. Returns the number of live receivers.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.run_id)
            .or_default()
            .push(event.clone());
        self.tx.send(event).unwrap_or(0)
    }

    pub fn emit(&self, run_id: Uuid, stage: StageKind, status: StageStatus) -> usize {
        self.publish(ProgressEvent::new(run_id, stage, status))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Every event published for `run_id` so far, in order.
    pub fn replay(&self, run_id: Uuid) -> Vec<ProgressEvent> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the replay log of a run.
    pub fn forget(&self, run_id: Uuid) {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_still_logs() {
        let bus = EventBus::default();
        let run = Uuid::new_v4();
        assert_eq!(bus.emit(run, StageKind::Planner, StageStatus::Running), 0);
        assert_eq!(bus.replay(run).len(), 1);
    }

    #[test]
    fn test_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let run = Uuid::new_v4();
        assert_eq!(bus.emit(run, StageKind::Writer, StageStatus::Completed), 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.stage, StageKind::Writer);
        assert_eq!(event.status, StageStatus::Completed);
    }

    #[test]
    fn test_late_subscriber_replays_then_follows() {
        tokio_test::block_on(async {
            let bus = EventBus::default();
            let run = Uuid::new_v4();
            bus.emit(run, StageKind::Planner, StageStatus::Completed);

            let mut rx = bus.subscribe();
            assert_eq!(bus.replay(run).len(), 1);
            bus.emit(run, StageKind::Researcher, StageStatus::Running);
            let event = rx.recv().await.expect("event");
            assert_eq!(event.stage, StageKind::Researcher);
            assert_eq!(bus.replay(run).len(), 2);
        });
    }

    #[test]
    fn test_replay_is_per_run_and_ordered() {
        let bus = EventBus::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        bus.emit(a, StageKind::Planner, StageStatus::Running);
        bus.emit(b, StageKind::Planner, StageStatus::Running);
        bus.emit(a, StageKind::Planner, StageStatus::Completed);
        let statuses: Vec<StageStatus> = bus.replay(a).iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![StageStatus::Running, StageStatus::Completed]);
        bus.forget(a);
        assert!(bus.replay(a).is_empty());
        assert_eq!(bus.replay(b).len(), 1);
    }

    #[test]
    fn test_terminal_events() {
        let run = Uuid::new_v4();
        assert!(ProgressEvent::new(run, StageKind::Publisher, StageStatus::Completed).is_terminal());
        assert!(ProgressEvent::new(run, StageKind::Planner, StageStatus::Error).is_terminal());
        assert!(!ProgressEvent::new(run, StageKind::Writer, StageStatus::Completed).is_terminal());
        assert!(!ProgressEvent::new(run, StageKind::Publisher, StageStatus::Running).is_terminal());
    }

    #[test]
    fn test_event_json_shape() {
        let event = ProgressEvent::new(Uuid::nil(), StageKind::Researcher, StageStatus::Error)
            .with_message("section 2 failed");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "researcher");
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "section 2 failed");
    }
}
