//! Per-task event fan-out.
//!
//! One broadcast topic per task id plus a global topic. Publishing never
//! blocks: each subscriber owns a bounded buffer, and a subscriber that
//! cannot keep up loses its oldest undelivered messages and receives a
//! single `lagged` marker so it can re-fetch state from the store.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use foreman_db::models::TaskRecord;

/// Per-subscriber buffer size before drop-on-slow kicks in.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 16;

/// Kind of a task event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskStatusUpdated,
    PlanGenerated,
    PhaseStarted,
    PhaseCompleted,
    PhaseAwaitingApproval,
    PhaseApproved,
    PhaseRejected,
    ExpertStarted,
    ExpertCompleted,
    ExpertFailed,
    TaskCompleted,
    /// Synthetic event carrying the current record to a new subscriber.
    Snapshot,
    /// Marker delivered after a subscriber's buffer overflowed.
    Lagged,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskCreated => "task_created",
            Self::TaskStatusUpdated => "task_status_updated",
            Self::PlanGenerated => "plan_generated",
            Self::PhaseStarted => "phase_started",
            Self::PhaseCompleted => "phase_completed",
            Self::PhaseAwaitingApproval => "phase_awaiting_approval",
            Self::PhaseApproved => "phase_approved",
            Self::PhaseRejected => "phase_rejected",
            Self::ExpertStarted => "expert_started",
            Self::ExpertCompleted => "expert_completed",
            Self::ExpertFailed => "expert_failed",
            Self::TaskCompleted => "task_completed",
            Self::Snapshot => "snapshot",
            Self::Lagged => "lagged",
        };
        f.write_str(s)
    }
}

/// One event on a task's topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub kind: EventKind,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// The freshly persisted task snapshot; absent on `lagged` markers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskRecord>,
    /// How many events were dropped; present on `lagged` markers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missed: Option<u64>,
}

impl TaskEvent {
    /// Event carrying a task snapshot, without phase attribution.
    pub fn new(kind: EventKind, task: &TaskRecord) -> Self {
        Self {
            kind,
            task_id: task.id.clone(),
            phase_id: None,
            timestamp: Utc::now(),
            task: Some(task.clone()),
            missed: None,
        }
    }

    /// Event attributed to a phase.
    pub fn with_phase(kind: EventKind, task: &TaskRecord, phase_id: impl Into<String>) -> Self {
        Self {
            phase_id: Some(phase_id.into()),
            ..Self::new(kind, task)
        }
    }

    /// Synthetic snapshot for a late-joining subscriber.
    pub fn snapshot(task: &TaskRecord) -> Self {
        Self::new(EventKind::Snapshot, task)
    }

    /// Marker telling a slow subscriber it missed `missed` events.
    pub fn lagged(task_id: impl Into<String>, missed: u64) -> Self {
        Self {
            kind: EventKind::Lagged,
            task_id: task_id.into(),
            phase_id: None,
            timestamp: Utc::now(),
            task: None,
            missed: Some(missed),
        }
    }
}

/// Central event bus: topic-per-task fan-out plus a global topic.
pub struct EventBus {
    capacity: usize,
    global: broadcast::Sender<TaskEvent>,
    topics: RwLock<HashMap<String, broadcast::Sender<TaskEvent>>>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (global, _) = broadcast::channel(capacity);
        Self {
            capacity,
            global,
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn topic(&self, task_id: &str) -> broadcast::Sender<TaskEvent> {
        if let Some(sender) = self.topics.read().expect("bus lock poisoned").get(task_id) {
            return sender.clone();
        }
        let mut topics = self.topics.write().expect("bus lock poisoned");
        topics
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event to its task topic and the global topic.
    ///
    /// Never blocks; send errors (no subscribers) are ignored.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.topic(&event.task_id).send(event.clone());
        let _ = self.global.send(event);
    }

    /// Subscribe to one task's topic.
    pub fn subscribe(&self, task_id: &str) -> broadcast::Receiver<TaskEvent> {
        self.topic(task_id).subscribe()
    }

    /// Subscribe to events of every task.
    pub fn subscribe_all(&self) -> broadcast::Receiver<TaskEvent> {
        self.global.subscribe()
    }

    /// Number of live subscribers on a task topic.
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.topics
            .read()
            .expect("bus lock poisoned")
            .get(task_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

/// Adapt a broadcast receiver into an ordered event stream.
///
/// Buffer overflows surface as a single `lagged` event instead of an
/// error, so consumers can re-fetch the record and continue.
pub fn into_event_stream(
    task_id: String,
    mut rx: broadcast::Receiver<TaskEvent>,
) -> impl Stream<Item = TaskEvent> + Send {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => yield event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    yield TaskEvent::lagged(task_id.clone(), missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use foreman_db::models::TaskRecord;
    use futures::StreamExt;

    fn record(objective: &str) -> TaskRecord {
        TaskRecord::new(objective, false)
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::default();
        let task = record("Write a haiku.");
        let mut rx = bus.subscribe(&task.id);

        bus.publish(TaskEvent::new(EventKind::TaskCreated, &task));
        bus.publish(TaskEvent::new(EventKind::PlanGenerated, &task));

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::TaskCreated);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::PlanGenerated);
    }

    #[tokio::test]
    async fn topics_are_isolated_per_task() {
        let bus = EventBus::default();
        let task_a = record("A");
        let task_b = record("B");

        let mut rx_a = bus.subscribe(&task_a.id);
        bus.publish(TaskEvent::new(EventKind::TaskCreated, &task_b));
        bus.publish(TaskEvent::new(EventKind::TaskCreated, &task_a));

        let event = rx_a.recv().await.unwrap();
        assert_eq!(event.task_id, task_a.id);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn global_topic_sees_every_task() {
        let bus = EventBus::default();
        let task_a = record("A");
        let task_b = record("B");

        let mut rx = bus.subscribe_all();
        bus.publish(TaskEvent::new(EventKind::TaskCreated, &task_a));
        bus.publish(TaskEvent::new(EventKind::TaskCreated, &task_b));

        assert_eq!(rx.recv().await.unwrap().task_id, task_a.id);
        assert_eq!(rx.recv().await.unwrap().task_id, task_b.id);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block_or_panic() {
        let bus = EventBus::default();
        let task = record("nobody listening");
        bus.publish(TaskEvent::new(EventKind::TaskCreated, &task));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_sees_lagged_marker() {
        let bus = EventBus::new(2);
        let task = record("busy task");
        let rx = bus.subscribe(&task.id);

        for _ in 0..5 {
            bus.publish(TaskEvent::new(EventKind::TaskStatusUpdated, &task));
        }

        let mut stream = Box::pin(into_event_stream(task.id.clone(), rx));
        let first = stream.next().await.unwrap();
        assert_eq!(first.kind, EventKind::Lagged);
        assert_eq!(first.missed, Some(3));

        // The retained (newest) events still arrive, in order.
        let second = stream.next().await.unwrap();
        assert_eq!(second.kind, EventKind::TaskStatusUpdated);
        let third = stream.next().await.unwrap();
        assert_eq!(third.kind, EventKind::TaskStatusUpdated);
    }

    #[tokio::test]
    async fn subscriber_count_tracks_receivers() {
        let bus = EventBus::default();
        let task = record("counted");
        assert_eq!(bus.subscriber_count(&task.id), 0);
        let _rx = bus.subscribe(&task.id);
        assert_eq!(bus.subscriber_count(&task.id), 1);
    }

    #[test]
    fn event_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EventKind::PhaseAwaitingApproval).unwrap();
        assert_eq!(json, "\"phase_awaiting_approval\"");
        assert_eq!(EventKind::ExpertFailed.to_string(), "expert_failed");
    }
}
