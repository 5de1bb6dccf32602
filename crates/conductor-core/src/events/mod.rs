//! In-process event bus with per-topic fan-out.
//!
//! One broadcast channel per topic plus a bounded replay buffer. Publish
//! is non-blocking and single-writer per event; subscribers get events in
//! publish order for their topic, with a per-topic monotonic sequence
//! number for gap detection. Reconnecting subscribers catch up from the
//! replay buffer; subscribers that lag past the channel capacity observe
//! a synthetic catch-up event instead of silently missing data.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Kind of an event, used for subscriber-side filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    TaskUpdate,
    SubtaskUpdate,
    WorkerUpdate,
    CheckpointReady,
    TaskComplete,
    TaskFailed,
    ActivityLog,
    /// Synthetic: the subscriber fell behind and must re-fetch state.
    CatchUpRequired,
}

/// Topic an event is published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Everything, in global publish order.
    All,
    /// Events scoped to one task.
    Task(Uuid),
    /// Worker fleet events.
    Workers,
}

/// A published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Per-topic monotonic sequence number, starting at 1.
    pub seq: u64,
    pub kind: EventKind,
    pub task_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

struct TopicState {
    sender: broadcast::Sender<Event>,
    replay: VecDeque<Event>,
    next_seq: u64,
}

impl TopicState {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self {
            sender,
            replay: VecDeque::with_capacity(capacity),
            next_seq: 1,
        }
    }
}

/// A subscription: buffered replay plus the live receiver.
pub struct Subscription {
    /// Events already published to the topic, oldest first, bounded by the
    /// replay size.
    pub replay: Vec<Event>,
    pub receiver: broadcast::Receiver<Event>,
}

/// The bus. Cheap to share behind an `Arc`.
pub struct EventBus {
    topics: RwLock<HashMap<Topic, TopicState>>,
    replay_size: usize,
}

impl EventBus {
    pub fn new(replay_size: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            replay_size,
        }
    }

    /// Publish an event. Non-blocking; a topic with no subscribers only
    /// records into the replay buffer.
    ///
    /// Task-scoped events fan out to both their task topic and `All`;
    /// worker events to `Workers` and `All`. Each topic assigns its own
    /// sequence number.
    pub fn publish(&self, kind: EventKind, task_id: Option<Uuid>, payload: serde_json::Value) {
        let mut targets = vec![Topic::All];
        if let Some(task_id) = task_id {
            targets.push(Topic::Task(task_id));
        }
        if kind == EventKind::WorkerUpdate {
            targets.push(Topic::Workers);
        }

        let mut topics = self.topics.write().expect("event bus lock poisoned");
        for topic in targets {
            let state = topics
                .entry(topic)
                .or_insert_with(|| TopicState::new(self.replay_size));

            let event = Event {
                seq: state.next_seq,
                kind,
                task_id,
                payload: payload.clone(),
                at: Utc::now(),
            };
            state.next_seq += 1;

            if state.replay.len() == self.replay_size {
                state.replay.pop_front();
            }
            state.replay.push_back(event.clone());

            // send() only fails when there are no receivers; the replay
            // buffer already has the event, so that is fine.
            let _ = state.sender.send(event);
        }
    }

    /// Subscribe to a topic, receiving the replay buffer up front.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let mut topics = self.topics.write().expect("event bus lock poisoned");
        let state = topics
            .entry(topic)
            .or_insert_with(|| TopicState::new(self.replay_size));
        Subscription {
            replay: state.replay.iter().cloned().collect(),
            receiver: state.sender.subscribe(),
        }
    }

    /// Latest sequence number assigned on a topic (0 when nothing was
    /// published yet).
    pub fn latest_seq(&self, topic: Topic) -> u64 {
        self.topics
            .read()
            .expect("event bus lock poisoned")
            .get(&topic)
            .map(|s| s.next_seq - 1)
            .unwrap_or(0)
    }
}

/// Build the synthetic event handed to a subscriber that lagged past the
/// broadcast capacity and lost `missed` events.
pub fn catch_up_event(missed: u64) -> Event {
    Event {
        seq: 0,
        kind: EventKind::CatchUpRequired,
        task_id: None,
        payload: serde_json::json!({ "missed": missed }),
        at: Utc::now(),
    }
}

/// Receive the next event, converting broadcast lag into a catch-up event
/// and a closed channel into `None`.
pub async fn next_event(receiver: &mut broadcast::Receiver<Event>) -> Option<Event> {
    loop {
        match receiver.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                return Some(catch_up_event(missed));
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
