//! The core side of the worker channel.
//!
//! Message types are tagged serde enums (`type` field on the wire); the
//! transport layer frames them however it likes (WebSocket in the shipped
//! server). The connection table maps worker ids to bounded per-worker
//! queues. Dispatch is idempotent on `(subtask, attempt)` so worker
//! reconnects never double-dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use conductor_db::models::WorkerResidency;

use crate::error::{CoreError, CoreResult};

/// Resource snapshot carried by heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
}

/// Terminal status a worker reports for a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

/// Worker -> core messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register {
        worker_id: Uuid,
        machine_name: String,
        capabilities: Vec<String>,
        #[serde(default = "default_residency")]
        residency: WorkerResidency,
    },
    Heartbeat {
        worker_id: Uuid,
        #[serde(flatten)]
        resources: ResourceSnapshot,
    },
    TaskResult {
        subtask_id: Uuid,
        attempt: i32,
        status: ResultStatus,
        #[serde(default)]
        output: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
        /// Explicitly non-recoverable; skips the retry budget.
        #[serde(default)]
        fatal: bool,
    },
}

fn default_residency() -> WorkerResidency {
    WorkerResidency::Remote
}

/// Core -> worker messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreMessage {
    ExecuteTask {
        subtask_id: Uuid,
        attempt: i32,
        tool: Option<String>,
        instructions: String,
        context: serde_json::Value,
    },
    CancelTask {
        subtask_id: Uuid,
    },
}

/// Connection table: one bounded queue per attached worker.
pub struct WorkerChannels {
    senders: RwLock<HashMap<Uuid, mpsc::Sender<CoreMessage>>>,
    in_flight: Mutex<HashSet<(Uuid, i32)>>,
    ack_timeout: Duration,
    queue_capacity: usize,
}

impl WorkerChannels {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            ack_timeout,
            queue_capacity: 32,
        }
    }

    /// Attach a worker connection, returning its message queue. An
    /// existing queue for the same worker is replaced (reconnect).
    pub async fn attach(&self, worker_id: Uuid) -> mpsc::Receiver<CoreMessage> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.senders.write().await.insert(worker_id, tx);
        rx
    }

    /// Drop a worker connection. In-flight keys stay recorded so a
    /// reconnect cannot double-dispatch a still-running attempt.
    pub async fn detach(&self, worker_id: Uuid) {
        self.senders.write().await.remove(&worker_id);
    }

    /// Whether a worker currently has an attached connection.
    pub async fn is_attached(&self, worker_id: Uuid) -> bool {
        self.senders.read().await.contains_key(&worker_id)
    }

    /// Dispatch an execute message to a worker.
    ///
    /// Idempotent: a `(subtask, attempt)` already in flight returns Ok
    /// without sending. Enqueueing must succeed within the ack timeout;
    /// a full or missing queue is reported as unavailable so the caller
    /// can route through the worker-loss path.
    pub async fn dispatch(
        &self,
        worker_id: Uuid,
        subtask_id: Uuid,
        attempt: i32,
        message: CoreMessage,
    ) -> CoreResult<()> {
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            if !in_flight.insert((subtask_id, attempt)) {
                return Ok(());
            }
        }

        let sender = {
            let senders = self.senders.read().await;
            senders.get(&worker_id).cloned()
        };

        let Some(sender) = sender else {
            self.clear_in_flight(subtask_id, attempt);
            return Err(CoreError::unavailable(format!(
                "worker {worker_id} has no attached channel"
            )));
        };

        match tokio::time::timeout(self.ack_timeout, sender.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.clear_in_flight(subtask_id, attempt);
                Err(CoreError::unavailable(format!(
                    "worker {worker_id} channel closed"
                )))
            }
            Err(_) => {
                self.clear_in_flight(subtask_id, attempt);
                Err(CoreError::timeout(format!(
                    "worker {worker_id} did not accept dispatch within {:?}",
                    self.ack_timeout
                )))
            }
        }
    }

    /// Best-effort cancellation of a dispatched subtask.
    pub async fn cancel(&self, worker_id: Uuid, subtask_id: Uuid) {
        let sender = {
            let senders = self.senders.read().await;
            senders.get(&worker_id).cloned()
        };
        if let Some(sender) = sender {
            let _ = sender.try_send(CoreMessage::CancelTask { subtask_id });
        }
    }

    /// Clear the in-flight record once a result (or loss) is processed.
    pub fn clear_in_flight(&self, subtask_id: Uuid, attempt: i32) {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&(subtask_id, attempt));
    }

    /// Clear every in-flight record for a lost worker's reclaimed
    /// subtasks.
    pub fn clear_in_flight_many(&self, keys: impl IntoIterator<Item = (Uuid, i32)>) {
        let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
        for key in keys {
            in_flight.remove(&key);
        }
    }
}
