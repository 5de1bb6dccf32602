//! Worker registry: durable registration plus in-memory liveness.
//!
//! Registration rows persist in the store; liveness is an in-memory map
//! of last-heartbeat instants with a TTL equal to the heartbeat-loss
//! window. A background sweeper runs at half the window so offline
//! detection is bounded even when no heartbeats arrive at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::models::{Worker, WorkerResidency, WorkerStatus};
use conductor_db::queries::workers as worker_db;

use crate::dispatch::ResourceSnapshot;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, EventKind};

#[derive(Debug, Clone, Copy)]
struct LiveEntry {
    last_heartbeat: Instant,
    resources: ResourceSnapshot,
}

/// The registry. Cheap to clone via `Arc`.
pub struct WorkerRegistry {
    pool: PgPool,
    bus: Arc<EventBus>,
    loss_window: Duration,
    live: RwLock<HashMap<Uuid, LiveEntry>>,
}

impl WorkerRegistry {
    pub fn new(pool: PgPool, bus: Arc<EventBus>, loss_window: Duration) -> Self {
        Self {
            pool,
            bus,
            loss_window,
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Register a worker (or refresh an existing registration) and start
    /// its liveness clock.
    pub async fn register(
        &self,
        worker_id: Uuid,
        machine_name: &str,
        capabilities: &[String],
        residency: WorkerResidency,
    ) -> CoreResult<Worker> {
        if machine_name.trim().is_empty() {
            return Err(CoreError::validation("machine_name must not be empty"));
        }
        if capabilities.is_empty() {
            return Err(CoreError::validation(
                "a worker must offer at least one tool",
            ));
        }

        let capabilities_json = serde_json::json!(capabilities);
        let worker = worker_db::upsert_worker(
            &self.pool,
            &worker_db::NewWorker {
                id: worker_id,
                machine_name,
                capabilities: &capabilities_json,
                residency,
            },
        )
        .await?;

        self.live.write().await.insert(
            worker_id,
            LiveEntry {
                last_heartbeat: Instant::now(),
                resources: ResourceSnapshot {
                    cpu_pct: 0.0,
                    mem_pct: 0.0,
                    disk_pct: 0.0,
                },
            },
        );

        tracing::info!(
            worker_id = %worker_id,
            machine = %machine_name,
            tools = ?capabilities,
            "worker registered"
        );

        self.bus.publish(
            EventKind::WorkerUpdate,
            None,
            serde_json::json!({
                "worker_id": worker_id,
                "status": WorkerStatus::Online,
                "capabilities": capabilities,
            }),
        );

        Ok(worker)
    }

    /// Record a heartbeat: refresh the TTL and resource snapshot.
    ///
    /// A heartbeat from an unknown worker is rejected so stale processes
    /// re-register after a core restart. Heartbeats with an unchanged
    /// resource snapshot refresh the TTL without emitting a duplicate
    /// worker-update event.
    pub async fn heartbeat(
        &self,
        worker_id: Uuid,
        resources: ResourceSnapshot,
    ) -> CoreResult<()> {
        let rows = worker_db::record_heartbeat(
            &self.pool,
            worker_id,
            resources.cpu_pct,
            resources.mem_pct,
            resources.disk_pct,
        )
        .await?;
        if rows == 0 {
            return Err(CoreError::not_found(format!(
                "worker {worker_id} is not registered"
            )));
        }

        let changed = {
            let mut live = self.live.write().await;
            let previous = live.insert(
                worker_id,
                LiveEntry {
                    last_heartbeat: Instant::now(),
                    resources,
                },
            );
            previous.is_none_or(|entry| entry.resources != resources)
        };

        // A worker heartbeating after being swept offline comes back.
        let revived = worker_db::transition_worker_status(
            &self.pool,
            worker_id,
            WorkerStatus::Offline,
            WorkerStatus::Online,
        )
        .await?;

        if changed || revived > 0 {
            self.bus.publish(
                EventKind::WorkerUpdate,
                None,
                serde_json::json!({
                    "worker_id": worker_id,
                    "cpu_pct": resources.cpu_pct,
                    "mem_pct": resources.mem_pct,
                    "disk_pct": resources.disk_pct,
                }),
            );
        }

        Ok(())
    }

    /// List workers from the store, optionally by status.
    pub async fn list(&self, status: Option<WorkerStatus>) -> CoreResult<Vec<Worker>> {
        Ok(worker_db::list_workers(&self.pool, status).await?)
    }

    /// Fetch one worker.
    pub async fn get(&self, worker_id: Uuid) -> CoreResult<Worker> {
        worker_db::get_worker(&self.pool, worker_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("worker {worker_id} not found")))
    }

    /// Soft-delete a worker and stop tracking its liveness.
    pub async fn deregister(&self, worker_id: Uuid) -> CoreResult<()> {
        let rows = worker_db::deregister_worker(&self.pool, worker_id).await?;
        if rows == 0 {
            return Err(CoreError::not_found(format!(
                "worker {worker_id} is not registered"
            )));
        }
        self.live.write().await.remove(&worker_id);
        self.bus.publish(
            EventKind::WorkerUpdate,
            None,
            serde_json::json!({ "worker_id": worker_id, "status": WorkerStatus::Offline }),
        );
        Ok(())
    }

    /// Expire workers whose TTL lapsed. Marks them offline in the store,
    /// emits events, and returns their ids so the caller can reclaim
    /// their subtasks.
    pub async fn sweep_expired(&self) -> CoreResult<Vec<Uuid>> {
        let now = Instant::now();
        let expired: Vec<Uuid> = {
            let live = self.live.read().await;
            live.iter()
                .filter(|(_, entry)| now.duration_since(entry.last_heartbeat) >= self.loss_window)
                .map(|(id, _)| *id)
                .collect()
        };

        if expired.is_empty() {
            return Ok(vec![]);
        }

        {
            let mut live = self.live.write().await;
            for worker_id in &expired {
                live.remove(worker_id);
            }
        }

        for worker_id in &expired {
            worker_db::set_worker_status(&self.pool, *worker_id, WorkerStatus::Offline).await?;
            tracing::warn!(worker_id = %worker_id, "worker missed heartbeat window, marked offline");
            self.bus.publish(
                EventKind::WorkerUpdate,
                None,
                serde_json::json!({ "worker_id": worker_id, "status": WorkerStatus::Offline }),
            );
        }

        Ok(expired)
    }

    /// Run the sweeper until cancelled, invoking `on_lost` for each batch
    /// of newly offline workers.
    ///
    /// The interval is half the loss window, which bounds detection
    /// latency at 1.5x the window.
    pub async fn run_sweeper<F, Fut>(&self, cancel: CancellationToken, mut on_lost: F)
    where
        F: FnMut(Vec<Uuid>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let period = self.loss_window / 2;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_expired().await {
                        Ok(expired) if !expired.is_empty() => on_lost(expired).await,
                        Ok(_) => {}
                        Err(error) => {
                            tracing::error!(%error, "liveness sweep failed");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("liveness sweeper shutting down");
                    return;
                }
            }
        }
    }

    /// Whether a worker currently has a live heartbeat record.
    pub async fn is_live(&self, worker_id: Uuid) -> bool {
        self.live.read().await.contains_key(&worker_id)
    }
}
