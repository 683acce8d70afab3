//! Worker registry: a live map of worker id -> capacity, heartbeat, status.
//!
//! Backed by [`DashMap`], which gives lock-free concurrent reads and
//! fine-grained write locking per key, driven entirely by watch events
//! rather than direct `register`/`set_status` calls.
//!
//! The registry reacts to [`WatchEvent`]s from the coordination client:
//! a `put` on an unknown id creates a [`Worker`] in `Joining`, a `put` on
//! `workers/<id>/status` promotes it to `Ready` and refreshes its counters,
//! and a `delete` of either key transitions it to `Lost` and removes it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coordination::{CoordinationClient, WatchEvent};
use crate::domain::{Worker, WorkerId, WorkerStatus};

/// Wire shape of the `workers/<id>` announcement value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAnnouncement {
    pub address: String,
    pub max: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Wire shape of the `workers/<id>/status` liveness value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusRecord {
    pub running: u32,
    #[serde(default)]
    pub load: f64,
}

/// Concurrent worker registry, cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct WorkerRegistry {
    workers: Arc<DashMap<WorkerId, Worker>>,
    lost: Arc<tokio::sync::broadcast::Sender<WorkerId>>,
}

/// Prefix under which worker announcements live in the coordination store.
pub const WORKERS_PREFIX: &str = "workers/";

impl WorkerRegistry {
    pub fn new() -> Self {
        let (lost, _) = tokio::sync::broadcast::channel(256);
        Self {
            workers: Arc::new(DashMap::new()),
            lost: Arc::new(lost),
        }
    }

    /// Subscribe to worker ids that just transitioned to `Lost`. The
    /// scheduler uses this to re-enqueue jobs that were running on a worker
    /// that disappeared.
    pub fn subscribe_lost(&self) -> tokio::sync::broadcast::Receiver<WorkerId> {
        self.lost.subscribe()
    }

    /// Total (max, running) capacity across all `Ready` workers. Held under
    /// the map's per-shard locks only for the duration of the scan -- never
    /// across I/O.
    pub fn capacity(&self) -> (u32, u32) {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Ready)
            .fold((0u32, 0u32), |(max, running), w| {
                (max + w.max, running + w.running)
            })
    }

    /// The `Ready` worker with the largest free slack, tie-broken by the
    /// smallest id for determinism.
    pub fn most_slack(&self) -> Option<Worker> {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Ready && w.slack() > 0)
            .map(|w| w.value().clone())
            .max_by(|a, b| a.slack().cmp(&b.slack()).then_with(|| b.id.cmp(&a.id)))
    }

    pub fn get(&self, id: &str) -> Option<Worker> {
        self.workers.get(id).map(|w| w.value().clone())
    }

    pub fn list(&self) -> Vec<Worker> {
        self.workers.iter().map(|w| w.value().clone()).collect()
    }

    /// Optimistically bump a worker's running count after a local dispatch
    /// decision. Reconciled by the next heartbeat.
    pub fn increment_running(&self, id: &str) {
        if let Some(mut w) = self.workers.get_mut(id) {
            w.running += 1;
        }
    }

    /// Apply a single coordination-store event to the registry.
    pub fn apply(&self, event: &WatchEvent) {
        match event {
            WatchEvent::Put { key, value, .. } => self.apply_put(key, value),
            WatchEvent::Delete { key, .. } => self.apply_delete(key),
        }
    }

    fn apply_put(&self, key: &str, value: &str) {
        let Some(rest) = key.strip_prefix(WORKERS_PREFIX) else {
            return;
        };

        if let Some(id) = rest.strip_suffix("/status") {
            let Ok(status) = serde_json::from_str::<WorkerStatusRecord>(value) else {
                warn!(worker_id = id, "ignoring malformed status record");
                return;
            };
            self.workers.entry(id.to_string()).and_modify(|w| {
                w.running = status.running;
                w.last_heartbeat = Utc::now();
                if w.status == WorkerStatus::Joining {
                    w.status = WorkerStatus::Ready;
                    info!(worker_id = id, "worker promoted to ready");
                }
            });
            return;
        }

        // Announcement key: `workers/<id>`.
        let id = rest;
        let Ok(announcement) = serde_json::from_str::<WorkerAnnouncement>(value) else {
            warn!(worker_id = id, "ignoring malformed worker announcement");
            return;
        };

        match self.workers.get_mut(id) {
            Some(mut existing) => {
                existing.max = announcement.max;
                existing.address = announcement.address;
                existing.last_heartbeat = Utc::now();
                debug!(worker_id = id, "worker announcement refreshed");
            }
            None => {
                self.workers.insert(
                    id.to_string(),
                    Worker {
                        id: id.to_string(),
                        address: announcement.address,
                        max: announcement.max,
                        running: 0,
                        status: WorkerStatus::Joining,
                        last_heartbeat: Utc::now(),
                    },
                );
                info!(worker_id = id, "worker joining");
            }
        }
    }

    fn apply_delete(&self, key: &str) {
        let Some(rest) = key.strip_prefix(WORKERS_PREFIX) else {
            return;
        };
        let id = rest.strip_suffix("/status").unwrap_or(rest);
        self.mark_lost(id);
    }

    /// Directly transition a worker to `Lost` and remove it, e.g. because a
    /// dispatch attempt found the worker unreachable. Returns `true` if a
    /// worker was actually removed.
    pub fn mark_lost(&self, id: &str) -> bool {
        if let Some((_, mut worker)) = self.workers.remove(id) {
            worker.status = WorkerStatus::Lost;
            info!(worker_id = id, "worker lost");
            let _ = self.lost.send(id.to_string());
            true
        } else {
            false
        }
    }

    /// Mark every tracked worker `Lost` and clear the map. Invoked when the
    /// watch channel cannot be re-established.
    pub fn mark_all_lost(&self) -> Vec<Worker> {
        let lost: Vec<Worker> = self
            .workers
            .iter()
            .map(|w| {
                let mut worker = w.value().clone();
                worker.status = WorkerStatus::Lost;
                worker
            })
            .collect();
        self.workers.clear();
        for worker in &lost {
            let _ = self.lost.send(worker.id.clone());
        }
        lost
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Watch `workers/` on `client` and apply every event to `registry`.
///
/// Retries establishing the watch up to `max_attempts` times with
/// `reconnect_backoff` between tries. If the watch channel itself closes
/// (the coordination client is gone for good), every worker is marked lost
/// and a [`CiError::Fatal`] is returned for the app façade's error channel.
pub async fn run_worker_watch<C: CoordinationClient + 'static>(
    client: Arc<C>,
    registry: WorkerRegistry,
    reconnect_backoff: Duration,
    max_attempts: u32,
) -> crate::error::CiError {
    let mut attempt = 0;
    let mut rx = loop {
        match client.watch(WORKERS_PREFIX).await {
            Ok(rx) => break rx,
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    registry.mark_all_lost();
                    return crate::error::CiError::Fatal(format!(
                        "worker watch could not be established after {attempt} attempts: {err}"
                    ));
                }
                warn!(error = %err, attempt, "worker watch failed to establish, retrying");
                tokio::time::sleep(reconnect_backoff).await;
            }
        }
    };

    loop {
        match rx.recv().await {
            Ok(event) => registry.apply(&event),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "worker watch receiver lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                warn!("worker watch channel closed permanently, marking all workers lost");
                registry.mark_all_lost();
                return crate::error::CiError::Fatal(
                    "coordination client watch channel closed".to_string(),
                );
            }
        }
    }
}
