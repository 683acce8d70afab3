//! Coordination client: keyed read/watch/lease on a distributed store.
//!
//! Wraps a strongly-consistent key-value store providing `get`/`put`/
//! `delete`/`watch`/`lease`. The [`CoordinationClient`] trait is the seam a
//! production deployment would implement against etcd or Consul;
//! [`InMemoryCoordinationClient`] is the revision-ordered reference
//! implementation used by the registry, the scheduler, and every test in
//! this workspace.
//!
//! Revisions are a single global counter: every mutation (put or delete)
//! takes the next revision, so events delivered to a watch stream are
//! totally ordered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::{CiError, Result};

/// A single watch notification.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put {
        key: String,
        value: String,
        revision: u64,
    },
    Delete { key: String, revision: u64 },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> u64 {
        match self {
            Self::Put { revision, .. } | Self::Delete { revision, .. } => *revision,
        }
    }
}

/// A lease identifier returned by [`CoordinationClient::lease`].
pub type LeaseId = u64;

/// Keyed read/watch/lease on a distributed coordination store.
///
/// The absence of a key implies liveness has lapsed -- callers (the worker
/// registry in particular) treat `get` returning `None` the same as a watch
/// delivering a `Delete`.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;
    async fn delete(&self, key_or_prefix: &str) -> Result<()>;
    async fn watch(&self, prefix: &str) -> Result<broadcast::Receiver<WatchEvent>>;
    async fn lease(&self, ttl: Duration) -> Result<LeaseId>;
    /// Refresh a lease's TTL. A lease whose keep-alive stops firing expires
    /// and its keys are dropped by the store.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;
}

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

/// Reference [`CoordinationClient`] backed by an in-process revision-ordered
/// map. Suitable for tests and single-node deployments; a real deployment
/// swaps this for an etcd/Consul-backed implementation behind the same
/// trait.
pub struct InMemoryCoordinationClient {
    store: DashMap<String, Entry>,
    revision: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
    leases: DashMap<LeaseId, ()>,
    next_lease: AtomicU64,
}

impl InMemoryCoordinationClient {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            store: DashMap::new(),
            revision: AtomicU64::new(0),
            events,
            leases: DashMap::new(),
            next_lease: AtomicU64::new(1),
        })
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Expire a lease: deletes every key holding it and emits `Delete`
    /// events for them. Used by tests to simulate a worker disappearing.
    pub fn expire_lease(&self, lease: LeaseId) {
        self.leases.remove(&lease);
        let dead: Vec<String> = self
            .store
            .iter()
            .filter(|e| e.value().lease == Some(lease))
            .map(|e| e.key().clone())
            .collect();
        for key in dead {
            self.store.remove(&key);
            let revision = self.next_revision();
            let _ = self.events.send(WatchEvent::Delete { key, revision });
        }
    }

    /// Snapshot every key under `prefix`, ordered by key, for callers that
    /// need to bootstrap state before subscribing to the watch stream.
    pub fn snapshot(&self, prefix: &str) -> BTreeMap<String, String> {
        self.store
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect()
    }
}

impl Default for InMemoryCoordinationClient {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            store: DashMap::new(),
            revision: AtomicU64::new(0),
            events,
            leases: DashMap::new(),
            next_lease: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordinationClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.store.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        if let Some(lease_id) = lease
            && !self.leases.contains_key(&lease_id)
        {
            return Err(CiError::CoordinationUnavailable {
                reason: format!("unknown lease {lease_id}"),
            });
        }
        self.store.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        let revision = self.next_revision();
        let _ = self.events.send(WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
            revision,
        });
        Ok(())
    }

    async fn delete(&self, key_or_prefix: &str) -> Result<()> {
        let matches: Vec<String> = self
            .store
            .iter()
            .filter(|e| e.key() == key_or_prefix || e.key().starts_with(key_or_prefix))
            .map(|e| e.key().clone())
            .collect();
        for key in matches {
            self.store.remove(&key);
            let revision = self.next_revision();
            let _ = self.events.send(WatchEvent::Delete { key, revision });
        }
        Ok(())
    }

    async fn watch(&self, _prefix: &str) -> Result<broadcast::Receiver<WatchEvent>> {
        Ok(self.events.subscribe())
    }

    async fn lease(&self, _ttl: Duration) -> Result<LeaseId> {
        let id = self.next_lease.fetch_add(1, Ordering::SeqCst);
        self.leases.insert(id, ());
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        if self.leases.contains_key(&lease) {
            Ok(())
        } else {
            Err(CiError::CoordinationUnavailable {
                reason: format!("unknown lease {lease}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let client = InMemoryCoordinationClient::new();
        client.put("workers/w1", "{}", None).await.unwrap();
        assert_eq!(
            client.get("workers/w1").await.unwrap(),
            Some("{}".to_string())
        );
    }

    #[tokio::test]
    async fn watch_sees_ordered_revisions() {
        let client = InMemoryCoordinationClient::new();
        let mut rx = client.watch("workers/").await.unwrap();

        client.put("workers/w1", "a", None).await.unwrap();
        client.put("workers/w1", "b", None).await.unwrap();

        let e1 = rx.recv().await.unwrap();
        let e2 = rx.recv().await.unwrap();
        assert!(e2.revision() > e1.revision());
    }

    #[tokio::test]
    async fn lease_expiry_deletes_keys_and_emits_delete() {
        let client = InMemoryCoordinationClient::new();
        let lease = client.lease(Duration::from_secs(10)).await.unwrap();
        client
            .put("workers/w1/status", "{}", Some(lease))
            .await
            .unwrap();

        let mut rx = client.watch("workers/").await.unwrap();
        client.expire_lease(lease);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, WatchEvent::Delete { .. }));
        assert_eq!(client.get("workers/w1/status").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_with_unknown_lease_fails() {
        let client = InMemoryCoordinationClient::new();
        let result = client.put("workers/w1", "{}", Some(999)).await;
        assert!(result.is_err());
    }
}
