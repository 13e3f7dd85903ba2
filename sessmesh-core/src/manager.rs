//! Per-node registry of live replicas.
//!
//! The manager creates and loads replicas, hands them to request code, and
//! routes change messages from other nodes into the resident replica. The
//! live set sits behind one map-level lock; each replica has its own lock
//! for attribute state, and neither is held across a store call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::bus::{ChangeBus, MessageHandler};
use crate::config::{ManagerConfig, ReadMode, UpdateMode};
use crate::dispatcher::UpdateDispatcher;
use crate::error::Result;
use crate::ids::{NodeId, SessionIdGenerator, UlidGenerator};
use crate::message::{Change, ChangeMessage, Codec};
use crate::replica::{SessionReplica, meta, now_millis};
use crate::store::{KeyValueBackend, RemoteAttributeStore};

/// What happened to one incoming change message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    /// Published by this node.
    Suppressed,
    /// No resident replica for the session.
    NotResident,
    /// `SessionCleared`: the replica was dropped from the live set.
    Evicted,
}

/// Snapshot of listener counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerMetrics {
    pub applied: u64,
    pub suppressed: u64,
    pub not_resident: u64,
    pub decode_errors: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    suppressed: AtomicU64,
    not_resident: AtomicU64,
    decode_errors: AtomicU64,
}

pub struct ReplicaManager {
    config: ManagerConfig,
    node_id: NodeId,
    backend: Arc<dyn KeyValueBackend>,
    dispatcher: Arc<UpdateDispatcher>,
    codec: Codec,
    ids: Arc<dyn SessionIdGenerator>,
    live: Mutex<HashMap<String, Arc<SessionReplica>>>,
    counters: Counters,
}

impl ReplicaManager {
    pub fn new(
        config: ManagerConfig,
        node_id: NodeId,
        backend: Arc<dyn KeyValueBackend>,
        bus: Arc<dyn ChangeBus>,
    ) -> Self {
        Self::with_id_generator(config, node_id, backend, bus, Arc::new(UlidGenerator::new()))
    }

    pub fn with_id_generator(
        config: ManagerConfig,
        node_id: NodeId,
        backend: Arc<dyn KeyValueBackend>,
        bus: Arc<dyn ChangeBus>,
        ids: Arc<dyn SessionIdGenerator>,
    ) -> Self {
        let codec = Codec::for_format(config.encoding);
        let dispatcher = Arc::new(UpdateDispatcher::new(
            config.update_mode,
            config.read_mode,
            node_id.clone(),
            config.topic_name(),
            codec,
            bus,
        ));
        Self {
            config,
            node_id,
            backend,
            dispatcher,
            codec,
            ids,
            live: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    /// Handler to subscribe on the scope topic. Holds the manager weakly.
    pub fn listener(self: &Arc<Self>) -> Arc<ChangeListener> {
        Arc::new(ChangeListener {
            manager: Arc::downgrade(self),
        })
    }

    fn store_for(&self, session_id: &str) -> RemoteAttributeStore {
        RemoteAttributeStore::new(
            Arc::clone(&self.backend),
            self.config.collection_name(session_id),
            self.config.store_timeout(),
        )
    }

    /// Register a brand-new session. Nothing reaches the store until it is
    /// persisted. An explicit `id` replaces any resident replica with that id.
    pub fn create_new(&self, id: Option<&str>) -> Arc<SessionReplica> {
        let id = id.map_or_else(|| self.ids.generate(), str::to_string);
        let replica = Arc::new(SessionReplica::new(
            id.clone(),
            self.config.session_timeout_secs,
            self.store_for(&id),
            Arc::clone(&self.dispatcher),
        ));
        if let Some(old) = self.live.lock().insert(id.clone(), Arc::clone(&replica)) {
            tracing::warn!(session = %id, "New session replaced a resident replica");
            old.mark_invalid();
        }
        tracing::debug!(session = %id, node = %self.node_id, "Session created");
        replica
    }

    /// The resident replica, or one loaded from the store. Load failures and
    /// sessions the store doesn't hold as valid yield `None`.
    pub async fn find_or_load(&self, id: &str) -> Option<Arc<SessionReplica>> {
        if let Some(replica) = self.resident(id) {
            replica.touch();
            return Some(replica);
        }

        let store = self.store_for(id);
        let loaded = match self.config.read_mode {
            ReadMode::Memory => store.read_all().await,
            ReadMode::Store => {
                let names: Vec<String> = meta::ALL.iter().map(|n| n.to_string()).collect();
                store.get_all(&names).await
            }
        };
        let entries = match loaded {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(session = %id, "Failed to load session: {e}");
                return None;
            }
        };
        let replica = SessionReplica::from_entries(
            id.to_string(),
            entries,
            store,
            Arc::clone(&self.dispatcher),
        )?;

        // Another request may have loaded it meanwhile; keep the first.
        let replica = Arc::clone(
            self.live
                .lock()
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(replica)),
        );
        replica.touch();
        tracing::debug!(session = %id, node = %self.node_id, "Session loaded");
        Some(replica)
    }

    pub fn resident(&self, id: &str) -> Option<Arc<SessionReplica>> {
        self.live.lock().get(id).cloned()
    }

    pub fn resident_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn resident_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn evict(&self, replica: &Arc<SessionReplica>) {
        let mut live = self.live.lock();
        if live.get(replica.id()).is_some_and(|r| Arc::ptr_eq(r, replica)) {
            live.remove(replica.id());
        }
    }

    pub async fn persist(&self, replica: &SessionReplica) -> Result<()> {
        replica.persist().await
    }

    /// Invalidate a session everywhere: drop it here, delete its collection,
    /// and tell the other nodes. Under deferred updates the announcement
    /// waits for the next flush.
    pub async fn invalidate(&self, replica: &Arc<SessionReplica>) -> Result<()> {
        let was_new = replica.is_new();
        let was_valid = replica.mark_invalid();
        self.evict(replica);
        if !was_valid {
            return Ok(());
        }

        let deleted = replica.store().delete_collection().await;
        if !was_new {
            match self.dispatcher.mode() {
                UpdateMode::Immediate => self.dispatcher.publish(replica.id(), Change::SessionCleared),
                UpdateMode::Deferred => replica.mark_pending_clear(),
            }
        }
        match deleted {
            Ok(_) => {
                tracing::info!(session = %replica.id(), node = %self.node_id, "Session invalidated");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session = %replica.id(), "Session invalidated but its collection was not deleted: {e}");
                Err(e)
            }
        }
    }

    pub fn begin_access(&self, replica: &SessionReplica) {
        replica.touch();
    }

    pub fn end_access(&self, replica: &SessionReplica) {
        replica.end_access();
    }

    pub async fn flush(&self, replica: &SessionReplica) -> Result<()> {
        replica.flush().await
    }

    /// End of a unit of work: record the access, persist a new session, and
    /// under deferred updates flush what the request changed.
    pub async fn complete_request(&self, replica: &SessionReplica) -> Result<()> {
        replica.end_access();
        if replica.is_new() {
            replica.persist().await?;
        } else if replica.is_valid() {
            if let Err(e) = replica.store_access_time().await {
                tracing::warn!(session = %replica.id(), "Failed to record access time: {e}");
            }
        }
        if self.dispatcher.is_deferred() {
            replica.flush().await?;
        }
        Ok(())
    }

    /// Decode and apply one frame from the change bus.
    pub fn handle_frame(&self, frame: &[u8]) -> Option<RemoteOutcome> {
        match self.codec.decode(frame) {
            Ok(msg) => Some(self.on_remote_message(msg)),
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(node = %self.node_id, len = frame.len(), "Dropping undecodable change message: {e}");
                None
            }
        }
    }

    /// Apply a change published by another node to the resident replica.
    pub fn on_remote_message(&self, msg: ChangeMessage) -> RemoteOutcome {
        if msg.is_from(&self.node_id) {
            self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            return RemoteOutcome::Suppressed;
        }
        let Some(replica) = self.resident(msg.session_id()) else {
            self.counters.not_resident.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(session = %msg.session_id(), origin = %msg.origin(), "Change for non-resident session ignored");
            return RemoteOutcome::NotResident;
        };

        self.counters.applied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(session = %msg.session_id(), origin = %msg.origin(), "Applying remote change");
        let cleared = matches!(msg.change(), Change::SessionCleared);
        replica.apply_remote(msg.into_change());
        if cleared {
            self.evict(&replica);
            return RemoteOutcome::Evicted;
        }
        RemoteOutcome::Applied
    }

    pub fn metrics(&self) -> ListenerMetrics {
        ListenerMetrics {
            applied: self.counters.applied.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            not_resident: self.counters.not_resident.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
        }
    }

    /// Invalidate every resident replica past its idle timeout. Returns how
    /// many were invalidated.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(now_millis()).await
    }

    pub async fn sweep_expired_at(&self, now_ms: i64) -> usize {
        let candidates: Vec<Arc<SessionReplica>> = self
            .live
            .lock()
            .values()
            .filter(|r| r.is_expired_at(now_ms))
            .cloned()
            .collect();

        let mut expired = 0;
        for replica in candidates {
            if !replica.is_new() {
                // Another node may have served the session more recently.
                match replica.store().get(meta::LAST_ACCESSED_TIME).await {
                    Ok(Some(at)) => {
                        if let Some(at) = at.as_i64() {
                            replica.adopt_access_time(at);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(session = %replica.id(), "Access time unreadable, expiring on local state: {e}");
                    }
                }
                if !replica.is_expired_at(now_ms) {
                    continue;
                }
            }

            tracing::info!(session = %replica.id(), node = %self.node_id, "Session expired");
            if let Err(e) = self.invalidate(&replica).await {
                tracing::warn!(session = %replica.id(), "Expiry cleanup incomplete: {e}");
            }
            if self.dispatcher.is_deferred() {
                if let Err(e) = replica.flush().await {
                    tracing::warn!(session = %replica.id(), "Failed to announce expiry: {e}");
                }
            }
            expired += 1;
        }
        expired
    }
}

/// Bus handler feeding frames into a manager.
pub struct ChangeListener {
    manager: Weak<ReplicaManager>,
}

impl MessageHandler for ChangeListener {
    fn on_message(&self, _topic: &str, frame: &[u8]) {
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_frame(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::store::MemoryBackend;
    use serde_json::json;

    fn manager(node: &str, backend: &Arc<MemoryBackend>) -> ReplicaManager {
        ReplicaManager::new(
            ManagerConfig::default(),
            NodeId::from(node),
            backend.clone(),
            Arc::new(LocalBus::default()),
        )
    }

    #[tokio::test]
    async fn own_messages_are_suppressed() {
        let backend = Arc::new(MemoryBackend::new());
        let m = manager("n1", &backend);
        let r = m.create_new(Some("s"));
        let msg = ChangeMessage::new(
            &NodeId::from("n1"),
            "s",
            Change::AttributeSet { name: "k".into(), value: json!(1) },
        );
        assert_eq!(m.on_remote_message(msg), RemoteOutcome::Suppressed);
        assert_eq!(r.get_attribute("k").await, None);
        assert_eq!(m.metrics().suppressed, 1);
    }

    #[tokio::test]
    async fn remote_clear_evicts_without_store_delete() {
        let backend = Arc::new(MemoryBackend::new());
        let m = manager("n1", &backend);
        let r = m.create_new(Some("s"));
        r.persist().await.unwrap();
        let writes = backend.stats().writes;

        let msg = ChangeMessage::new(&NodeId::from("n2"), "s", Change::SessionCleared);
        assert_eq!(m.on_remote_message(msg), RemoteOutcome::Evicted);
        assert!(m.resident("s").is_none());
        // Evicted, not invalidated: a request still holding it can go on.
        assert!(r.is_valid());
        assert_eq!(backend.stats().writes, writes);
        assert!(m.find_or_load("s").await.is_some());
    }

    #[tokio::test]
    async fn garbage_frames_count_as_decode_errors() {
        let backend = Arc::new(MemoryBackend::new());
        let m = manager("n1", &backend);
        assert_eq!(m.handle_frame(b""), None);
        assert_eq!(m.handle_frame(b"J{not json"), None);
        assert_eq!(m.metrics().decode_errors, 2);
    }

    #[tokio::test]
    async fn load_failure_reads_as_absent() {
        let backend = Arc::new(MemoryBackend::new());
        let m = manager("n1", &backend);
        backend.set_available(false);
        assert!(m.find_or_load("missing").await.is_none());
    }

    #[tokio::test]
    async fn sweep_keeps_sessions_accessed_elsewhere() {
        let backend = Arc::new(MemoryBackend::new());
        let m = manager("n1", &backend);
        let r = m.create_new(Some("s"));
        r.persist().await.unwrap();

        let later = r.last_access_time() + 10 * 60_000;
        r.store()
            .put(meta::LAST_ACCESSED_TIME, json!(later))
            .await
            .unwrap();
        let now = r.last_access_time() + ManagerConfig::default().session_timeout_secs * 1000 + 1;

        assert_eq!(m.sweep_expired_at(now).await, 0);
        assert!(m.resident("s").is_some());
        assert_eq!(r.last_access_time(), later);
    }

    #[tokio::test]
    async fn complete_request_persists_new_sessions() {
        let backend = Arc::new(MemoryBackend::new());
        let m = manager("n1", &backend);
        let r = m.create_new(None);
        assert_eq!(r.id().len(), 26);
        r.set_attribute("k", json!("v")).await.unwrap();
        m.complete_request(&r).await.unwrap();
        assert!(!r.is_new());
        assert!(backend.contains(r.store().collection()));
    }
}
