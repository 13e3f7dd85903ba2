//! In-process replica of one session.
//!
//! A replica caches the session's attributes and metadata behind a single
//! per-replica lock. Request code mutates it through [`SessionReplica`]'s
//! methods, which hand the change to the [`UpdateDispatcher`]; the change
//! listener applies remote changes through [`SessionReplica::apply_remote`],
//! which never dispatches. The lock is never held across a store call.
//!
//! # Lifecycle
//!
//! ```text
//! New ──persist──▶ Persisted ──────────invalidate──────────▶ Invalid
//!  └──────────────────invalidate─────────────────────────────┘
//! ```
//!
//! While `New`, mutations stay local; the first `persist` writes the whole
//! session. `Invalid` is terminal and rejects mutation. A clear received
//! from another node empties the replica but leaves it valid.
//!
//! Mutations and store writes of one replica are serialized by a second,
//! async push lock, so a write issued while a persist is in flight lands
//! after it instead of being lost.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{ReadMode, UpdateMode};
use crate::dispatcher::{PendingChanges, UpdateDispatcher};
use crate::error::{Error, Result};
use crate::message::{AttrValue, Change};
use crate::store::RemoteAttributeStore;

/// Reserved collection entries describing the session itself.
pub mod meta {
    pub const PREFIX: &str = "session:";
    pub const CREATION_TIME: &str = "session:creationTime";
    pub const LAST_ACCESSED_TIME: &str = "session:lastAccessedTime";
    pub const MAX_INACTIVE_INTERVAL: &str = "session:maxInactiveInterval";
    pub const IS_VALID: &str = "session:isValid";

    pub const ALL: [&str; 4] = [CREATION_TIME, LAST_ACCESSED_TIME, MAX_INACTIVE_INTERVAL, IS_VALID];

    pub fn is_reserved(name: &str) -> bool {
        name.starts_with(PREFIX)
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created on this node, not yet written to the store.
    New,
    /// Known to the store.
    Persisted,
    /// Invalidated or expired. Terminal.
    Invalid,
}

#[derive(Debug)]
struct ReplicaState {
    attributes: HashMap<String, AttrValue>,
    creation_time: i64,
    last_access_time: i64,
    max_inactive_secs: i64,
    lifecycle: Lifecycle,
    pending: PendingChanges,
}

impl ReplicaState {
    fn ensure_valid(&self, id: &str) -> Result<()> {
        if self.lifecycle == Lifecycle::Invalid {
            return Err(Error::InvalidState(id.to_string()));
        }
        Ok(())
    }

    fn expired_at(&self, now_ms: i64) -> bool {
        self.max_inactive_secs > 0
            && now_ms.saturating_sub(self.last_access_time) > self.max_inactive_secs.saturating_mul(1000)
    }

    fn meta_entries(&self) -> HashMap<String, AttrValue> {
        HashMap::from([
            (meta::CREATION_TIME.to_string(), AttrValue::from(self.creation_time)),
            (meta::LAST_ACCESSED_TIME.to_string(), AttrValue::from(self.last_access_time)),
            (meta::MAX_INACTIVE_INTERVAL.to_string(), AttrValue::from(self.max_inactive_secs)),
            (meta::IS_VALID.to_string(), AttrValue::Bool(true)),
        ])
    }

    fn ttl(&self) -> Option<Duration> {
        (self.max_inactive_secs > 0).then(|| Duration::from_secs(self.max_inactive_secs as u64))
    }
}

/// What a local mutation needs after the local map was updated.
enum Route {
    /// Kept locally: the replica is new, or the batch waits for a flush.
    /// Either way the change is marked pending.
    Local,
    /// Push to the store and the bus now.
    Push,
}

pub struct SessionReplica {
    id: String,
    state: Mutex<ReplicaState>,
    /// Held across local update and store write; taken before `state`.
    push: tokio::sync::Mutex<()>,
    store: RemoteAttributeStore,
    dispatcher: Arc<UpdateDispatcher>,
}

impl std::fmt::Debug for SessionReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("SessionReplica")
            .field("id", &self.id)
            .field("lifecycle", &st.lifecycle)
            .field("attributes", &st.attributes.len())
            .finish()
    }
}

impl SessionReplica {
    /// A brand-new session that exists only on this node.
    pub fn new(
        id: String,
        max_inactive_secs: i64,
        store: RemoteAttributeStore,
        dispatcher: Arc<UpdateDispatcher>,
    ) -> Self {
        let now = now_millis();
        Self {
            id,
            state: Mutex::new(ReplicaState {
                attributes: HashMap::new(),
                creation_time: now,
                last_access_time: now,
                max_inactive_secs,
                lifecycle: Lifecycle::New,
                pending: PendingChanges::default(),
            }),
            push: tokio::sync::Mutex::new(()),
            store,
            dispatcher,
        }
    }

    /// Rebuild a replica from collection entries read from the store.
    ///
    /// Returns `None` when the entries don't describe a live session: the
    /// collection is missing, not marked valid, or already past its idle
    /// timeout according to its own timestamps.
    pub fn from_entries(
        id: String,
        mut entries: HashMap<String, AttrValue>,
        store: RemoteAttributeStore,
        dispatcher: Arc<UpdateDispatcher>,
    ) -> Option<Self> {
        let valid = entries.get(meta::IS_VALID).and_then(AttrValue::as_bool).unwrap_or(false);
        if !valid {
            return None;
        }
        let now = now_millis();
        let int = |name: &str| entries.get(name).and_then(AttrValue::as_i64);
        let creation_time = int(meta::CREATION_TIME).unwrap_or(now);
        let last_access_time = int(meta::LAST_ACCESSED_TIME).unwrap_or(creation_time);
        let max_inactive_secs = int(meta::MAX_INACTIVE_INTERVAL).unwrap_or(0);
        entries.retain(|name, _| !meta::is_reserved(name));

        let state = ReplicaState {
            attributes: entries,
            creation_time,
            last_access_time,
            max_inactive_secs,
            lifecycle: Lifecycle::Persisted,
            pending: PendingChanges::default(),
        };
        if state.expired_at(now) {
            tracing::debug!(session = %id, "Stored session already past its idle timeout");
            return None;
        }
        Some(Self {
            id,
            state: Mutex::new(state),
            push: tokio::sync::Mutex::new(()),
            store,
            dispatcher,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &RemoteAttributeStore {
        &self.store
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn is_valid(&self) -> bool {
        self.lifecycle() != Lifecycle::Invalid
    }

    pub fn is_new(&self) -> bool {
        self.lifecycle() == Lifecycle::New
    }

    pub fn creation_time(&self) -> i64 {
        self.state.lock().creation_time
    }

    pub fn last_access_time(&self) -> i64 {
        self.state.lock().last_access_time
    }

    pub fn max_inactive_secs(&self) -> i64 {
        self.state.lock().max_inactive_secs
    }

    /// Names changed since the last flush (deferred updates only).
    pub fn dirty_attributes(&self) -> BTreeSet<String> {
        self.state.lock().pending.dirty_names()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.state.lock().expired_at(now_ms)
    }

    pub fn touch(&self) {
        self.state.lock().last_access_time = now_millis();
    }

    pub fn end_access(&self) {
        self.touch();
    }

    /// Take a newer access time observed elsewhere (e.g. in the store).
    pub fn adopt_access_time(&self, at_ms: i64) {
        let mut st = self.state.lock();
        st.last_access_time = st.last_access_time.max(at_ms);
    }

    /// Read one attribute.
    ///
    /// With memory reads this never leaves the process. With store reads it
    /// fetches from the store unless the name has local changes not yet in
    /// the store; a failed fetch is logged and reads as absent.
    pub async fn get_attribute(&self, name: &str) -> Option<AttrValue> {
        {
            let mut st = self.state.lock();
            st.last_access_time = now_millis();
            if st.lifecycle == Lifecycle::Invalid {
                return None;
            }
            let local = self.dispatcher.read_mode() == ReadMode::Memory
                || st.lifecycle == Lifecycle::New
                || st.pending.is_marked(name);
            if local {
                return st.attributes.get(name).cloned();
            }
        }
        match self.store.get(name).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(session = %self.id, attribute = name, "Attribute read failed, treating as absent: {e}");
                None
            }
        }
    }

    /// Names of all user attributes.
    pub async fn attribute_names(&self) -> BTreeSet<String> {
        let (mut names, remote) = {
            let st = self.state.lock();
            let remote = self.dispatcher.read_mode() == ReadMode::Store
                && st.lifecycle == Lifecycle::Persisted;
            (st.attributes.keys().cloned().collect::<BTreeSet<_>>(), remote)
        };
        if remote {
            match self.store.read_all().await {
                Ok(entries) => names.extend(entries.into_keys().filter(|n| !meta::is_reserved(n))),
                Err(e) => tracing::warn!(session = %self.id, "Attribute listing failed: {e}"),
            }
        }
        names
    }

    fn route(&self, st: &mut ReplicaState, mark: impl FnOnce(&mut PendingChanges)) -> Route {
        match (st.lifecycle, self.dispatcher.mode()) {
            (Lifecycle::New, _) | (_, UpdateMode::Deferred) => {
                mark(&mut st.pending);
                Route::Local
            }
            (_, UpdateMode::Immediate) => Route::Push,
        }
    }

    /// Set an attribute. Under immediate updates the store write and the
    /// change message happen before this returns; a store failure is returned
    /// but the local value stays set.
    pub async fn set_attribute(&self, name: &str, value: AttrValue) -> Result<()> {
        if meta::is_reserved(name) {
            return Err(Error::ReservedAttribute(name.to_string()));
        }
        let _push = self.push.lock().await;
        let route = {
            let mut st = self.state.lock();
            st.ensure_valid(&self.id)?;
            st.last_access_time = now_millis();
            st.attributes.insert(name.to_string(), value.clone());
            self.route(&mut st, |p| p.mark_set(name))
        };
        match route {
            Route::Local => Ok(()),
            Route::Push => self.dispatcher.push_set(&self.store, &self.id, name, value).await,
        }
    }

    pub async fn remove_attribute(&self, name: &str) -> Result<()> {
        if meta::is_reserved(name) {
            return Err(Error::ReservedAttribute(name.to_string()));
        }
        let _push = self.push.lock().await;
        let route = {
            let mut st = self.state.lock();
            st.ensure_valid(&self.id)?;
            st.last_access_time = now_millis();
            st.attributes.remove(name);
            self.route(&mut st, |p| p.mark_removed(name))
        };
        match route {
            Route::Local => Ok(()),
            Route::Push => {
                let names = BTreeSet::from([name.to_string()]);
                self.dispatcher.push_removed(&self.store, &self.id, names).await
            }
        }
    }

    /// Remove every user attribute. Other nodes drop their copy and reload.
    pub async fn clear(&self) -> Result<()> {
        let _push = self.push.lock().await;
        let route = {
            let mut st = self.state.lock();
            st.ensure_valid(&self.id)?;
            st.attributes.clear();
            self.route(&mut st, PendingChanges::mark_cleared)
        };
        match route {
            Route::Local => Ok(()),
            Route::Push => self.dispatcher.push_cleared(&self.store, &self.id).await,
        }
    }

    /// Change the idle timeout; written straight to the store once persisted.
    pub async fn set_max_inactive(&self, secs: i64) -> Result<()> {
        let _push = self.push.lock().await;
        let (persisted, ttl) = {
            let mut st = self.state.lock();
            st.ensure_valid(&self.id)?;
            st.max_inactive_secs = secs;
            (st.lifecycle == Lifecycle::Persisted, st.ttl())
        };
        if persisted {
            self.store.put(meta::MAX_INACTIVE_INTERVAL, AttrValue::from(secs)).await?;
            self.store.expire(ttl).await?;
        }
        Ok(())
    }

    /// Apply a change made on another node. Never dispatches.
    ///
    /// Remote values win over local ones, including local changes still
    /// waiting for a deferred flush: their pending marks are dropped.
    pub fn apply_remote(&self, change: Change) {
        let mut st = self.state.lock();
        if st.lifecycle == Lifecycle::Invalid {
            return;
        }
        match change {
            Change::AttributeSet { name, value } => {
                st.pending.forget(&name);
                st.attributes.insert(name, value);
            }
            Change::AttributesBulkSet { attrs } => {
                for (name, value) in attrs {
                    st.pending.forget(&name);
                    st.attributes.insert(name, value);
                }
            }
            Change::AttributesRemoved { names } => {
                for name in names {
                    st.pending.forget(&name);
                    st.attributes.remove(&name);
                }
            }
            // Emptied elsewhere, not invalidated: the session stays usable.
            Change::SessionCleared => {
                st.attributes.clear();
                st.pending = PendingChanges::default();
            }
        }
    }

    /// Mark invalid. Returns whether the replica was valid before.
    pub(crate) fn mark_invalid(&self) -> bool {
        let mut st = self.state.lock();
        let was_valid = st.lifecycle != Lifecycle::Invalid;
        st.lifecycle = Lifecycle::Invalid;
        was_valid
    }

    /// Leave a clear behind for the next deferred flush to announce.
    pub(crate) fn mark_pending_clear(&self) {
        let mut st = self.state.lock();
        st.attributes.clear();
        st.pending = PendingChanges::default();
        st.pending.mark_cleared();
    }

    /// Write the whole session to the store.
    ///
    /// The first successful persist moves a new replica to `Persisted`.
    /// Persisting again rewrites every attribute and applies any pending
    /// removals and clears, so it doubles as a full flush.
    pub async fn persist(&self) -> Result<()> {
        let _push = self.push.lock().await;
        let (entries, batch, was_persisted, ttl) = {
            let st = self.state.lock();
            st.ensure_valid(&self.id)?;
            let mut entries = st.meta_entries();
            entries.extend(st.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
            let batch = st.pending.snapshot(&st.attributes);
            (entries, batch, st.lifecycle == Lifecycle::Persisted, st.ttl())
        };

        if was_persisted && batch.is_cleared() {
            crate::dispatcher::clear_user_attributes(&self.store).await?;
        }
        self.store.put_all(entries).await?;
        if was_persisted {
            let removed: Vec<String> = batch.removed.iter().cloned().collect();
            self.store.remove(&removed).await?;
        }
        if let Err(e) = self.store.expire(ttl).await {
            tracing::warn!(session = %self.id, "Failed to set session expiry: {e}");
        }

        let invalidated = {
            let mut st = self.state.lock();
            st.pending.ack(&batch);
            match st.lifecycle {
                Lifecycle::New => {
                    st.lifecycle = Lifecycle::Persisted;
                    false
                }
                Lifecycle::Persisted => false,
                Lifecycle::Invalid => true,
            }
        };
        if invalidated {
            // Invalidated while the write was in flight; don't resurrect it.
            if let Err(e) = self.store.delete_collection().await {
                tracing::warn!(session = %self.id, "Failed to delete invalidated session: {e}");
            }
            return Ok(());
        }

        tracing::debug!(session = %self.id, first = !was_persisted, "Session persisted");
        if was_persisted {
            let attrs = {
                let st = self.state.lock();
                st.attributes.clone()
            };
            if batch.is_cleared() {
                self.dispatcher.publish(&self.id, Change::SessionCleared);
            }
            if !attrs.is_empty() {
                self.dispatcher.publish(&self.id, Change::AttributesBulkSet { attrs });
            }
            if !batch.removed.is_empty() {
                self.dispatcher.publish(
                    &self.id,
                    Change::AttributesRemoved { names: batch.removed.clone() },
                );
            }
        }
        Ok(())
    }

    /// Push deferred changes. A new replica is persisted instead; an
    /// invalidated one only announces its pending clear. Without pending
    /// changes this makes no store call and publishes nothing. On failure the
    /// pending set is kept, so calling `flush` again retries the same batch.
    pub async fn flush(&self) -> Result<()> {
        if self.is_new() {
            return self.persist().await;
        }
        let _push = self.push.lock().await;
        let batch = {
            let mut st = self.state.lock();
            let lifecycle = st.lifecycle;
            match lifecycle {
                // Never `New` here: that was persisted above.
                Lifecycle::New | Lifecycle::Persisted => {
                    if st.pending.is_empty() {
                        return Ok(());
                    }
                    st.pending.snapshot(&st.attributes)
                }
                Lifecycle::Invalid => {
                    if st.pending.cleared() {
                        st.pending = PendingChanges::default();
                        drop(st);
                        self.dispatcher.publish(&self.id, Change::SessionCleared);
                    }
                    return Ok(());
                }
            }
        };

        if let Err(e) = self.dispatcher.push_batch(&self.store, &self.id, &batch).await {
            tracing::warn!(session = %self.id, "Flush failed, keeping {} pending change(s): {e}", batch.removed.len() + batch.attrs.len());
            return Err(e);
        }
        self.state.lock().pending.ack(&batch);
        tracing::debug!(
            session = %self.id,
            set = batch.attrs.len(),
            removed = batch.removed.len(),
            cleared = batch.is_cleared(),
            "Flushed pending changes"
        );
        Ok(())
    }

    /// Record the current access time (and refresh the expiry) in the store.
    pub async fn store_access_time(&self) -> Result<()> {
        let _push = self.push.lock().await;
        let (at, ttl) = {
            let st = self.state.lock();
            if st.lifecycle != Lifecycle::Persisted {
                return Ok(());
            }
            (st.last_access_time, st.ttl())
        };
        self.store.put(meta::LAST_ACCESSED_TIME, AttrValue::from(at)).await?;
        self.store.expire(ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::config::EncodingFormat;
    use crate::ids::NodeId;
    use crate::message::Codec;
    use crate::store::{KeyValueBackend, MemoryBackend};
    use serde_json::json;

    fn replica(mode: UpdateMode, backend: &Arc<MemoryBackend>) -> SessionReplica {
        let dispatcher = Arc::new(UpdateDispatcher::new(
            mode,
            ReadMode::Memory,
            NodeId::from("n1"),
            "topic".into(),
            Codec::for_format(EncodingFormat::Json),
            Arc::new(LocalBus::default()),
        ));
        let store = RemoteAttributeStore::new(backend.clone(), "c".into(), Duration::from_secs(1));
        SessionReplica::new("s1".into(), 60, store, dispatcher)
    }

    #[tokio::test]
    async fn new_replica_buffers_until_persist() {
        let backend = Arc::new(MemoryBackend::new());
        let r = replica(UpdateMode::Immediate, &backend);
        r.set_attribute("a", json!(1)).await.unwrap();
        assert_eq!(backend.stats().writes, 0);
        assert!(r.is_new());

        r.persist().await.unwrap();
        assert_eq!(r.lifecycle(), Lifecycle::Persisted);
        let stored = backend.read_all("c").await.unwrap();
        assert_eq!(stored["a"], json!(1));
        assert_eq!(stored[meta::IS_VALID], json!(true));
        assert_eq!(stored[meta::MAX_INACTIVE_INTERVAL], json!(60));
    }

    #[tokio::test]
    async fn immediate_write_failure_keeps_local_value() {
        let backend = Arc::new(MemoryBackend::new());
        let r = replica(UpdateMode::Immediate, &backend);
        r.persist().await.unwrap();
        backend.set_available(false);
        let err = r.set_attribute("a", json!("local")).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert_eq!(r.get_attribute("a").await, Some(json!("local")));
    }

    #[tokio::test]
    async fn reserved_names_are_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let r = replica(UpdateMode::Immediate, &backend);
        let err = r.set_attribute(meta::IS_VALID, json!(false)).await.unwrap_err();
        assert!(matches!(err, Error::ReservedAttribute(_)));
    }

    #[tokio::test]
    async fn deferred_flush_without_changes_is_silent() {
        let backend = Arc::new(MemoryBackend::new());
        let r = replica(UpdateMode::Deferred, &backend);
        r.persist().await.unwrap();
        let before = backend.stats();
        r.flush().await.unwrap();
        assert_eq!(backend.stats(), before);
    }

    #[tokio::test]
    async fn deferred_clear_keeps_metadata() {
        let backend = Arc::new(MemoryBackend::new());
        let r = replica(UpdateMode::Deferred, &backend);
        r.set_attribute("a", json!(1)).await.unwrap();
        r.persist().await.unwrap();
        r.clear().await.unwrap();
        r.set_attribute("b", json!(2)).await.unwrap();
        r.flush().await.unwrap();

        let stored = backend.read_all("c").await.unwrap();
        assert!(!stored.contains_key("a"));
        assert_eq!(stored["b"], json!(2));
        assert_eq!(stored[meta::IS_VALID], json!(true));
    }

    #[tokio::test]
    async fn remote_values_win_over_pending_ones() {
        let backend = Arc::new(MemoryBackend::new());
        let r = replica(UpdateMode::Deferred, &backend);
        r.persist().await.unwrap();
        r.set_attribute("k", json!("local")).await.unwrap();
        r.apply_remote(Change::AttributeSet { name: "k".into(), value: json!("remote") });
        assert_eq!(r.get_attribute("k").await, Some(json!("remote")));
        assert!(r.dirty_attributes().is_empty());
    }

    #[tokio::test]
    async fn remote_clear_empties_but_keeps_the_session_usable() {
        let backend = Arc::new(MemoryBackend::new());
        let r = replica(UpdateMode::Immediate, &backend);
        r.set_attribute("k", json!(1)).await.unwrap();
        r.persist().await.unwrap();
        r.apply_remote(Change::SessionCleared);
        assert!(r.is_valid());
        assert_eq!(r.get_attribute("k").await, None);
        r.set_attribute("k2", json!(2)).await.unwrap();
        assert_eq!(backend.read_all("c").await.unwrap()["k2"], json!(2));
    }

    #[tokio::test]
    async fn write_during_first_persist_is_not_lost() {
        let backend = Arc::new(MemoryBackend::new());
        let r = Arc::new(replica(UpdateMode::Immediate, &backend));
        r.set_attribute("early", json!(1)).await.unwrap();
        backend.set_latency(Some(Duration::from_millis(100)));
        let persisting = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.persist().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        r.set_attribute("late", json!("x")).await.unwrap();
        persisting.await.unwrap().unwrap();
        backend.set_latency(None);

        let stored = backend.read_all("c").await.unwrap();
        assert_eq!(stored["early"], json!(1));
        assert_eq!(stored["late"], json!("x"));
        assert!(!r.has_pending_changes());
    }

    #[tokio::test]
    async fn deferred_write_while_new_is_pending_until_persist() {
        let backend = Arc::new(MemoryBackend::new());
        let r = replica(UpdateMode::Deferred, &backend);
        r.set_attribute("a", json!(1)).await.unwrap();
        assert!(r.dirty_attributes().contains("a"));
        r.flush().await.unwrap();
        assert!(!r.is_new());
        assert!(!r.has_pending_changes());
        assert_eq!(backend.read_all("c").await.unwrap()["a"], json!(1));
    }

    #[tokio::test]
    async fn huge_idle_timeout_does_not_overflow() {
        let backend = Arc::new(MemoryBackend::new());
        let r = replica(UpdateMode::Immediate, &backend);
        r.persist().await.unwrap();
        r.set_max_inactive(i64::MAX).await.unwrap();
        assert!(!r.is_expired_at(i64::MAX));
        let stored = backend.read_all("c").await.unwrap();
        assert_eq!(stored[meta::MAX_INACTIVE_INTERVAL], json!(i64::MAX));
        assert!(backend.contains("c"));
    }

    #[test]
    fn expiry_window() {
        let backend = Arc::new(MemoryBackend::new());
        let r = replica(UpdateMode::Immediate, &backend);
        let last = r.last_access_time();
        assert!(!r.is_expired_at(last + 60_000));
        assert!(r.is_expired_at(last + 60_001));
    }

    #[test]
    fn invalid_or_expired_entries_do_not_load() {
        let backend: Arc<MemoryBackend> = Arc::new(MemoryBackend::new());
        let store = RemoteAttributeStore::new(backend, "c".into(), Duration::from_secs(1));
        let dispatcher = Arc::new(UpdateDispatcher::new(
            UpdateMode::Immediate,
            ReadMode::Memory,
            NodeId::from("n1"),
            "t".into(),
            Codec::for_format(EncodingFormat::Json),
            Arc::new(LocalBus::default()),
        ));
        let load = |entries: HashMap<String, AttrValue>| {
            SessionReplica::from_entries("s".into(), entries, store.clone(), dispatcher.clone())
        };

        assert!(load(HashMap::new()).is_none());
        assert!(load(HashMap::from([(meta::IS_VALID.to_string(), json!(false))])).is_none());

        let stale = HashMap::from([
            (meta::IS_VALID.to_string(), json!(true)),
            (meta::LAST_ACCESSED_TIME.to_string(), json!(0)),
            (meta::MAX_INACTIVE_INTERVAL.to_string(), json!(10)),
        ]);
        assert!(load(stale).is_none());

        let live = HashMap::from([
            (meta::IS_VALID.to_string(), json!(true)),
            (meta::LAST_ACCESSED_TIME.to_string(), json!(now_millis())),
            (meta::MAX_INACTIVE_INTERVAL.to_string(), json!(10)),
            ("cart".to_string(), json!(["x"])),
        ]);
        let r = load(live).unwrap();
        assert_eq!(r.lifecycle(), Lifecycle::Persisted);
        assert_eq!(r.max_inactive_secs(), 10);
        assert_eq!(r.state.lock().attributes.len(), 1);
    }
}
