//! Update dispatch: how local mutations reach the store and the change bus.
//!
//! Under [`UpdateMode::Immediate`] every mutation is written to the store and
//! then announced on the bus, in that order, before the mutating call
//! returns. Under [`UpdateMode::Deferred`] mutations only mark names in a
//! [`PendingChanges`] set; `flush` later writes the final value of every
//! marked name in one batch and announces it with at most one message per
//! kind (cleared, bulk-set, removed).
//!
//! Pending marks carry a sequence number. A flush snapshots the marks, and on
//! success forgets only the marks whose sequence is unchanged, so a mutation
//! that lands while the batch is in flight stays dirty for the next flush,
//! and a failed flush leaves everything in place for a retry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::bus::ChangeBus;
use crate::config::{ReadMode, UpdateMode};
use crate::error::Result;
use crate::ids::NodeId;
use crate::message::{AttrValue, Change, ChangeMessage, Codec};
use crate::replica::meta;
use crate::store::RemoteAttributeStore;

/// Deferred-mode record of what changed since the last flush.
#[derive(Debug, Default)]
pub struct PendingChanges {
    seq: u64,
    set: HashMap<String, u64>,
    removed: HashMap<String, u64>,
    cleared: Option<u64>,
}

impl PendingChanges {
    fn bump(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub fn mark_set(&mut self, name: &str) {
        let seq = self.bump();
        self.removed.remove(name);
        self.set.insert(name.to_string(), seq);
    }

    pub fn mark_removed(&mut self, name: &str) {
        let seq = self.bump();
        self.set.remove(name);
        self.removed.insert(name.to_string(), seq);
    }

    /// Everything before this point is superseded by a clear.
    pub fn mark_cleared(&mut self) {
        let seq = self.bump();
        self.set.clear();
        self.removed.clear();
        self.cleared = Some(seq);
    }

    /// Drop any mark for `name`; a remote update replaced the local one.
    pub fn forget(&mut self, name: &str) {
        self.set.remove(name);
        self.removed.remove(name);
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty() && self.cleared.is_none()
    }

    pub fn is_marked(&self, name: &str) -> bool {
        self.set.contains_key(name) || self.removed.contains_key(name)
    }

    pub fn cleared(&self) -> bool {
        self.cleared.is_some()
    }

    /// Names set or removed since the last flush.
    pub fn dirty_names(&self) -> BTreeSet<String> {
        self.set.keys().chain(self.removed.keys()).cloned().collect()
    }

    /// Freeze the current marks into a batch, reading final values from `attributes`.
    pub fn snapshot(&self, attributes: &HashMap<String, AttrValue>) -> FlushBatch {
        let mut attrs = HashMap::new();
        let mut removed = BTreeSet::new();
        let mut marks = Vec::with_capacity(self.set.len() + self.removed.len());
        for (name, &seq) in &self.set {
            match attributes.get(name) {
                Some(value) => {
                    attrs.insert(name.clone(), value.clone());
                }
                None => {
                    removed.insert(name.clone());
                }
            }
            marks.push((name.clone(), seq));
        }
        for (name, &seq) in &self.removed {
            removed.insert(name.clone());
            marks.push((name.clone(), seq));
        }
        FlushBatch {
            attrs,
            removed,
            cleared: self.cleared,
            marks,
        }
    }

    /// Forget the marks a successful flush carried, unless they moved on since.
    pub fn ack(&mut self, batch: &FlushBatch) {
        for (name, seq) in &batch.marks {
            if self.set.get(name) == Some(seq) {
                self.set.remove(name);
            }
            if self.removed.get(name) == Some(seq) {
                self.removed.remove(name);
            }
        }
        if batch.cleared.is_some() && self.cleared == batch.cleared {
            self.cleared = None;
        }
    }
}

/// A frozen set of pending changes on its way to the store.
#[derive(Debug, Clone, Default)]
pub struct FlushBatch {
    pub attrs: HashMap<String, AttrValue>,
    pub removed: BTreeSet<String>,
    cleared: Option<u64>,
    marks: Vec<(String, u64)>,
}

impl FlushBatch {
    pub fn is_cleared(&self) -> bool {
        self.cleared.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty() && self.cleared.is_none()
    }
}

/// Writes replica changes to the store and announces them to other nodes.
pub struct UpdateDispatcher {
    mode: UpdateMode,
    read_mode: ReadMode,
    node_id: NodeId,
    topic: String,
    codec: Codec,
    bus: Arc<dyn ChangeBus>,
}

impl UpdateDispatcher {
    pub fn new(
        mode: UpdateMode,
        read_mode: ReadMode,
        node_id: NodeId,
        topic: String,
        codec: Codec,
        bus: Arc<dyn ChangeBus>,
    ) -> Self {
        Self { mode, read_mode, node_id, topic, codec, bus }
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    pub fn read_mode(&self) -> ReadMode {
        self.read_mode
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn is_deferred(&self) -> bool {
        self.mode == UpdateMode::Deferred
    }

    /// Announce a change. Only nodes that cache attributes publish; with
    /// store reads nobody holds a copy that could go stale.
    pub fn publish(&self, session_id: &str, change: Change) {
        if self.read_mode != ReadMode::Memory {
            return;
        }
        let msg = ChangeMessage::new(&self.node_id, session_id, change);
        match self.codec.encode(&msg) {
            Ok(frame) => self.bus.publish(&self.topic, frame),
            Err(e) => tracing::error!(session = %session_id, "Failed to encode change message: {e}"),
        }
    }

    pub async fn push_set(
        &self,
        store: &RemoteAttributeStore,
        session_id: &str,
        name: &str,
        value: AttrValue,
    ) -> Result<()> {
        store.put(name, value.clone()).await?;
        self.publish(session_id, Change::AttributeSet { name: name.to_string(), value });
        Ok(())
    }

    pub async fn push_removed(
        &self,
        store: &RemoteAttributeStore,
        session_id: &str,
        names: BTreeSet<String>,
    ) -> Result<()> {
        let list: Vec<String> = names.iter().cloned().collect();
        store.remove(&list).await?;
        self.publish(session_id, Change::AttributesRemoved { names });
        Ok(())
    }

    pub async fn push_cleared(&self, store: &RemoteAttributeStore, session_id: &str) -> Result<()> {
        clear_user_attributes(store).await?;
        self.publish(session_id, Change::SessionCleared);
        Ok(())
    }

    /// Write a deferred batch, then announce it. Nothing is published unless
    /// every store write succeeded.
    pub async fn push_batch(
        &self,
        store: &RemoteAttributeStore,
        session_id: &str,
        batch: &FlushBatch,
    ) -> Result<()> {
        if batch.is_cleared() {
            clear_user_attributes(store).await?;
        }
        store.put_all(batch.attrs.clone()).await?;
        let removed: Vec<String> = batch.removed.iter().cloned().collect();
        store.remove(&removed).await?;

        self.announce_batch(session_id, batch);
        Ok(())
    }

    pub fn announce_batch(&self, session_id: &str, batch: &FlushBatch) {
        if batch.is_cleared() {
            self.publish(session_id, Change::SessionCleared);
        }
        if !batch.attrs.is_empty() {
            self.publish(
                session_id,
                Change::AttributesBulkSet { attrs: batch.attrs.clone() },
            );
        }
        if !batch.removed.is_empty() {
            self.publish(
                session_id,
                Change::AttributesRemoved { names: batch.removed.clone() },
            );
        }
    }
}

/// Remove every user attribute from the collection, keeping session metadata.
pub(crate) async fn clear_user_attributes(store: &RemoteAttributeStore) -> Result<()> {
    let names: Vec<String> = store
        .read_all()
        .await?
        .into_keys()
        .filter(|name| !meta::is_reserved(name))
        .collect();
    store.remove(&names).await
}
