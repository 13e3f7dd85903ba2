//! Shared key/value storage for session attributes.
//!
//! A [`KeyValueBackend`] is the external store: a set of named collections,
//! each a map from attribute name to value. [`RemoteAttributeStore`] is the
//! handle one replica holds on its own collection; it bounds every call by the
//! configured remote-call timeout.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::message::AttrValue;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Map-of-maps storage shared by every node of a scope.
///
/// Implementations provide their own connection management; they report
/// failures as [`Error::StoreUnavailable`]. Collections with an expiry in the
/// past must read as empty.
#[async_trait]
pub trait KeyValueBackend: Send + Sync + 'static {
    /// Cheap reachability check used at node startup.
    async fn ping(&self) -> Result<()>;

    /// Values for the requested names; missing names are omitted.
    async fn get_all(&self, collection: &str, names: &[String]) -> Result<HashMap<String, AttrValue>>;

    /// Every entry of the collection.
    async fn read_all(&self, collection: &str) -> Result<HashMap<String, AttrValue>>;

    async fn put_all(&self, collection: &str, entries: HashMap<String, AttrValue>) -> Result<()>;

    async fn remove(&self, collection: &str, names: &[String]) -> Result<()>;

    /// Remove every entry but keep the collection's expiry.
    async fn clear(&self, collection: &str) -> Result<()>;

    /// Remove the collection entirely. Returns whether it existed.
    async fn delete(&self, collection: &str) -> Result<bool>;

    /// Set (`Some`) or drop (`None`) the collection's time-to-live.
    async fn expire(&self, collection: &str, ttl: Option<Duration>) -> Result<()>;

    /// Names of live collections starting with `prefix`.
    async fn collections(&self, prefix: &str) -> Result<Vec<String>>;
}

/// One session's collection in the shared store.
#[derive(Clone)]
pub struct RemoteAttributeStore {
    backend: Arc<dyn KeyValueBackend>,
    collection: String,
    timeout: Duration,
}

impl std::fmt::Debug for RemoteAttributeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAttributeStore")
            .field("collection", &self.collection)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteAttributeStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>, collection: String, timeout: Duration) -> Self {
        Self { backend, collection, timeout }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::StoreTimeout(self.timeout)),
        }
    }

    pub async fn get_all(&self, names: &[String]) -> Result<HashMap<String, AttrValue>> {
        self.call(self.backend.get_all(&self.collection, names)).await
    }

    pub async fn get(&self, name: &str) -> Result<Option<AttrValue>> {
        let mut found = self.get_all(&[name.to_string()]).await?;
        Ok(found.remove(name))
    }

    pub async fn read_all(&self) -> Result<HashMap<String, AttrValue>> {
        self.call(self.backend.read_all(&self.collection)).await
    }

    pub async fn put(&self, name: &str, value: AttrValue) -> Result<()> {
        self.put_all(HashMap::from([(name.to_string(), value)])).await
    }

    pub async fn put_all(&self, entries: HashMap<String, AttrValue>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.call(self.backend.put_all(&self.collection, entries)).await
    }

    pub async fn remove(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.call(self.backend.remove(&self.collection, names)).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.call(self.backend.clear(&self.collection)).await
    }

    pub async fn delete_collection(&self) -> Result<bool> {
        self.call(self.backend.delete(&self.collection)).await
    }

    pub async fn expire(&self, ttl: Option<Duration>) -> Result<()> {
        self.call(self.backend.expire(&self.collection, ttl)).await
    }
}
