//! In-process backend.
//!
//! Shared by every node created in the same process, which makes it the
//! backend for tests and simulations. It can also fake outages, latency and
//! failing writes, and it counts the calls it serves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::KeyValueBackend;
use crate::error::{Error, Result};
use crate::message::AttrValue;

#[derive(Debug, Default)]
struct Collection {
    entries: HashMap<String, AttrValue>,
    expires_at: Option<Instant>,
}

impl Collection {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Call counters, for asserting how much traffic an operation caused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub reads: u64,
    pub writes: u64,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    collections: Mutex<HashMap<String, Collection>>,
    unavailable: AtomicBool,
    failing_writes: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated outage: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make the next `n` write calls fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
        }
    }

    /// Whether the collection currently exists (ignores outages; for tests).
    pub fn contains(&self, collection: &str) -> bool {
        let now = Instant::now();
        self.collections
            .lock()
            .get(collection)
            .is_some_and(|c| !c.expired(now) && !c.entries.is_empty())
    }

    async fn enter(&self, write: bool) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory backend offline".into()));
        }
        if write {
            let failed = self
                .failing_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(Error::StoreUnavailable("injected write failure".into()));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Run `f` on the live (non-expired) collection, creating it if asked.
    fn with_collection<R>(
        &self,
        name: &str,
        create: bool,
        f: impl FnOnce(Option<&mut Collection>) -> R,
    ) -> R {
        let now = Instant::now();
        let mut collections = self.collections.lock();
        if collections.get(name).is_some_and(|c| c.expired(now)) {
            collections.remove(name);
        }
        if create {
            f(Some(collections.entry(name.to_string()).or_default()))
        } else {
            f(collections.get_mut(name))
        }
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        self.enter(false).await
    }

    async fn get_all(&self, collection: &str, names: &[String]) -> Result<HashMap<String, AttrValue>> {
        self.enter(false).await?;
        Ok(self.with_collection(collection, false, |c| {
            let Some(c) = c else { return HashMap::new() };
            names
                .iter()
                .filter_map(|n| c.entries.get(n).map(|v| (n.clone(), v.clone())))
                .collect()
        }))
    }

    async fn read_all(&self, collection: &str) -> Result<HashMap<String, AttrValue>> {
        self.enter(false).await?;
        Ok(self.with_collection(collection, false, |c| {
            c.map(|c| c.entries.clone()).unwrap_or_default()
        }))
    }

    async fn put_all(&self, collection: &str, entries: HashMap<String, AttrValue>) -> Result<()> {
        self.enter(true).await?;
        self.with_collection(collection, true, |c| {
            if let Some(c) = c {
                c.entries.extend(entries);
            }
        });
        Ok(())
    }

    async fn remove(&self, collection: &str, names: &[String]) -> Result<()> {
        self.enter(true).await?;
        self.with_collection(collection, false, |c| {
            if let Some(c) = c {
                for n in names {
                    c.entries.remove(n);
                }
            }
        });
        Ok(())
    }

    async fn clear(&self, collection: &str) -> Result<()> {
        self.enter(true).await?;
        self.with_collection(collection, false, |c| {
            if let Some(c) = c {
                c.entries.clear();
            }
        });
        Ok(())
    }

    async fn delete(&self, collection: &str) -> Result<bool> {
        self.enter(true).await?;
        let now = Instant::now();
        let removed = self.collections.lock().remove(collection);
        Ok(removed.is_some_and(|c| !c.expired(now) && !c.entries.is_empty()))
    }

    async fn expire(&self, collection: &str, ttl: Option<Duration>) -> Result<()> {
        self.enter(true).await?;
        let now = Instant::now();
        self.with_collection(collection, false, |c| {
            if let Some(c) = c {
                // A TTL too large to represent never expires.
                c.expires_at = ttl.and_then(|ttl| now.checked_add(ttl));
            }
        });
        Ok(())
    }

    async fn collections(&self, prefix: &str) -> Result<Vec<String>> {
        self.enter(false).await?;
        let now = Instant::now();
        let mut names: Vec<String> = self
            .collections
            .lock()
            .iter()
            .filter(|(name, c)| name.starts_with(prefix) && !c.expired(now) && !c.entries.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn expired_collections_read_empty() {
        let backend = MemoryBackend::new();
        backend
            .put_all("c", HashMap::from([("a".to_string(), json!(1))]))
            .await
            .unwrap();
        backend.expire("c", Some(Duration::from_millis(10))).await.unwrap();
        assert!(backend.contains("c"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend.read_all("c").await.unwrap().is_empty());
        assert!(!backend.contains("c"));
    }

    #[tokio::test]
    async fn huge_ttl_does_not_overflow() {
        let backend = MemoryBackend::new();
        backend
            .put_all("c", HashMap::from([("a".to_string(), json!(1))]))
            .await
            .unwrap();
        backend.expire("c", Some(Duration::MAX)).await.unwrap();
        backend.expire("c", Some(Duration::from_secs(i64::MAX as u64))).await.unwrap();
        assert_eq!(backend.read_all("c").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn injected_write_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_next_writes(1);
        let entries = HashMap::from([("a".to_string(), json!(1))]);
        assert!(backend.put_all("c", entries.clone()).await.is_err());
        backend.put_all("c", entries).await.unwrap();
        assert_eq!(backend.stats().writes, 1);
    }

    #[tokio::test]
    async fn collections_are_listed_by_prefix() {
        let backend = MemoryBackend::new();
        for name in ["p:x", "p:y", "q:z"] {
            backend
                .put_all(name, HashMap::from([("a".to_string(), json!(true))]))
                .await
                .unwrap();
        }
        assert_eq!(backend.collections("p:").await.unwrap(), vec!["p:x", "p:y"]);
        assert!(backend.delete("p:x").await.unwrap());
        assert!(!backend.delete("p:x").await.unwrap());
    }
}
