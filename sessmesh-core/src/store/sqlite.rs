//! SQLite backend.
//!
//! Keeps every collection in one table keyed by `(collection, name)`, with
//! values stored as JSON text. Expiry lives in a side table and is enforced
//! lazily on read. Several processes on one host can share the file; WAL mode
//! keeps readers from blocking the writer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use super::KeyValueBackend;
use crate::error::{Error, Result};
use crate::message::AttrValue;

pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Drop the collection if its expiry has passed.
fn purge_if_expired(conn: &Connection, collection: &str, now: i64) -> rusqlite::Result<()> {
    let expires_at: Option<i64> = conn
        .query_row(
            "SELECT expires_at FROM collection_ttl WHERE collection = ?1",
            params![collection],
            |row| row.get(0),
        )
        .optional()?;
    if expires_at.is_some_and(|t| t <= now) {
        conn.execute("DELETE FROM entries WHERE collection = ?1", params![collection])?;
        conn.execute("DELETE FROM collection_ttl WHERE collection = ?1", params![collection])?;
    }
    Ok(())
}

fn decode_value(text: &str) -> AttrValue {
    serde_json::from_str(text).unwrap_or_else(|e| {
        tracing::warn!("Undecodable stored value, keeping raw text: {e}");
        AttrValue::String(text.to_string())
    })
}

impl SqliteBackend {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS entries (
                collection TEXT NOT NULL,
                name       TEXT NOT NULL,
                value      TEXT NOT NULL,
                PRIMARY KEY (collection, name)
            );

            CREATE TABLE IF NOT EXISTS collection_ttl (
                collection TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run a blocking closure against the connection off the async workers.
    async fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut *conn)
        })
        .await
        .map_err(|e| Error::StoreUnavailable(format!("sqlite worker failed: {e}")))?
        .map_err(Error::from)
    }

    /// Delete every expired collection. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = now_millis();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM entries WHERE collection IN
                    (SELECT collection FROM collection_ttl WHERE expires_at <= ?1)",
                params![now],
            )?;
            let n = tx.execute("DELETE FROM collection_ttl WHERE expires_at <= ?1", params![now])?;
            tx.commit()?;
            Ok(n)
        })
        .await
    }
}

#[async_trait]
impl KeyValueBackend for SqliteBackend {
    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |_| Ok(()))).await
    }

    async fn get_all(&self, collection: &str, names: &[String]) -> Result<HashMap<String, AttrValue>> {
        let collection = collection.to_string();
        let names = names.to_vec();
        let now = now_millis();
        self.with_conn(move |conn| {
            purge_if_expired(conn, &collection, now)?;
            let mut stmt = conn.prepare_cached(
                "SELECT value FROM entries WHERE collection = ?1 AND name = ?2",
            )?;
            let mut out = HashMap::new();
            for name in names {
                let value: Option<String> = stmt
                    .query_row(params![collection, name], |row| row.get(0))
                    .optional()?;
                if let Some(text) = value {
                    out.insert(name, decode_value(&text));
                }
            }
            Ok(out)
        })
        .await
    }

    async fn read_all(&self, collection: &str) -> Result<HashMap<String, AttrValue>> {
        let collection = collection.to_string();
        let now = now_millis();
        self.with_conn(move |conn| {
            purge_if_expired(conn, &collection, now)?;
            let mut stmt =
                conn.prepare_cached("SELECT name, value FROM entries WHERE collection = ?1")?;
            let rows = stmt.query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = HashMap::new();
            for row in rows {
                let (name, text) = row?;
                out.insert(name, decode_value(&text));
            }
            Ok(out)
        })
        .await
    }

    async fn put_all(&self, collection: &str, entries: HashMap<String, AttrValue>) -> Result<()> {
        let collection = collection.to_string();
        let now = now_millis();
        self.with_conn(move |conn| {
            purge_if_expired(conn, &collection, now)?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO entries (collection, name, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(collection, name) DO UPDATE SET value = excluded.value",
                )?;
                for (name, value) in &entries {
                    stmt.execute(params![collection, name, value.to_string()])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn remove(&self, collection: &str, names: &[String]) -> Result<()> {
        let collection = collection.to_string();
        let names = names.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt =
                    tx.prepare_cached("DELETE FROM entries WHERE collection = ?1 AND name = ?2")?;
                for name in &names {
                    stmt.execute(params![collection, name])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn clear(&self, collection: &str) -> Result<()> {
        let collection = collection.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM entries WHERE collection = ?1", params![collection])?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, collection: &str) -> Result<bool> {
        let collection = collection.to_string();
        let now = now_millis();
        self.with_conn(move |conn| {
            purge_if_expired(conn, &collection, now)?;
            let tx = conn.transaction()?;
            let n = tx.execute("DELETE FROM entries WHERE collection = ?1", params![collection])?;
            tx.execute("DELETE FROM collection_ttl WHERE collection = ?1", params![collection])?;
            tx.commit()?;
            Ok(n > 0)
        })
        .await
    }

    async fn expire(&self, collection: &str, ttl: Option<Duration>) -> Result<()> {
        let collection = collection.to_string();
        let expires_at = ttl
            .and_then(|ttl| i64::try_from(ttl.as_millis()).ok())
            .and_then(|ms| now_millis().checked_add(ms));
        self.with_conn(move |conn| {
            match expires_at {
                Some(at) => conn.execute(
                    "INSERT INTO collection_ttl (collection, expires_at) VALUES (?1, ?2)
                     ON CONFLICT(collection) DO UPDATE SET expires_at = excluded.expires_at",
                    params![collection, at],
                )?,
                None => conn.execute(
                    "DELETE FROM collection_ttl WHERE collection = ?1",
                    params![collection],
                )?,
            };
            Ok(())
        })
        .await
    }

    async fn collections(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_"));
        let now = now_millis();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT e.collection FROM entries e
                 LEFT JOIN collection_ttl t ON t.collection = e.collection
                 WHERE e.collection LIKE ?1 ESCAPE '\\'
                   AND (t.expires_at IS NULL OR t.expires_at > ?2)
                 ORDER BY e.collection",
            )?;
            let names = stmt
                .query_map(params![pattern, now], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entries(pairs: &[(&str, AttrValue)]) -> HashMap<String, AttrValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn roundtrip_entries() {
        let db = SqliteBackend::open_memory().unwrap();
        db.put_all("c", entries(&[("a", json!(1)), ("b", json!({"x": [true, null]}))]))
            .await
            .unwrap();
        db.put_all("c", entries(&[("a", json!(2))])).await.unwrap();

        let all = db.read_all("c").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"], json!(2));
        assert_eq!(all["b"]["x"][0], json!(true));

        let some = db.get_all("c", &["b".into(), "zzz".into()]).await.unwrap();
        assert_eq!(some.len(), 1);
    }

    #[tokio::test]
    async fn remove_clear_delete() {
        let db = SqliteBackend::open_memory().unwrap();
        db.put_all("c", entries(&[("a", json!(1)), ("b", json!(2)), ("z", json!(3))]))
            .await
            .unwrap();
        db.remove("c", &["a".into()]).await.unwrap();
        assert_eq!(db.read_all("c").await.unwrap().len(), 2);
        db.clear("c").await.unwrap();
        assert!(db.read_all("c").await.unwrap().is_empty());
        assert!(!db.delete("c").await.unwrap());
    }

    #[tokio::test]
    async fn expiry_is_enforced_on_read_and_purge() {
        let db = SqliteBackend::open_memory().unwrap();
        db.put_all("gone", entries(&[("a", json!(1))])).await.unwrap();
        db.put_all("kept", entries(&[("a", json!(1))])).await.unwrap();
        db.expire("gone", Some(Duration::from_millis(1))).await.unwrap();
        db.expire("kept", Some(Duration::from_secs(60))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(db.collections("").await.unwrap(), vec!["kept"]);
        assert_eq!(db.purge_expired().await.unwrap(), 1);
        assert!(db.read_all("gone").await.unwrap().is_empty());
        assert_eq!(db.read_all("kept").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unrepresentable_ttl_means_no_expiry() {
        let db = SqliteBackend::open_memory().unwrap();
        db.put_all("c", entries(&[("a", json!(1))])).await.unwrap();
        db.expire("c", Some(Duration::from_secs(1))).await.unwrap();
        db.expire("c", Some(Duration::from_secs(i64::MAX as u64))).await.unwrap();
        db.expire("c", Some(Duration::MAX)).await.unwrap();
        assert_eq!(db.purge_expired().await.unwrap(), 0);
        assert_eq!(db.collections("").await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn prefix_listing_escapes_wildcards() {
        let db = SqliteBackend::open_memory().unwrap();
        for name in ["a_b:1", "axb:2"] {
            db.put_all(name, entries(&[("k", json!(0))])).await.unwrap();
        }
        assert_eq!(db.collections("a_b").await.unwrap(), vec!["a_b:1"]);
    }

    #[tokio::test]
    async fn file_store_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let a = SqliteBackend::open(&path).unwrap();
        let b = SqliteBackend::open(&path).unwrap();
        a.put_all("c", entries(&[("k", json!("v"))])).await.unwrap();
        assert_eq!(b.read_all("c").await.unwrap()["k"], json!("v"));
    }
}
