//! Manager configuration.
//!
//! Loaded from a TOML file (every field optional, see [`ManagerConfig::default`])
//! and fixed for the lifetime of a node. Example:
//!
//! ```toml
//! key_prefix = "shop"
//! scope = "checkout"
//! update_mode = "deferred"
//! read_mode = "memory"
//! encoding = "msgpack"
//! session_timeout_secs = 1800
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Namespace token for per-session collections.
pub const SESSION_NAMESPACE: &str = "sessmesh:session:";
/// Namespace token for per-scope change topics.
pub const UPDATES_NAMESPACE: &str = "sessmesh:session_updates:";

/// When attribute mutations reach the store and the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Write through on every mutation.
    #[default]
    Immediate,
    /// Batch mutations and push them once at the end of the unit of work.
    Deferred,
}

/// Where attribute reads are served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Every read goes to the store; nothing is cached, nothing is subscribed.
    Store,
    /// Attributes are cached in-process and kept coherent over the change bus.
    #[default]
    Memory,
}

/// Wire encoding for change messages. All nodes of a scope must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingFormat {
    #[default]
    Json,
    #[serde(alias = "messagepack")]
    Msgpack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Prepended (with a `:` separator) to every collection and topic name.
    pub key_prefix: String,
    /// Logical application name; nodes sharing it share one change topic.
    pub scope: String,
    pub update_mode: UpdateMode,
    pub read_mode: ReadMode,
    pub encoding: EncodingFormat,
    /// Idle timeout applied to new sessions. `<= 0` disables expiry.
    pub session_timeout_secs: i64,
    /// Upper bound on any single store call.
    pub store_timeout_ms: u64,
    /// Period of the background expiry sweep.
    pub sweep_interval_secs: u64,
    /// Per-subscriber queue depth on the change bus.
    pub bus_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            scope: "default".to_string(),
            update_mode: UpdateMode::Immediate,
            read_mode: ReadMode::Memory,
            encoding: EncodingFormat::Json,
            session_timeout_secs: 30 * 60,
            store_timeout_ms: 3_000,
            sweep_interval_secs: 60,
            bus_capacity: 1024,
        }
    }
}

impl ManagerConfig {
    /// Parse a configuration file. Missing fields take their defaults.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Lifecycle(format!("can't read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
            .map_err(|e| Error::Lifecycle(format!("bad config {}: {e}", path.display())))
    }

    pub fn from_toml_str(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    fn separator(&self) -> &'static str {
        if self.key_prefix.is_empty() { "" } else { ":" }
    }

    /// Store collection holding one session's attributes.
    pub fn collection_name(&self, session_id: &str) -> String {
        format!("{}{}{SESSION_NAMESPACE}{session_id}", self.key_prefix, self.separator())
    }

    /// Change topic shared by every node serving this scope.
    pub fn topic_name(&self) -> String {
        format!("{}{}{UPDATES_NAMESPACE}{}", self.key_prefix, self.separator(), self.scope)
    }
}
