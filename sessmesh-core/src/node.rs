//! A running node: manager, bus subscription and expiry sweeper.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::bus::{ChangeBus, Subscription};
use crate::config::{ManagerConfig, ReadMode};
use crate::error::{Error, Result};
use crate::ids::NodeId;
use crate::manager::ReplicaManager;
use crate::store::KeyValueBackend;

pub struct SessionNode {
    manager: Arc<ReplicaManager>,
    subscription: Option<Subscription>,
    sweeper: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SessionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionNode").finish_non_exhaustive()
    }
}

impl SessionNode {
    /// Start a node with a freshly generated identity.
    pub async fn start(
        config: ManagerConfig,
        backend: Arc<dyn KeyValueBackend>,
        bus: Arc<dyn ChangeBus>,
    ) -> Result<Self> {
        Self::start_with_id(config, NodeId::generate(), backend, bus).await
    }

    /// Check the store, subscribe to the scope topic and start sweeping.
    /// Any failure aborts startup and leaves nothing running.
    pub async fn start_with_id(
        config: ManagerConfig,
        node_id: NodeId,
        backend: Arc<dyn KeyValueBackend>,
        bus: Arc<dyn ChangeBus>,
    ) -> Result<Self> {
        let timeout = config.store_timeout();
        match tokio::time::timeout(timeout, backend.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Lifecycle(format!("store unreachable: {e}"))),
            Err(_) => return Err(Error::Lifecycle(format!("store ping timed out after {timeout:?}"))),
        }

        let sweep_every = config.sweep_interval();
        let topic = config.topic_name();
        let read_mode = config.read_mode;
        let manager = Arc::new(ReplicaManager::new(config, node_id, backend, Arc::clone(&bus)));

        let subscription = match read_mode {
            ReadMode::Memory => Some(
                bus.subscribe(&topic, manager.listener())
                    .map_err(|e| Error::Lifecycle(format!("can't subscribe to {topic}: {e}")))?,
            ),
            ReadMode::Store => None,
        };

        let weak = Arc::downgrade(&manager);
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                let expired = manager.sweep_expired().await;
                if expired > 0 {
                    tracing::debug!(node = %manager.node_id(), expired, "Expiry sweep");
                }
            }
        });

        tracing::info!(
            node = %manager.node_id(),
            topic = %topic,
            update_mode = ?manager.config().update_mode,
            read_mode = ?read_mode,
            "Session node started"
        );
        Ok(Self {
            manager,
            subscription,
            sweeper: Some(sweeper),
        })
    }

    pub fn manager(&self) -> &Arc<ReplicaManager> {
        &self.manager
    }

    pub fn node_id(&self) -> &NodeId {
        self.manager.node_id()
    }

    /// Stop sweeping and leave the topic.
    pub fn shutdown(mut self) {
        self.stop();
        tracing::info!(node = %self.manager.node_id(), "Session node stopped");
    }

    fn stop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }
}

impl Drop for SessionNode {
    fn drop(&mut self) {
        self.stop();
    }
}
