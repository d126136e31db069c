// src/core/informer/registry.rs

//! The Informer Registry (spec §4.C): `subscribe`/`unsubscribe`/`snapshot`/
//! `get` over a `DashMap<InformerKey, Arc<Informer>>`, one live informer per
//! key (testable property #1). Per-key task spawning mirrors the teacher's
//! `core/warden/mod.rs` (one monitor task per configured master, tracked in a
//! map) generalized to a dynamically discovered key space.

use super::informer::{Informer, InformerState};
use super::key::InformerKey;
use crate::core::client_factory::ClientFactory;
use crate::core::coalescer::CoalescerHandle;
use crate::core::errors::{ClusterMuxError, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct InformerRegistry {
    map: DashMap<InformerKey, Arc<Informer>>,
    epochs: DashMap<InformerKey, Arc<AtomicU64>>,
    client_factory: Arc<ClientFactory>,
    coalescer: CoalescerHandle,
    root_cancel: CancellationToken,
    idle_close: Duration,
    sync_deadline: Duration,
}

/// RAII handle returned by `subscribe`; dropping it calls `unsubscribe`,
/// the same guard-on-drop shape as `connection::guard::ConnectionGuard`.
pub struct SubscriptionHandle {
    key: InformerKey,
    informer: Arc<Informer>,
    registry: Arc<InformerRegistry>,
}

impl SubscriptionHandle {
    pub fn informer(&self) -> &Arc<Informer> {
        &self.informer
    }

    pub fn key(&self) -> &InformerKey {
        &self.key
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.key);
    }
}

impl InformerRegistry {
    pub fn new(
        client_factory: Arc<ClientFactory>,
        coalescer: CoalescerHandle,
        root_cancel: CancellationToken,
        idle_close: Duration,
        sync_deadline: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            map: DashMap::new(),
            epochs: DashMap::new(),
            client_factory,
            coalescer,
            root_cancel,
            idle_close,
            sync_deadline,
        })
    }

    /// Subscribes to `key`, spawning the informer on first access
    /// (single-flighted by `DashMap::entry`). Blocks until SYNCED or
    /// `sync_deadline` unless the informer is already SYNCED.
    pub async fn subscribe(self: &Arc<Self>, key: InformerKey) -> Result<SubscriptionHandle> {
        let cluster = self
            .client_factory
            .client_for(&key.credential_id, &key.cluster_name)
            .await?;

        let informer = self
            .map
            .entry(key.clone())
            .or_insert_with(|| {
                info!(key = %key, "spawning informer");
                Informer::spawn(key.clone(), cluster, self.coalescer.clone(), &self.root_cancel)
            })
            .clone();

        informer.ref_count.fetch_add(1, Ordering::SeqCst);
        self.bump_epoch(&key);

        if informer.state() != InformerState::Synced {
            informer.wait_synced(self.sync_deadline).await?;
        }

        Ok(SubscriptionHandle {
            key,
            informer,
            registry: self.clone(),
        })
    }

    fn bump_epoch(&self, key: &InformerKey) {
        self.epochs
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::SeqCst);
    }

    fn unsubscribe(self: &Arc<Self>, key: &InformerKey) {
        let Some(informer) = self.map.get(key).map(|e| e.clone()) else {
            return;
        };
        let prev = informer.ref_count.fetch_sub(1, Ordering::SeqCst);
        if prev != 1 {
            return;
        }
        // ref_count just hit zero: arm the idle-close timer.
        let epoch_counter = self
            .epochs
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        let observed_epoch = epoch_counter.load(Ordering::SeqCst);
        let registry = self.clone();
        let key = key.clone();
        let idle_close = self.idle_close;
        tokio::spawn(async move {
            tokio::time::sleep(idle_close).await;
            if epoch_counter.load(Ordering::SeqCst) != observed_epoch {
                debug!(key = %key, "idle-close cancelled by new subscriber");
                return;
            }
            let Some(informer) = registry.map.get(&key).map(|e| e.clone()) else {
                return;
            };
            if informer.ref_count.load(Ordering::SeqCst) != 0 {
                return;
            }
            informer.cancel.cancel();
            registry.map.remove(&key);
            info!(key = %key, "informer idle-closed");
        });
    }

    pub fn snapshot(&self, key: &InformerKey) -> Result<Vec<super::cache::ClusterObject>> {
        let informer = self
            .map
            .get(key)
            .ok_or_else(|| ClusterMuxError::NotFound(format!("no informer for {key}")))?;
        Ok(informer.cache.snapshot())
    }

    pub fn get(
        &self,
        key: &InformerKey,
        namespace: &str,
        name: &str,
    ) -> Result<super::cache::ClusterObject> {
        let informer = self
            .map
            .get(key)
            .ok_or_else(|| ClusterMuxError::NotFound(format!("no informer for {key}")))?;
        informer
            .cache
            .get(namespace, name)
            .ok_or_else(|| ClusterMuxError::NotFound(format!("{namespace}/{name}")))
    }

    /// Cascades credential deletion: closes every informer rooted at
    /// `credential_id` immediately, bypassing the idle-close grace period
    /// (spec §4.C: "Closed ... when its credential is deleted").
    pub fn close_all_for_credential(&self, credential_id: &str) {
        let keys: Vec<InformerKey> = self
            .map
            .iter()
            .filter(|e| e.key().credential_id == credential_id)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, informer)) = self.map.remove(&key) {
                informer.cancel.cancel();
            }
        }
    }

    pub fn live_informer_count(&self) -> usize {
        self.map.len()
    }

    pub fn state_of(&self, key: &InformerKey) -> Option<InformerState> {
        self.map.get(key).map(|e| e.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client_factory::KubeConfigResolver;
    use crate::core::coalescer::Coalescer;

    struct FailingResolver;
    #[async_trait::async_trait]
    impl KubeConfigResolver for FailingResolver {
        async fn resolve(&self, _c: &str, _n: &str) -> Result<kube::Config> {
            Err(ClusterMuxError::Unavailable("no cluster in unit test".into()))
        }
    }

    #[tokio::test]
    async fn subscribe_propagates_client_factory_errors() {
        let factory = Arc::new(ClientFactory::new(10.0, 20, Arc::new(FailingResolver)));
        let coalescer = Coalescer::spawn(Duration::from_millis(50), 100, CancellationToken::new());
        let registry = InformerRegistry::new(
            factory,
            coalescer,
            CancellationToken::new(),
            Duration::from_secs(1),
            Duration::from_millis(100),
        );
        let key = InformerKey::new("c1", "cluster-a", "", "v1", "pods");
        let result = registry.subscribe(key).await;
        assert!(result.is_err());
        assert_eq!(registry.live_informer_count(), 0);
    }
}
