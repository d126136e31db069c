// src/core/informer/informer.rs

//! A single Informer: list-then-watch reflector for one `InformerKey` (spec
//! §4.C). Grounded on kube-rs's own reflector/watcher machinery (see
//! `other_examples/kube-rs reflector mod.rs`) generalized from a
//! compile-time `K: Resource` to a runtime-resolved GVK the way
//! `other_examples/orka`'s `find_api_resource` resolves dynamic kinds.

use super::cache::ObjectCache;
use super::key::InformerKey;
use crate::core::client_factory::ClusterHandle;
use crate::core::coalescer::CoalescerHandle;
use crate::core::errors::ClusterMuxError;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::discovery::{ApiCapabilities, Discovery};
use kube::runtime::watcher::{self, Event};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformerState {
    Initial,
    Syncing,
    Synced,
    Degraded,
    Closed,
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const PERMISSION_DENIED_RECHECK: Duration = Duration::from_secs(60);

pub struct Informer {
    pub key: InformerKey,
    pub cache: ObjectCache,
    state_tx: watch::Sender<InformerState>,
    state_rx: watch::Receiver<InformerState>,
    pub ref_count: AtomicUsize,
    pub cancel: CancellationToken,
    last_error: parking_lot::Mutex<Option<ClusterMuxError>>,
}

impl Informer {
    pub fn state(&self) -> InformerState {
        *self.state_rx.borrow()
    }

    pub fn last_error(&self) -> Option<ClusterMuxError> {
        self.last_error.lock().clone()
    }

    /// Waits until SYNCED or the deadline elapses (spec §4.C: late
    /// subscribers block until SYNCED or a 15s deadline, else `not-ready`).
    /// Returns early with `PermissionDenied` as soon as the informer goes
    /// DEGRADED for that reason, rather than waiting out the full deadline
    /// and reporting a generic timeout (spec §7/§4.E's permission-error
    /// frame depends on this distinction reaching the caller).
    pub async fn wait_synced(&self, deadline: Duration) -> Result<(), ClusterMuxError> {
        if self.state() == InformerState::Synced {
            return Ok(());
        }
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                let state = *rx.borrow();
                match state {
                    InformerState::Synced => return Ok(()),
                    InformerState::Degraded => {
                        if let Some(err @ ClusterMuxError::PermissionDenied { .. }) = self.last_error() {
                            return Err(err);
                        }
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Ok(());
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(ClusterMuxError::Timeout("informer not-ready".into())),
        }
    }

    /// Spawns the list-watch reflector task. Returns the `Informer` handle;
    /// the task runs until `cancel` fires.
    pub fn spawn(
        key: InformerKey,
        cluster: Arc<ClusterHandle>,
        coalescer: CoalescerHandle,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(InformerState::Initial);
        let informer = Arc::new(Self {
            key: key.clone(),
            cache: ObjectCache::new(),
            state_tx,
            state_rx,
            ref_count: AtomicUsize::new(0),
            cancel: parent_cancel.child_token(),
            last_error: parking_lot::Mutex::new(None),
        });

        let task_handle = informer.clone();
        tokio::spawn(async move {
            task_handle.run(cluster, coalescer).await;
        });

        informer
    }

    async fn run(self: Arc<Self>, cluster: Arc<ClusterHandle>, coalescer: CoalescerHandle) {
        let api: Api<DynamicObject> = match resolve_by_plural(&cluster.discovery, &self.key.group, &self.key.version, &self.key.resource_plural) {
            Some((ar, _caps)) => Api::all_with(cluster.client.clone(), &ar),
            None => {
                *self.last_error.lock() = Some(ClusterMuxError::NotFound(format!(
                    "no API resource for {}/{}/{}",
                    self.key.group, self.key.version, self.key.resource_plural
                )));
                let _ = self.state_tx.send(InformerState::Degraded);
                return;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let _ = self.state_tx.send(if attempt == 0 {
                InformerState::Syncing
            } else {
                InformerState::Degraded
            });

            let run_once = self.clone().watch_once(api.clone(), coalescer.clone());
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = run_once => {
                    match result {
                        Ok(()) => {
                            // Stream ended cleanly (server closed it); relist immediately.
                            attempt = 0;
                            continue;
                        }
                        Err(e) if matches!(e, ClusterMuxError::PermissionDenied { .. }) => {
                            warn!(key = %self.key, error = %e, "permission denied, entering long re-check cadence");
                            *self.last_error.lock() = Some(e);
                            let _ = self.state_tx.send(InformerState::Degraded);
                            tokio::select! {
                                _ = tokio::time::sleep(PERMISSION_DENIED_RECHECK) => {},
                                _ = self.cancel.cancelled() => break,
                            }
                            continue;
                        }
                        Err(e) => {
                            *self.last_error.lock() = Some(e);
                            let backoff = Self::backoff_for(attempt);
                            attempt = attempt.saturating_add(1);
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {},
                                _ = self.cancel.cancelled() => break,
                            }
                            continue;
                        }
                    }
                }
            }
        }

        let _ = self.state_tx.send(InformerState::Closed);
        self.cache.clear();
        info!(key = %self.key, "informer closed");
    }

    fn backoff_for(attempt: u32) -> Duration {
        let base = INITIAL_BACKOFF.saturating_mul(1 << attempt.min(16));
        let capped = base.min(MAX_BACKOFF);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }

    /// Runs one list+watch cycle to completion (or error). On success the
    /// stream only ends when the server drops the connection or cancel fires.
    async fn watch_once(
        self: Arc<Self>,
        api: Api<DynamicObject>,
        coalescer: CoalescerHandle,
    ) -> Result<(), ClusterMuxError> {
        let was_degraded = self.state() == InformerState::Degraded;
        let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()));
        let mut synced_this_cycle = false;

        while let Some(event) = stream.next().await {
            let event = event.map_err(ClusterMuxError::from)?;
            match event {
                Event::Init => {
                    self.cache.clear();
                }
                Event::InitApply(obj) => {
                    self.cache.upsert(obj);
                }
                Event::InitDone => {
                    synced_this_cycle = true;
                    let _ = self.state_tx.send(InformerState::Synced);
                    *self.last_error.lock() = None;
                    if was_degraded {
                        debug!(key = %self.key, "relist complete, emitting synthetic full resync");
                    }
                    coalescer.enqueue(self.key.clone());
                }
                Event::Apply(obj) => {
                    self.cache.upsert(obj);
                    coalescer.enqueue(self.key.clone());
                }
                Event::Delete(obj) => {
                    if let Some(uid) = obj.metadata.uid.clone() {
                        self.cache.remove_by_uid(&uid);
                    }
                    coalescer.enqueue(self.key.clone());
                }
            }
            if self.cancel.is_cancelled() {
                return Ok(());
            }
        }

        if !synced_this_cycle {
            return Err(ClusterMuxError::Unavailable(
                "watch stream ended before initial sync".into(),
            ));
        }
        Ok(())
    }
}

/// Resolves a dynamic API resource by `(group, version, plural)` rather
/// than `kube::discovery::Discovery::resolve_gvk`, which matches on the
/// PascalCase `Kind` — `InformerKey` only carries the lowercase plural
/// name used on the wire (spec §6's route segment), so a GVK-based lookup
/// would never match. Grounded on `other_examples/orka`'s
/// `find_api_resource`, which does the equivalent scan keyed on `kind`.
fn resolve_by_plural(discovery: &Discovery, group: &str, version: &str, plural: &str) -> Option<(ApiResource, ApiCapabilities)> {
    discovery.groups().find_map(|g| {
        g.recommended_resources().into_iter().find(|(ar, _)| ar.group == group && ar.version == version && ar.plural == plural)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_and_monotonic_up_to_cap() {
        let b0 = Informer::backoff_for(0);
        let b_high = Informer::backoff_for(20);
        assert!(b0 <= INITIAL_BACKOFF);
        assert!(b_high <= MAX_BACKOFF);
    }

    #[tokio::test]
    async fn wait_synced_returns_immediately_once_synced() {
        let (tx, rx) = watch::channel(InformerState::Synced);
        let informer = Informer {
            key: InformerKey::new("c", "cl", "", "v1", "pods"),
            cache: ObjectCache::new(),
            state_tx: tx,
            state_rx: rx,
            ref_count: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            last_error: parking_lot::Mutex::new(None),
        };
        informer.wait_synced(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_synced_times_out_if_never_synced() {
        let (tx, rx) = watch::channel(InformerState::Initial);
        let informer = Informer {
            key: InformerKey::new("c", "cl", "", "v1", "pods"),
            cache: ObjectCache::new(),
            state_tx: tx,
            state_rx: rx,
            ref_count: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            last_error: parking_lot::Mutex::new(None),
        };
        let res = informer.wait_synced(Duration::from_millis(20)).await;
        assert!(res.is_err());
    }
}
