// src/core/cloudshell/mod.rs

//! The Cloud-Shell Reaper (spec §4.H): periodically deletes ephemeral
//! browser-shell pods (and their orphaned config payloads) that have
//! outlived `max_age`. The `tokio::select! { interval, manual trigger,
//! shutdown }` task shape is grounded on `core/tasks/eviction.rs`'s scan
//! loop; the manual-trigger side channel mirrors the AOF-fsync-request
//! pattern the teacher uses to let an HTTP handler nudge a background task
//! without waiting on it.

use crate::core::client_factory::ClientFactory;
use crate::core::credentials::CredentialStore;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, ListParams};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CLOUDSHELL_LABEL_SELECTOR: &str = "app=cloudshell";

pub struct CloudShellReaper {
    credentials: Arc<CredentialStore>,
    clients: Arc<ClientFactory>,
    max_age: chrono::Duration,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanReport {
    pub pods_deleted: usize,
    pub configs_deleted: usize,
    pub errors: usize,
}

impl CloudShellReaper {
    pub fn new(credentials: Arc<CredentialStore>, clients: Arc<ClientFactory>, max_age_hours: u64) -> Arc<Self> {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Arc::new(Self {
            credentials,
            clients,
            max_age: chrono::Duration::hours(max_age_hours as i64),
            trigger_tx,
            trigger_rx: parking_lot::Mutex::new(Some(trigger_rx)),
        })
    }

    /// `POST /cloudshell/cleanup` calls this: signals the scan loop and
    /// returns immediately (spec §4.H: "returns immediately, 202 initiated").
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let Some(mut trigger_rx) = self.trigger_rx.lock().take() else {
            warn!("cloudshell reaper already spawned, ignoring duplicate spawn");
            return;
        };
        let reaper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = trigger_rx.recv() => {}
                }
                let report = reaper.scan_all().await;
                info!(
                    pods_deleted = report.pods_deleted,
                    configs_deleted = report.configs_deleted,
                    errors = report.errors,
                    "cloud-shell reaper scan complete"
                );
            }
        });
    }

    pub async fn scan_all(&self) -> ScanReport {
        let mut report = ScanReport::default();
        for summary in self.credentials.list() {
            let Ok(credential) = self.credentials.get(&summary.id) else {
                continue;
            };
            for cluster in &credential.clusters {
                match self.clients.client_for(&credential.id, &cluster.name).await {
                    Ok(handle) => {
                        self.scan_cluster(&handle.client, &mut report).await;
                    }
                    Err(e) => {
                        warn!(credential = %credential.id, cluster = %cluster.name, error = %e, "skipping cluster for cloud-shell scan");
                        report.errors += 1;
                    }
                }
            }
        }
        report
    }

    async fn scan_cluster(&self, client: &kube::Client, report: &mut ScanReport) {
        let pods: Api<Pod> = Api::all(client.clone());
        let lp = ListParams::default().labels(CLOUDSHELL_LABEL_SELECTOR);
        let list = match pods.list(&lp).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to list cloud-shell pods");
                report.errors += 1;
                return;
            }
        };

        let mut live_pod_names = std::collections::HashSet::new();
        for pod in &list.items {
            if let Some(name) = &pod.metadata.name {
                live_pod_names.insert(name.clone());
            }
        }

        for pod in &list.items {
            let Some(name) = &pod.metadata.name else { continue };
            let Some(ns) = &pod.metadata.namespace else { continue };
            let Some(created) = pod.metadata.creation_timestamp.as_ref().map(|t| t.0) else {
                continue;
            };
            if !is_stale(created, self.max_age) {
                continue;
            }
            debug!(pod = %name, namespace = %ns, "reaping stale cloud-shell pod");
            let pods_ns: Api<Pod> = Api::namespaced(client.clone(), ns);
            match pods_ns.delete(name, &DeleteParams::default()).await {
                Ok(_) => {
                    report.pods_deleted += 1;
                    live_pod_names.remove(name);
                }
                Err(e) => {
                    warn!(pod = %name, error = %e, "failed to delete stale cloud-shell pod");
                    report.errors += 1;
                }
            }
        }

        self.reap_orphaned_configs(client, &live_pod_names, report).await;
    }

    /// Second pass: config payloads (ConfigMaps labeled `app=cloudshell`,
    /// annotated with the pod they belong to) whose referenced pod is gone.
    async fn reap_orphaned_configs(
        &self,
        client: &kube::Client,
        live_pod_names: &std::collections::HashSet<String>,
        report: &mut ScanReport,
    ) {
        let cms: Api<ConfigMap> = Api::all(client.clone());
        let lp = ListParams::default().labels(CLOUDSHELL_LABEL_SELECTOR);
        let list = match cms.list(&lp).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to list cloud-shell config payloads");
                report.errors += 1;
                return;
            }
        };
        for cm in &list.items {
            let Some(name) = &cm.metadata.name else { continue };
            let Some(ns) = &cm.metadata.namespace else { continue };
            let owning_pod = cm
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get("clustermux.dev/pod"));
            let orphaned = match owning_pod {
                Some(pod_name) => !live_pod_names.contains(pod_name),
                None => true,
            };
            if !orphaned {
                continue;
            }
            let cms_ns: Api<ConfigMap> = Api::namespaced(client.clone(), ns);
            match cms_ns.delete(name, &DeleteParams::default()).await {
                Ok(_) => report.configs_deleted += 1,
                Err(e) => {
                    warn!(config = %name, error = %e, "failed to delete orphaned cloud-shell config");
                    report.errors += 1;
                }
            }
        }
    }
}

fn is_stale(created: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    Utc::now().signed_duration_since(created) > max_age
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_younger_than_max_age_is_not_stale() {
        let created = Utc::now() - chrono::Duration::hours(1);
        assert!(!is_stale(created, chrono::Duration::hours(24)));
    }

    #[test]
    fn pod_older_than_max_age_is_stale() {
        let created = Utc::now() - chrono::Duration::hours(25);
        assert!(is_stale(created, chrono::Duration::hours(24)));
    }

    #[tokio::test]
    async fn trigger_before_spawn_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let credentials = Arc::new(CredentialStore::open(dir.path().to_str().unwrap()));
        struct NeverResolver;
        #[async_trait::async_trait]
        impl crate::core::client_factory::KubeConfigResolver for NeverResolver {
            async fn resolve(&self, _c: &str, _cl: &str) -> crate::core::errors::Result<kube::Config> {
                Err(crate::core::errors::ClusterMuxError::NotFound("unused".into()))
            }
        }
        let clients = Arc::new(ClientFactory::new(100.0, 200, Arc::new(NeverResolver)));
        let reaper = CloudShellReaper::new(credentials, clients, 24);
        reaper.trigger();
        let report = reaper.scan_all().await;
        assert_eq!(report.pods_deleted, 0);
    }
}
