// src/core/state/core.rs

//! Defines the central `ServerState` struct, holding all shared server-wide
//! state, and the `CredentialKubeConfigResolver` that bridges the Credential
//! Store's stored payloads to the Client Factory's `KubeConfigResolver` seam.

use crate::config::Config;
use crate::core::client_factory::ClientFactory;
use crate::core::cloudshell::CloudShellReaper;
use crate::core::coalescer::Coalescer;
use crate::core::credentials::{CredentialKind, CredentialStore};
use crate::core::errors::{ClusterMuxError, Result};
use crate::core::informer::InformerRegistry;
use crate::core::portforward::PortForwardRegistry;
use crate::core::sse::SseHub;
use crate::core::trace::TraceRing;
use kube::config::{Kubeconfig, KubeConfigOptions};
use kube::Config as KubeConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Resolves a `(credential_id, cluster_name)` pair to a `kube::Config` by
/// reading the stored credential payload from the Credential Store. Plugged
/// into the Client Factory as a `KubeConfigResolver` (§4.B) so the factory
/// itself never needs to know about credential storage.
pub struct CredentialKubeConfigResolver {
    credentials: Arc<CredentialStore>,
}

impl CredentialKubeConfigResolver {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self { credentials }
    }
}

#[async_trait::async_trait]
impl crate::core::client_factory::KubeConfigResolver for CredentialKubeConfigResolver {
    async fn resolve(&self, credential_id: &str, cluster_name: &str) -> Result<KubeConfig> {
        let credential = self.credentials.get(credential_id)?;
        let cluster = credential
            .clusters
            .iter()
            .find(|c| c.name == cluster_name)
            .ok_or_else(|| ClusterMuxError::NotFound(format!("cluster {cluster_name} in credential {credential_id}")))?;

        match credential.kind {
            CredentialKind::File => {
                let kubeconfig = Kubeconfig::from_yaml(
                    std::str::from_utf8(&credential.payload)
                        .map_err(|e| ClusterMuxError::Invalid(format!("credential payload is not UTF-8: {e}")))?,
                )
                .map_err(|e| ClusterMuxError::Invalid(format!("invalid kubeconfig: {e}")))?;
                let options = KubeConfigOptions {
                    context: Some(cluster_name.to_string()),
                    ..Default::default()
                };
                KubeConfig::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| ClusterMuxError::Invalid(format!("failed to build client config: {e}")))
            }
            CredentialKind::Bearer => {
                let token = String::from_utf8(credential.payload.clone())
                    .map_err(|e| ClusterMuxError::Invalid(format!("bearer token is not UTF-8: {e}")))?;
                let mut config = KubeConfig::new(
                    cluster
                        .api_server_url
                        .parse()
                        .map_err(ClusterMuxError::from)?,
                );
                config.default_namespace = cluster.default_namespace.clone().unwrap_or_else(|| "default".to_string());
                config.auth_info.token = Some(token.into());
                Ok(config)
            }
            CredentialKind::Certificate => {
                // The payload is a client-cert bundle: PEM cert followed by
                // PEM key, concatenated, matching how it is accepted on
                // credential creation.
                let mut config = KubeConfig::new(
                    cluster
                        .api_server_url
                        .parse()
                        .map_err(ClusterMuxError::from)?,
                );
                config.default_namespace = cluster.default_namespace.clone().unwrap_or_else(|| "default".to_string());
                use base64::Engine;
                config.auth_info.client_certificate_data =
                    Some(base64::engine::general_purpose::STANDARD.encode(&credential.payload));
                Ok(config)
            }
        }
    }
}

/// Everything initialized up front, handed to the spawner to start
/// background tasks (coalescer, cloud-shell reaper) and the HTTP server.
pub struct ServerInit {
    pub state: Arc<ServerState>,
}

/// The central struct holding all shared, server-wide state. Wrapped in an
/// `Arc` and passed to every HTTP handler and background task.
pub struct ServerState {
    pub config: Config,
    pub credentials: Arc<CredentialStore>,
    pub clients: Arc<ClientFactory>,
    pub informers: Arc<InformerRegistry>,
    pub coalescer: crate::core::coalescer::CoalescerHandle,
    pub sse: Arc<SseHub>,
    pub portforward: Arc<PortForwardRegistry>,
    pub cloudshell: Arc<CloudShellReaper>,
    pub traces: Arc<TraceRing>,
    /// Handle to the logging filter, allowing dynamic log level changes.
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    /// Root cancellation token; cancelling it cascades shutdown through
    /// every informer, subscription, and session (spec §5).
    pub root_cancel: CancellationToken,
}

impl ServerState {
    /// Initializes the entire server state from the given configuration.
    pub fn initialize(
        config: Config,
        log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    ) -> Result<ServerInit> {
        let root_cancel = CancellationToken::new();

        let credentials = Arc::new(CredentialStore::open(&config.data_dir));
        let resolver = Arc::new(CredentialKubeConfigResolver::new(credentials.clone()));
        let clients = Arc::new(ClientFactory::new(config.client_qps, config.client_burst, resolver));

        let coalescer = Coalescer::spawn(
            config.coalescer_interval.unwrap_or(Duration::from_millis(1000)),
            config.coalescer_max_keys,
            root_cancel.child_token(),
        );

        let informers = InformerRegistry::new(
            clients.clone(),
            coalescer.clone(),
            root_cancel.child_token(),
            Duration::from_secs(config.informer_idle_close_s),
            Duration::from_secs(config.informer_sync_deadline_s),
        );

        let sse = SseHub::new(
            coalescer.clone(),
            informers.clone(),
            config.sse_buffer_frames,
            config.sse_slow_client_threshold,
            Duration::from_secs(config.sse_heartbeat_s),
        );

        let portforward = PortForwardRegistry::new();
        let cloudshell = CloudShellReaper::new(credentials.clone(), clients.clone(), config.cloudshell_max_age_h);
        let traces = Arc::new(TraceRing::new(config.trace_ring_size));

        // Cascading deletion: removing a credential evicts its clients and
        // closes every informer rooted at it immediately, bypassing the
        // idle-close grace period (spec §4.C/§5).
        let clients_for_hook = clients.clone();
        let informers_for_hook = informers.clone();
        credentials.on_delete(Box::new(move |credential_id| {
            info!(credential = %credential_id, "credential deleted, evicting clients and informers");
            clients_for_hook.evict(credential_id);
            informers_for_hook.close_all_for_credential(credential_id);
        }));

        let state = Arc::new(ServerState {
            config,
            credentials,
            clients,
            informers,
            coalescer,
            sse,
            portforward,
            cloudshell,
            traces,
            log_reload_handle,
            root_cancel,
        });

        Ok(ServerInit { state })
    }
}
