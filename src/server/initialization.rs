// src/server/initialization.rs

//! Handles server initialization: state construction, TLS setup, listener
//! bind, and router assembly.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::state::ServerState;
use crate::http;
use anyhow::{anyhow, Result};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::{rustls, TlsAcceptor};
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, reload};

/// Initializes all server components before starting the main loop.
pub async fn setup(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    log_startup_info(&config);

    let acceptor = setup_tls(&config).await?;

    let server_init = ServerState::initialize(config.clone(), log_reload_handle)?;
    let state = server_init.state;
    info!("Server state initialized.");

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .map_err(super::BindError)?;
    info!("clustermux listening on {}", config.listen_address);

    let router = http::router(state.clone());

    Ok(ServerContext {
        state,
        router,
        listener,
        background_tasks: JoinSet::new(),
        acceptor,
    })
}

/// Sets up the TLS acceptor if TLS is enabled in the configuration.
async fn setup_tls(config: &Config) -> Result<Option<TlsAcceptor>> {
    if config.tls.enabled {
        let cert_path = config
            .tls
            .cert_file
            .as_deref()
            .ok_or_else(|| anyhow!("tls.enabled is true but tls.cert_file is missing"))?;
        let key_path = config
            .tls
            .key_file
            .as_deref()
            .ok_or_else(|| anyhow!("tls.enabled is true but tls.key_file is missing"))?;
        info!("TLS is enabled. Loading certificate and key.");
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
    } else {
        Ok(None)
    }
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "clustermux starting, data_dir={}, trace_ring_size={}",
        config.data_dir, config.trace_ring_size
    );
    if !config.tls.enabled {
        warn!("TLS is disabled. Do not expose this listener directly to untrusted networks.");
    }
}
