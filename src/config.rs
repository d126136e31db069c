// src/config.rs

//! Manages server configuration: loading, resolving dynamic values, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// TLS certificate/key configuration. Both fields are required when `enabled`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

/// Ambient Prometheus metrics endpoint, independent of the spec's excluded
/// "Prometheus query adapter" (see SPEC_FULL.md §1.5).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    8878
}

/// Full configuration surface from spec §6's "Configuration" table.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default = "default_client_qps")]
    pub client_qps: f32,
    #[serde(default = "default_client_burst")]
    pub client_burst: u32,

    #[serde(default = "default_open_browser")]
    pub open_browser: bool,

    #[serde(default = "default_coalescer_interval_ms", with = "humantime_serde::option")]
    pub coalescer_interval: Option<std::time::Duration>,
    #[serde(default = "default_coalescer_max_keys")]
    pub coalescer_max_keys: usize,

    #[serde(default = "default_informer_idle_close_s")]
    pub informer_idle_close_s: u64,
    #[serde(default = "default_informer_sync_deadline_s")]
    pub informer_sync_deadline_s: u64,

    #[serde(default = "default_sse_buffer_frames")]
    pub sse_buffer_frames: usize,
    #[serde(default = "default_sse_slow_client_threshold")]
    pub sse_slow_client_threshold: u32,
    #[serde(default = "default_sse_heartbeat_s")]
    pub sse_heartbeat_s: u64,

    #[serde(default = "default_cloudshell_cleanup_interval_h")]
    pub cloudshell_cleanup_interval_h: u64,
    #[serde(default = "default_cloudshell_max_age_h")]
    pub cloudshell_max_age_h: u64,

    #[serde(default = "default_trace_ring_size")]
    pub trace_ring_size: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Directory for on-disk credential payloads, `$HOME/<app-dir>` per
    /// spec §6's "Persisted state". Defaults to `~/.clustermux`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            tls: TlsConfig::default(),
            client_qps: default_client_qps(),
            client_burst: default_client_burst(),
            open_browser: default_open_browser(),
            coalescer_interval: default_coalescer_interval_ms(),
            coalescer_max_keys: default_coalescer_max_keys(),
            informer_idle_close_s: default_informer_idle_close_s(),
            informer_sync_deadline_s: default_informer_sync_deadline_s(),
            sse_buffer_frames: default_sse_buffer_frames(),
            sse_slow_client_threshold: default_sse_slow_client_threshold(),
            sse_heartbeat_s: default_sse_heartbeat_s(),
            cloudshell_cleanup_interval_h: default_cloudshell_cleanup_interval_h(),
            cloudshell_max_age_h: default_cloudshell_max_age_h(),
            trace_ring_size: default_trace_ring_size(),
            log_level: default_log_level(),
            metrics: MetricsConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1:7080".to_string()
}
fn default_client_qps() -> f32 {
    100.0
}
fn default_client_burst() -> u32 {
    200
}
fn default_open_browser() -> bool {
    true
}
fn default_coalescer_interval_ms() -> Option<std::time::Duration> {
    Some(std::time::Duration::from_millis(1000))
}
fn default_coalescer_max_keys() -> usize {
    1000
}
fn default_informer_idle_close_s() -> u64 {
    60
}
/// Deadline a late subscriber blocks on before SYNCED, per spec's "block
/// until SYNCED or a deadline (default 15 s)".
fn default_informer_sync_deadline_s() -> u64 {
    15
}
fn default_sse_buffer_frames() -> usize {
    32
}
fn default_sse_slow_client_threshold() -> u32 {
    5
}
fn default_sse_heartbeat_s() -> u64 {
    30
}
fn default_cloudshell_cleanup_interval_h() -> u64 {
    1
}
fn default_cloudshell_max_age_h() -> u64 {
    24
}
fn default_trace_ring_size() -> usize {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    dirs_home().map(|h| format!("{h}/.clustermux")).unwrap_or_else(|| ".clustermux".to_string())
}

fn dirs_home() -> Option<String> {
    std::env::var("HOME").ok()
}

/// Intermediate deserialization target; kept separate from `Config` so that
/// dynamic resolution (data_dir) happens after parsing, matching the
/// teacher's `RawConfig` -> `Config` two-stage load.
#[derive(Deserialize, Debug, Clone, Default)]
struct RawConfig {
    #[serde(flatten)]
    inner: PartialConfig,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct PartialConfig {
    listen_address: Option<String>,
    tls: Option<TlsConfig>,
    client_qps: Option<f32>,
    client_burst: Option<u32>,
    open_browser: Option<bool>,
    #[serde(default, with = "humantime_serde::option")]
    coalescer_interval: Option<std::time::Duration>,
    coalescer_max_keys: Option<usize>,
    informer_idle_close_s: Option<u64>,
    informer_sync_deadline_s: Option<u64>,
    sse_buffer_frames: Option<usize>,
    sse_slow_client_threshold: Option<u32>,
    sse_heartbeat_s: Option<u64>,
    cloudshell_cleanup_interval_h: Option<u64>,
    cloudshell_max_age_h: Option<u64>,
    trace_ring_size: Option<usize>,
    log_level: Option<String>,
    metrics: Option<MetricsConfig>,
    data_dir: Option<String>,
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file at '{path}'"))?;
        let defaults = Config::default();
        let p = raw.inner;
        let config = Config {
            listen_address: p.listen_address.unwrap_or(defaults.listen_address),
            tls: p.tls.unwrap_or(defaults.tls),
            client_qps: p.client_qps.unwrap_or(defaults.client_qps),
            client_burst: p.client_burst.unwrap_or(defaults.client_burst),
            open_browser: p.open_browser.unwrap_or(defaults.open_browser),
            coalescer_interval: p.coalescer_interval.or(defaults.coalescer_interval),
            coalescer_max_keys: p.coalescer_max_keys.unwrap_or(defaults.coalescer_max_keys),
            informer_idle_close_s: p.informer_idle_close_s.unwrap_or(defaults.informer_idle_close_s),
            informer_sync_deadline_s: p
                .informer_sync_deadline_s
                .unwrap_or(defaults.informer_sync_deadline_s),
            sse_buffer_frames: p.sse_buffer_frames.unwrap_or(defaults.sse_buffer_frames),
            sse_slow_client_threshold: p
                .sse_slow_client_threshold
                .unwrap_or(defaults.sse_slow_client_threshold),
            sse_heartbeat_s: p.sse_heartbeat_s.unwrap_or(defaults.sse_heartbeat_s),
            cloudshell_cleanup_interval_h: p
                .cloudshell_cleanup_interval_h
                .unwrap_or(defaults.cloudshell_cleanup_interval_h),
            cloudshell_max_age_h: p.cloudshell_max_age_h.unwrap_or(defaults.cloudshell_max_age_h),
            trace_ring_size: p.trace_ring_size.unwrap_or(defaults.trace_ring_size),
            log_level: p.log_level.unwrap_or(defaults.log_level),
            metrics: p.metrics.unwrap_or(defaults.metrics),
            data_dir: p.data_dir.unwrap_or(defaults.data_dir),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow!(
                "listen_address '{}' is not a valid host:port",
                self.listen_address
            ));
        }
        if self.tls.enabled && (self.tls.cert_file.is_none() || self.tls.key_file.is_none()) {
            return Err(anyhow!("tls.enabled requires both cert_file and key_file"));
        }
        if self.coalescer_max_keys == 0 {
            return Err(anyhow!("coalescer_max_keys must be > 0"));
        }
        if self.sse_buffer_frames == 0 {
            return Err(anyhow!("sse_buffer_frames must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn from_file_applies_overrides() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "listen_address = \"0.0.0.0:9090\"\ncoalescer_max_keys = 50").unwrap();
        let cfg = Config::from_file(f.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.listen_address, "0.0.0.0:9090");
        assert_eq!(cfg.coalescer_max_keys, 50);
        assert_eq!(cfg.sse_buffer_frames, default_sse_buffer_frames());
    }

    #[test]
    fn tls_without_paths_is_invalid() {
        let mut cfg = Config::default();
        cfg.tls.enabled = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_listen_address_is_invalid() {
        let mut cfg = Config::default();
        cfg.listen_address = "not-an-address".to_string();
        assert!(cfg.validate().is_err());
    }
}
