//! Dispatcher configuration loaded from environment variables.

use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use webpflow_protocol::defaults;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub tcp_host: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub upload_dir: PathBuf,
    pub extract_dir: PathBuf,
    pub results_dir: PathBuf,
    pub heartbeat_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tcp_host: "127.0.0.1".to_string(),
            tcp_port: defaults::DISPATCHER_TCP_PORT,
            udp_port: defaults::DISPATCHER_UDP_PORT,
            upload_dir: PathBuf::from("uploads"),
            extract_dir: PathBuf::from("extracted"),
            results_dir: PathBuf::from("results"),
            heartbeat_timeout: defaults::HEARTBEAT_TIMEOUT,
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from environment variables, falling back to
    /// the defaults.
    pub fn load() -> Self {
        let base = Self::default();
        Self {
            tcp_host: env_string("WEBPFLOW_TCP_HOST", base.tcp_host),
            tcp_port: env_parse("WEBPFLOW_TCP_PORT", base.tcp_port),
            udp_port: env_parse("WEBPFLOW_UDP_PORT", base.udp_port),
            upload_dir: env_path("WEBPFLOW_UPLOAD_DIR", base.upload_dir),
            extract_dir: env_path("WEBPFLOW_EXTRACT_DIR", base.extract_dir),
            results_dir: env_path("WEBPFLOW_RESULTS_DIR", base.results_dir),
            heartbeat_timeout: Duration::from_secs_f64(env_parse(
                "WEBPFLOW_HEARTBEAT_TIMEOUT",
                base.heartbeat_timeout.as_secs_f64(),
            )),
        }
    }

    /// Recreate the working directories for a fresh run.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.upload_dir, &self.extract_dir, &self.results_dir] {
            if dir.exists() {
                fs::remove_dir_all(dir)
                    .with_context(|| format!("failed to clear {}", dir.display()))?;
            }
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

fn env_string(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
