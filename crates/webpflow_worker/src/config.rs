//! Worker configuration loaded from environment variables.

use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use webpflow_protocol::defaults;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub dispatcher_host: String,
    pub dispatcher_tcp_port: u16,
    pub dispatcher_udp_port: u16,
    /// Inbound job payloads land here.
    pub jobs_dir: PathBuf,
    /// Per-job output directories and result bundles.
    pub output_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: defaults::WORKER_TCP_PORT,
            dispatcher_host: "127.0.0.1".to_string(),
            dispatcher_tcp_port: defaults::DISPATCHER_TCP_PORT,
            dispatcher_udp_port: defaults::DISPATCHER_UDP_PORT,
            jobs_dir: PathBuf::from("jobs-input"),
            output_dir: PathBuf::from("jobs-output"),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables, falling back to
    /// the defaults.
    pub fn load() -> Self {
        let base = Self::default();
        Self {
            host: env_string("WEBPFLOW_WORKER_HOST", base.host),
            port: env_parse("WEBPFLOW_WORKER_PORT", base.port),
            dispatcher_host: env_string("WEBPFLOW_DISPATCHER_HOST", base.dispatcher_host),
            dispatcher_tcp_port: env_parse(
                "WEBPFLOW_DISPATCHER_TCP_PORT",
                base.dispatcher_tcp_port,
            ),
            dispatcher_udp_port: env_parse(
                "WEBPFLOW_DISPATCHER_UDP_PORT",
                base.dispatcher_udp_port,
            ),
            jobs_dir: env_path("WEBPFLOW_JOBS_DIR", base.jobs_dir),
            output_dir: env_path("WEBPFLOW_OUTPUT_DIR", base.output_dir),
        }
    }

    /// Recreate the working directories for a fresh run.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.jobs_dir, &self.output_dir] {
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
