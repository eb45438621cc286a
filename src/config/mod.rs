//! Daemon configuration.
//!
//! Loaded from `config.toml` in the data directory, with CLI flags / env
//! vars (`PLAND_*`) taking precedence. Every section has working defaults
//! so a bare `pland serve` runs without any file present.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

const DEFAULT_PORT: u16 = 4400;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs_fallback().join("pland")
}

/// `$XDG_DATA_HOME`-ish fallback without pulling in a dirs crate: honour the
/// env var, else `~/.local/share`, else the current directory.
fn dirs_fallback() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share");
    }
    PathBuf::from(".")
}

// ─── DispatcherConfig ────────────────────────────────────────────────────────

/// Worker pool tuning (`[dispatcher]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Concurrency ceiling: maximum simultaneous handler executions.
    pub concurrency: usize,
    /// Interval between pending-queue polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Hard per-task execution deadline, in seconds. Enforced by the
    /// dispatcher, not cooperatively by handlers.
    pub task_timeout_secs: u64,
    /// Pending records older than this are failed by the reaper without
    /// ever being claimed.
    pub max_queue_age_secs: u64,
    /// Interval between reaper passes, in seconds.
    pub reaper_interval_secs: u64,
    /// How long graceful shutdown waits for in-flight executions.
    pub shutdown_grace_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 500,
            task_timeout_secs: 120,
            max_queue_age_secs: 180,
            reaper_interval_secs: 30,
            shutdown_grace_secs: 30,
        }
    }
}

// ─── InferenceConfig ─────────────────────────────────────────────────────────

/// Inference endpoint settings (`[inference]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Base URL of an OpenAI-compatible API, without the trailing path.
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key. The key itself
    /// never lives in the config file.
    pub api_key_env: String,
    /// Hard timeout for one inference HTTP call, in seconds.
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434/v1".to_string(),
            model: "llama3".to_string(),
            api_key_env: "PLAND_INFERENCE_API_KEY".to_string(),
            timeout_secs: 90,
        }
    }
}

// ─── StreamConfig ────────────────────────────────────────────────────────────

/// Event stream forwarding settings (`[stream]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Gateway receive-poll interval in milliseconds. Bounds how quickly a
    /// forwarding loop notices it should exit without busy-spinning.
    pub forward_poll_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { forward_poll_ms: 50 }
    }
}

// ─── DaemonConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub port: u16,
    pub bind_address: String,
    pub data_dir: PathBuf,
    /// Log filter (`trace` … `error`, or a full `EnvFilter` directive).
    pub log: String,
    pub dispatcher: DispatcherConfig,
    pub inference: InferenceConfig,
    pub stream: StreamConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: default_bind_address(),
            data_dir: default_data_dir(),
            log: "info".to_string(),
            dispatcher: DispatcherConfig::default(),
            inference: InferenceConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load config.toml from `data_dir` (if present) and apply CLI overrides.
    /// A malformed file is logged and ignored rather than aborting startup.
    pub fn load(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
    ) -> Self {
        let dir = data_dir.clone().unwrap_or_else(default_data_dir);
        let mut config = Self::read_file(&dir.join("config.toml"));

        config.data_dir = dir;
        if let Some(p) = port {
            config.port = p;
        }
        if let Some(l) = log {
            config.log = l;
        }
        if let Some(b) = bind_address {
            config.bind_address = b;
        }
        config
    }

    fn read_file(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), err = %e, "config.toml is invalid — using defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.dispatcher.concurrency > 0);
        assert!(config.dispatcher.task_timeout_secs > 0);
        assert!(config.stream.forward_poll_ms > 0);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: DaemonConfig = toml::from_str(
            "port = 9000\n\n[dispatcher]\nconcurrency = 2\n",
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.dispatcher.concurrency, 2);
        // Untouched sections keep their defaults.
        assert_eq!(config.dispatcher.poll_interval_ms, 500);
        assert_eq!(config.inference.timeout_secs, 90);
    }

    #[test]
    fn overrides_beat_file_defaults() {
        let config = DaemonConfig::load(Some(5000), None, Some("debug".into()), None);
        assert_eq!(config.port, 5000);
        assert_eq!(config.log, "debug");
    }
}
