use crate::error::{ConfigError, LensError};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Enable the inspector. Off by default so instrumented hosts opt in.
    #[serde(default)]
    pub enabled: bool,

    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Gateway port (default: 7800)
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub performance: PerformanceConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub debug: DebugConfig,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    7800
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
            storage: StorageConfig::default(),
            performance: PerformanceConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults when absent.
    ///
    /// The `TRACELENS_TRACES_DIR` environment variable overrides
    /// `storage.traces_dir` regardless of the file's contents.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))
                .map_err(|e| LensError::Config(ConfigError::Load(e.to_string())))?;
            toml::from_str(&raw)
                .map_err(|e| LensError::Config(ConfigError::Load(e.to_string())))?
        } else {
            Self::default()
        };

        if let Ok(dir) = std::env::var("TRACELENS_TRACES_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                config.storage.traces_dir = dir.to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.storage.max_trace_size == 0 {
            return Err(LensError::Config(ConfigError::Validation(
                "storage.max_trace_size must be non-zero".into(),
            )));
        }
        if !(0.0..=1.0).contains(&self.performance.sample_rate) {
            return Err(LensError::Config(ConfigError::Validation(format!(
                "performance.sample_rate must be within 0.0..=1.0, got {}",
                self.performance.sample_rate
            ))));
        }
        if self.performance.sse_buffer_size == 0 {
            return Err(LensError::Config(ConfigError::Validation(
                "performance.sse_buffer_size must be non-zero".into(),
            )));
        }
        Ok(())
    }

    /// Trace directory with `~` expanded to an absolute path.
    pub fn traces_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage.traces_dir).into_owned())
    }
}

// ── Storage ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one trace log per session.
    #[serde(default = "default_traces_dir")]
    pub traces_dir: String,

    /// Rotation threshold in bytes for a single trace file (default: 100 MB).
    #[serde(default = "default_max_trace_size")]
    pub max_trace_size: u64,

    /// Days to retain trace files. Retention is operator policy; the core
    /// records the value but never deletes files itself.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Trace file path pattern; `{unique_id}` is substituted at first write.
    #[serde(default = "default_path_pattern")]
    pub path_pattern: String,

    /// Source of `{unique_id}`: "session_id" or "timestamp".
    #[serde(default = "default_unique_id")]
    pub unique_id: UniqueIdSource,

    /// strftime format used when `unique_id = "timestamp"`.
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UniqueIdSource {
    #[default]
    SessionId,
    Timestamp,
}

fn default_traces_dir() -> String {
    directories::UserDirs::new().map_or_else(
        || "~/.tracelens/traces".into(),
        |dirs| {
            dirs.home_dir()
                .join(".tracelens")
                .join("traces")
                .to_string_lossy()
                .into_owned()
        },
    )
}

fn default_max_trace_size() -> u64 {
    100 * 1024 * 1024
}

fn default_retention_days() -> u32 {
    7
}

fn default_path_pattern() -> String {
    "{unique_id}.jsonl.gz".into()
}

fn default_unique_id() -> UniqueIdSource {
    UniqueIdSource::SessionId
}

fn default_timestamp_format() -> String {
    "%Y%m%d-%H%M%S".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            traces_dir: default_traces_dir(),
            max_trace_size: default_max_trace_size(),
            retention_days: default_retention_days(),
            path_pattern: default_path_pattern(),
            unique_id: default_unique_id(),
            timestamp_format: default_timestamp_format(),
        }
    }
}

// ── Performance ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Span sampling rate, 0.0–1.0.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Maximum concurrent SSE subscribers.
    #[serde(default = "default_max_sse_clients")]
    pub max_sse_clients: usize,

    /// Per-subscriber event buffer; a full buffer drops events for that
    /// subscriber only.
    #[serde(default = "default_sse_buffer_size")]
    pub sse_buffer_size: usize,
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_max_sse_clients() -> usize {
    100
}

fn default_sse_buffer_size() -> usize {
    1000
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            max_sse_clients: default_max_sse_clients(),
            sse_buffer_size: default_sse_buffer_size(),
        }
    }
}

// ── Heartbeat ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between per-session heartbeat events.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    2
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

// ── Debug ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DebugConfig {
    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,

    /// Include verbose span payloads in logs.
    #[serde(default)]
    pub verbose_spans: bool,
}
