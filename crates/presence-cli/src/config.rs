use std::path::{Path, PathBuf};
use std::time::Duration;

use presence_core::LivenessConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime configuration.
///
/// Layered: built-in defaults, then the TOML file named by
/// `PRESENCE_CONFIG` (if set), then `PRESENCE_*` environment variables.
/// Command-line flags are applied on top by `main`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Seconds a liveness challenge stays answerable.
    pub liveness_timeout_secs: u64,
    /// EAR below which the eye counts as closed.
    pub ear_close: f32,
    /// EAR above which a closed eye counts as reopened.
    pub ear_open: f32,
    /// Yaw magnitude a turn challenge must exceed.
    pub yaw_threshold: f32,
    /// Blinks needed to pass a blink challenge.
    pub required_blinks: u32,
    /// Minimum spacing between accepted enrollment samples.
    pub enroll_interval_ms: u64,
    /// Minimum time between two attendance marks from one capture loop.
    pub mark_cooldown_ms: u64,
    /// Embedding length produced by the deployed recognition model.
    pub embedding_dim: usize,
}

impl Default for Config {
    fn default() -> Self {
        let liveness = LivenessConfig::default();
        Self {
            db_path: default_data_dir().join("attendance.db"),
            similarity_threshold: 0.50,
            liveness_timeout_secs: liveness.timeout.as_secs(),
            ear_close: liveness.ear_close,
            ear_open: liveness.ear_open,
            yaw_threshold: liveness.yaw_threshold,
            required_blinks: liveness.required_blinks,
            enroll_interval_ms: 150,
            mark_cooldown_ms: 3_000,
            embedding_dim: 512,
        }
    }
}

impl Config {
    /// Load configuration from the optional TOML file and `PRESENCE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("PRESENCE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        self.similarity_threshold =
            env_f32("PRESENCE_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.liveness_timeout_secs =
            env_u64("PRESENCE_LIVENESS_TIMEOUT_SECS", self.liveness_timeout_secs);
        self.ear_close = env_f32("PRESENCE_EAR_CLOSE", self.ear_close);
        self.ear_open = env_f32("PRESENCE_EAR_OPEN", self.ear_open);
        self.yaw_threshold = env_f32("PRESENCE_YAW_THRESHOLD", self.yaw_threshold);
        self.required_blinks = env_u32("PRESENCE_REQUIRED_BLINKS", self.required_blinks);
        self.enroll_interval_ms = env_u64("PRESENCE_ENROLL_INTERVAL_MS", self.enroll_interval_ms);
        self.mark_cooldown_ms = env_u64("PRESENCE_MARK_COOLDOWN_MS", self.mark_cooldown_ms);
        self.embedding_dim = env_usize("PRESENCE_EMBEDDING_DIM", self.embedding_dim);
    }

    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            timeout: Duration::from_secs(self.liveness_timeout_secs),
            ear_close: self.ear_close,
            ear_open: self.ear_open,
            yaw_threshold: self.yaw_threshold,
            required_blinks: self.required_blinks,
        }
    }

    pub fn enroll_interval(&self) -> Duration {
        Duration::from_millis(self.enroll_interval_ms)
    }

    pub fn mark_cooldown(&self) -> Duration {
        Duration::from_millis(self.mark_cooldown_ms)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
