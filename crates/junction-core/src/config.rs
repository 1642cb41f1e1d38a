//! Configuration system for junction.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $JUNCTION_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/junction/config.toml
//!   3. ~/.config/junction/config.toml
//!
//! Individual values are overridden with `JUNCTION_<SECTION>__<KEY>`, for
//! example `JUNCTION_STREAMING__MAX_FRAGMENT_SIZE=16384`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JunctionConfig {
    pub compartment: CompartmentConfig,
    pub workers: WorkerConfig,
    pub streaming: StreamingConfig,
    pub compression: CompressionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompartmentConfig {
    /// Longest the reactor sleeps waiting for work.
    pub dispatch_period_ms: u64,
    /// Events drained per reactor cycle.
    pub task_batch_size: usize,
    /// Interval between timer processor runs.
    pub timer_period_ms: u64,
    /// Estimated queue bytes at which upstream flow is locked.
    pub min_lock_queue_capacity: usize,
    /// Estimated queue bytes below which locked flow is released.
    pub max_unlock_queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker threads. 0 = available parallelism.
    pub threads: usize,
    /// Long tasks admitted at once (running or waiting). Beyond this,
    /// `execute` is rejected.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub max_fragment_size: usize,
    /// How often stalled streams are checked against the cleanup manager.
    pub cleanup_period_ms: u64,
    /// Largest sub-stream count accepted from a peer.
    pub max_sub_streams: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// zstd level, 1..=22.
    pub level: i32,
    /// Messages with a smaller estimated size are sent uncompressed.
    pub min_size: usize,
    /// Largest decompressed frame accepted from a peer.
    pub max_decompressed_size: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CompartmentConfig {
    fn default() -> Self {
        Self {
            dispatch_period_ms: 100,
            task_batch_size: 1000,
            timer_period_ms: 100,
            min_lock_queue_capacity: 10 * 1024 * 1024,
            max_unlock_queue_capacity: 5 * 1024 * 1024,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            queue_capacity: 1024,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: 64 * 1024,
            cleanup_period_ms: 1000,
            max_sub_streams: 1024,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: 3,
            min_size: 0,
            max_decompressed_size: 64 * 1024 * 1024,
        }
    }
}

impl CompartmentConfig {
    pub fn dispatch_period(&self) -> Duration {
        Duration::from_millis(self.dispatch_period_ms)
    }

    pub fn timer_period(&self) -> Duration {
        Duration::from_millis(self.timer_period_ms)
    }
}

impl WorkerConfig {
    /// Thread count with 0 resolved to the machine's parallelism.
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

impl StreamingConfig {
    pub fn cleanup_period(&self) -> Duration {
        Duration::from_millis(self.cleanup_period_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("junction")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl JunctionConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse `path`, or use defaults when it does not exist.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("JUNCTION_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing(path: &Path) -> Result<PathBuf, ConfigError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
            }
            let text = toml::to_string_pretty(&JunctionConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(path, text)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        Ok(path.to_path_buf())
    }

    /// Apply JUNCTION_* overrides. `lookup` is `std::env::var` in production.
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn set<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) {
            if let Some(v) = lookup(key) {
                match v.parse() {
                    Ok(parsed) => *slot = parsed,
                    Err(_) => tracing::warn!(key, value = %v, "ignoring unparseable override"),
                }
            }
        }

        let c = &mut self.compartment;
        set(&lookup, "JUNCTION_COMPARTMENT__DISPATCH_PERIOD_MS", &mut c.dispatch_period_ms);
        set(&lookup, "JUNCTION_COMPARTMENT__TASK_BATCH_SIZE", &mut c.task_batch_size);
        set(&lookup, "JUNCTION_COMPARTMENT__TIMER_PERIOD_MS", &mut c.timer_period_ms);
        set(&lookup, "JUNCTION_COMPARTMENT__MIN_LOCK_QUEUE_CAPACITY", &mut c.min_lock_queue_capacity);
        set(&lookup, "JUNCTION_COMPARTMENT__MAX_UNLOCK_QUEUE_CAPACITY", &mut c.max_unlock_queue_capacity);
        set(&lookup, "JUNCTION_WORKERS__THREADS", &mut self.workers.threads);
        set(&lookup, "JUNCTION_WORKERS__QUEUE_CAPACITY", &mut self.workers.queue_capacity);
        set(&lookup, "JUNCTION_STREAMING__MAX_FRAGMENT_SIZE", &mut self.streaming.max_fragment_size);
        set(&lookup, "JUNCTION_STREAMING__CLEANUP_PERIOD_MS", &mut self.streaming.cleanup_period_ms);
        set(&lookup, "JUNCTION_STREAMING__MAX_SUB_STREAMS", &mut self.streaming.max_sub_streams);
        set(&lookup, "JUNCTION_COMPRESSION__LEVEL", &mut self.compression.level);
        set(&lookup, "JUNCTION_COMPRESSION__MIN_SIZE", &mut self.compression.min_size);
        set(
            &lookup,
            "JUNCTION_COMPRESSION__MAX_DECOMPRESSED_SIZE",
            &mut self.compression.max_decompressed_size,
        );
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compartment.task_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "compartment.task_batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.compartment.max_unlock_queue_capacity > self.compartment.min_lock_queue_capacity {
            return Err(ConfigError::Invalid {
                field: "compartment.max_unlock_queue_capacity",
                reason: format!(
                    "{} exceeds min_lock_queue_capacity {}",
                    self.compartment.max_unlock_queue_capacity,
                    self.compartment.min_lock_queue_capacity
                ),
            });
        }
        if self.streaming.max_fragment_size == 0 {
            return Err(ConfigError::Invalid {
                field: "streaming.max_fragment_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.streaming.max_sub_streams == 0 {
            return Err(ConfigError::Invalid {
                field: "streaming.max_sub_streams",
                reason: "must be at least 1".into(),
            });
        }
        if self.compression.max_decompressed_size == 0 {
            return Err(ConfigError::Invalid {
                field: "compression.max_decompressed_size",
                reason: "must be at least 1".into(),
            });
        }
        if !(1..=22).contains(&self.compression.level) {
            return Err(ConfigError::Invalid {
                field: "compression.level",
                reason: format!("{} is outside 1..=22", self.compression.level),
            });
        }
        Ok(())
    }
}
