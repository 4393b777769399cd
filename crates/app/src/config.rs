//! Server configuration and stream persistence.
//!
//! The server config is a JSON file loaded once at boot; the stream list is
//! rewritten after every mutation so a restart recreates the active streams.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::StreamConfig;

fn default_http_port() -> u16 {
    8080
}

fn default_publish_bind() -> String {
    "127.0.0.1:5556".to_string()
}

fn default_num_infer_workers() -> usize {
    3
}

fn default_num_npu_cores() -> usize {
    3
}

fn default_streams_save_path() -> PathBuf {
    PathBuf::from("config/streams.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_duration_sec() -> u64 {
    5
}

fn default_cache_jpeg_quality() -> u8 {
    75
}

fn default_cache_resize_width() -> u32 {
    640
}

fn default_cache_max_memory_mb() -> usize {
    64
}

/// Global server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// TCP bind address for the result publisher.
    #[serde(default = "default_publish_bind")]
    pub publish_bind: String,
    #[serde(default = "default_num_infer_workers")]
    pub num_infer_workers: usize,
    #[serde(default = "default_num_npu_cores")]
    pub num_npu_cores: usize,
    /// Inference queue capacity; 0 derives six slots per worker.
    #[serde(default)]
    pub infer_queue_capacity: usize,
    #[serde(default = "default_streams_save_path")]
    pub streams_save_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    /// Rolling window retained per stream, seconds.
    #[serde(default = "default_cache_duration_sec")]
    pub cache_duration_sec: u64,
    #[serde(default = "default_cache_jpeg_quality")]
    pub cache_jpeg_quality: u8,
    /// Cached preview width; 0 keeps the source width.
    #[serde(default = "default_cache_resize_width")]
    pub cache_resize_width: u32,
    /// Global cache memory budget in MiB; 0 means unlimited.
    #[serde(default = "default_cache_max_memory_mb")]
    pub cache_max_memory_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// JSON file wrapper so the persisted stream list stays self-describing.
#[derive(Serialize, Deserialize)]
struct PersistedStreams {
    streams: Vec<StreamConfig>,
}

/// Loads and saves configuration files. All methods are stateless.
pub struct ConfigStore;

impl ConfigStore {
    pub fn load_server_config(path: &Path) -> Result<ServerConfig> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading server config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing server config {}", path.display()))
    }

    pub fn save_server_config(path: &Path, config: &ServerConfig) -> Result<()> {
        Self::ensure_parent_dir(path)?;
        let json = serde_json::to_string_pretty(config)?;
        fs::write(path, json)
            .with_context(|| format!("writing server config {}", path.display()))
    }

    pub fn load_streams(path: &Path) -> Result<Vec<StreamConfig>> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading streams file {}", path.display()))?;
        let persisted: PersistedStreams = serde_json::from_str(&raw)
            .with_context(|| format!("parsing streams file {}", path.display()))?;
        Ok(persisted.streams)
    }

    pub fn save_streams(path: &Path, streams: &[StreamConfig]) -> Result<()> {
        Self::ensure_parent_dir(path)?;
        let persisted = PersistedStreams {
            streams: streams.to_vec(),
        };
        let json = serde_json::to_string_pretty(&persisted)?;
        fs::write(path, json).with_context(|| format!("writing streams file {}", path.display()))
    }

    fn ensure_parent_dir(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {}", parent.display()))?;
            }
        }
        Ok(())
    }
}
