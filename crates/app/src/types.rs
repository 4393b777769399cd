//! Server-side data types: stream configuration, runtime status snapshots,
//! cached preview frames, and the REST response envelope.

use std::sync::Arc;

use infer_core::ModelConfig;
use serde::{Deserialize, Serialize};

fn default_frame_skip() -> u32 {
    5
}

/// User-supplied configuration for one camera stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Globally unique stream identifier.
    pub cam_id: String,
    pub source_url: String,
    /// Run inference on every Nth decoded frame.
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u32,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl StreamConfig {
    /// Frame skip clamped to its lower bound of 1.
    pub fn effective_frame_skip(&self) -> u64 {
        self.frame_skip.max(1) as u64
    }
}

/// Supervisor lifecycle state, stored as an atomic u8.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Reconnecting = 3,
    Error = 4,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Stopped => "stopped",
            StreamState::Starting => "starting",
            StreamState::Running => "running",
            StreamState::Reconnecting => "reconnecting",
            StreamState::Error => "error",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamState::Starting,
            2 => StreamState::Running,
            3 => StreamState::Reconnecting,
            4 => StreamState::Error,
            _ => StreamState::Stopped,
        }
    }
}

/// Read-only stream snapshot served by the status endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct StreamStatus {
    pub cam_id: String,
    pub source_url: String,
    pub status: String,
    pub frame_skip: u32,
    pub models: Vec<ModelConfig>,

    pub decoded_frames: u64,
    pub inferred_frames: u64,
    pub dropped_frames: u64,
    pub decode_fps: f64,
    pub infer_fps: f64,
    pub reconnect_count: u32,
    pub last_error: String,
    pub uptime_seconds: f64,
}

/// One JPEG preview frame held by the rolling cache.
#[derive(Clone)]
pub struct CachedFrame {
    pub cam_id: String,
    pub frame_id: u64,
    pub timestamp_ms: i64,
    pub width: u32,
    pub height: u32,
    pub jpeg: Arc<Vec<u8>>,
}

impl CachedFrame {
    pub fn jpeg_size(&self) -> usize {
        self.jpeg.len()
    }
}

/// Envelope for JSON responses: `code` 0 on success, otherwise mirroring the
/// HTTP status.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub code: i32,
    pub message: String,
    pub data: serde_json::Value,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code: 0,
            message: message.into(),
            data,
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: serde_json::Value::Object(Default::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_config_defaults_apply() {
        let cfg: StreamConfig = serde_json::from_str(
            r#"{"cam_id": "cam-1", "source_url": "rtsp://example/stream"}"#,
        )
        .unwrap();
        assert_eq!(cfg.frame_skip, 5);
        assert!(cfg.models.is_empty());
        assert_eq!(cfg.effective_frame_skip(), 5);
    }

    #[test]
    fn frame_skip_zero_behaves_as_one() {
        let cfg = StreamConfig {
            cam_id: "c".into(),
            source_url: "u".into(),
            frame_skip: 0,
            models: Vec::new(),
        };
        assert_eq!(cfg.effective_frame_skip(), 1);
    }

    #[test]
    fn stream_state_round_trips_through_u8() {
        for state in [
            StreamState::Stopped,
            StreamState::Starting,
            StreamState::Running,
            StreamState::Reconnecting,
            StreamState::Error,
        ] {
            assert_eq!(StreamState::from_u8(state as u8), state);
        }
        assert_eq!(StreamState::from_u8(200), StreamState::Stopped);
    }
}
