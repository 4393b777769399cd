//! Multi-stream video inference server.
//!
//! Wires the `infer-core` pipeline and `video-ingest` sources into a
//! long-running service: per-stream supervisors decode and fan frames out
//! to the accelerator worker pool, results publish over TCP as JSON lines,
//! a rolling JPEG cache keeps recent previews, and an actix-web REST
//! surface controls the whole thing.

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod jpeg;
pub mod publish;
pub mod stream;
pub mod telemetry;
pub mod types;
