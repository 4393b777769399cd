//! Deterministic synthetic video source.
//!
//! Generates NV12 test-pattern frames without touching any decoder hardware.
//! Integration tests drive the full pipeline with it, and the per-connection
//! frame limits make reconnect behaviour reproducible: each entry in the
//! schedule bounds how many frames the corresponding connection yields
//! before failing, with `None` meaning unbounded.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use tracing::debug;

use crate::{Nv12Frame, SourceError, SourceFactory, SourceOptions, VideoSource, nv12_buffer_len};

/// Builder-style factory for [`SyntheticSource`] connections.
pub struct SyntheticFactory {
    width: u32,
    height: u32,
    /// Optional pacing between frames; `None` decodes as fast as possible.
    frame_interval: Option<Duration>,
    /// Per-connection frame budgets, consumed front to back. Connections
    /// beyond the schedule are unbounded.
    connection_limits: Mutex<VecDeque<Option<u64>>>,
    /// The next N `open` calls fail before one succeeds.
    open_failures: AtomicU32,
    opens: AtomicU64,
}

impl SyntheticFactory {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_interval: None,
            connection_limits: Mutex::new(VecDeque::new()),
            open_failures: AtomicU32::new(0),
            opens: AtomicU64::new(0),
        }
    }

    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Schedule frame budgets for successive connections.
    pub fn with_connection_limits(self, limits: impl IntoIterator<Item = Option<u64>>) -> Self {
        self.connection_limits.lock().unwrap().extend(limits);
        self
    }

    /// Make the next `n` open attempts fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.open_failures.store(n, Ordering::SeqCst);
    }

    /// How many times `open` has been called (successfully or not).
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl SourceFactory for SyntheticFactory {
    fn open(&self, url: &str, _opts: &SourceOptions) -> Result<Box<dyn VideoSource>, SourceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let pending = self.open_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.open_failures.store(pending - 1, Ordering::SeqCst);
            return Err(SourceError::Open {
                url: url.to_string(),
                reason: "synthetic open failure".to_string(),
            });
        }

        let limit = self
            .connection_limits
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(None);
        debug!("opened synthetic source {url} (frame budget {limit:?})");

        Ok(Box::new(SyntheticSource {
            width: self.width,
            height: self.height,
            frame_interval: self.frame_interval,
            remaining: limit,
            frame_index: 0,
            open: true,
        }))
    }
}

/// One synthetic connection. Frames carry a luma gradient plus a square that
/// marches one pixel per frame, so consecutive frames differ.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_interval: Option<Duration>,
    remaining: Option<u64>,
    frame_index: u64,
    open: bool,
}

impl SyntheticSource {
    fn advance(&mut self) -> Result<(), SourceError> {
        if !self.open {
            return Err(SourceError::Decode("source is closed".to_string()));
        }
        if let Some(remaining) = self.remaining {
            if remaining == 0 {
                return Err(SourceError::EndOfStream);
            }
            self.remaining = Some(remaining - 1);
        }
        if let Some(interval) = self.frame_interval {
            thread::sleep(interval);
        }
        self.frame_index += 1;
        Ok(())
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![128u8; nv12_buffer_len(self.width, self.height)];

        for y in 0..h {
            for x in 0..w {
                data[y * w + x] = ((x * 255) / w.max(1)) as u8;
            }
        }

        // Marching 8x8 bright square.
        let sq = 8.min(w).min(h);
        let off_x = (self.frame_index as usize) % w.saturating_sub(sq).max(1);
        for y in 0..sq {
            for x in 0..sq {
                data[y * w + off_x + x] = 255;
            }
        }
        data
    }
}

impl VideoSource for SyntheticSource {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn fps(&self) -> f64 {
        match self.frame_interval {
            Some(interval) if !interval.is_zero() => 1.0 / interval.as_secs_f64(),
            _ => 0.0,
        }
    }

    fn codec_name(&self) -> &str {
        "synthetic"
    }

    fn is_hardware(&self) -> bool {
        false
    }

    fn decode_frame(&mut self) -> Result<Nv12Frame, SourceError> {
        self.advance()?;
        Ok(Nv12Frame {
            width: self.width,
            height: self.height,
            pts: self.frame_index as i64 * 40,
            timestamp_ms: Utc::now().timestamp_millis(),
            data: std::sync::Arc::new(self.render()),
        })
    }

    fn skip_frame(&mut self) -> Result<(), SourceError> {
        self.advance()
    }

    fn close(&mut self) {
        self.open = false;
    }
}
