//! Per-stream supervisor: owns the decode loop and its lifecycle.
//!
//! The loop opens the source, decodes (or skip-decodes) frames, fans each
//! accepted frame out as one `InferTask` per configured model, and feeds the
//! rolling image cache. Source failures put the stream into `Reconnecting`
//! with exponential backoff (1 → 2 → 4 → 8 s, reset on a successful open);
//! a stop request is observed within one 100 ms polling quantum, including
//! inside backoff sleeps.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use infer_core::{FrameResultCollector, InferTask, InferenceEngine, ResultAggregator};
use tracing::{debug, info, warn};
use video_ingest::{
    Nv12Frame, PixelConvert, SourceFactory, SourceOptions, VideoSource, calc_proportional_height,
};

use crate::{
    cache::ImageCache,
    jpeg, telemetry,
    types::{CachedFrame, StreamConfig, StreamState, StreamStatus},
};

const STOP_POLL: Duration = Duration::from_millis(100);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Preview-cache encode parameters shared by every stream.
#[derive(Clone, Copy, Debug)]
pub struct CacheSettings {
    /// Cached frame width; 0 keeps the source width.
    pub resize_width: u32,
    pub jpeg_quality: u8,
}

/// Collaborators a supervisor needs; one context serves all streams.
#[derive(Clone)]
pub struct SupervisorContext {
    pub engine: Arc<InferenceEngine>,
    pub cache: Option<Arc<ImageCache>>,
    pub source_factory: Arc<dyn SourceFactory>,
    pub converter: Arc<dyn PixelConvert>,
    pub cache_settings: CacheSettings,
}

/// Atomically readable stream state, shared between the decode thread and
/// status queries.
struct StreamShared {
    state: AtomicU8,
    stop: AtomicBool,
    running: AtomicBool,
    decoded_frames: AtomicU64,
    inferred_frames: AtomicU64,
    reconnect_count: AtomicU32,
    last_error: Mutex<String>,
    started_at: Mutex<Instant>,
}

impl StreamShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(StreamState::Stopped as u8),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            decoded_frames: AtomicU64::new(0),
            inferred_frames: AtomicU64::new(0),
            reconnect_count: AtomicU32::new(0),
            last_error: Mutex::new(String::new()),
            started_at: Mutex::new(Instant::now()),
        }
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_error(&self, message: &str) {
        *self.last_error.lock().unwrap() = message.to_string();
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

pub struct StreamSupervisor {
    config: StreamConfig,
    labels: HashMap<String, Arc<Vec<String>>>,
    shared: Arc<StreamShared>,
    ctx: SupervisorContext,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamSupervisor {
    pub fn new(
        config: StreamConfig,
        labels: HashMap<String, Arc<Vec<String>>>,
        ctx: SupervisorContext,
    ) -> Self {
        Self {
            config,
            labels,
            shared: Arc::new(StreamShared::new()),
            ctx,
            handle: None,
        }
    }

    /// Launch the decode loop. Returns `false` when the loop is already
    /// running. Restarting resets all statistics.
    pub fn start(&mut self) -> bool {
        if self.shared.running.load(Ordering::SeqCst) {
            return false;
        }
        // A previous loop has fully exited (running is false); reap its
        // thread before spawning the next one.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        self.shared.decoded_frames.store(0, Ordering::SeqCst);
        self.shared.inferred_frames.store(0, Ordering::SeqCst);
        self.shared.reconnect_count.store(0, Ordering::SeqCst);
        self.shared.set_error("");
        *self.shared.started_at.lock().unwrap() = Instant::now();
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_state(StreamState::Starting);

        let config = self.config.clone();
        let labels = self.labels.clone();
        let shared = self.shared.clone();
        let ctx = self.ctx.clone();
        let handle = telemetry::spawn_thread(format!("stream-{}", config.cam_id), move || {
            decode_loop(&config, &labels, &shared, &ctx);
        })
        .expect("failed to spawn stream supervisor thread");
        self.handle = Some(handle);
        true
    }

    /// Flag the loop to stop. Returns immediately; pair with
    /// [`take_handle`](Self::take_handle) to wait for exit.
    pub fn signal_stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    /// Hand out the decode thread handle so callers can join outside any
    /// lock they hold.
    pub fn take_handle(&mut self) -> Option<thread::JoinHandle<()>> {
        self.handle.take()
    }

    /// Stop and wait for the loop to exit.
    pub fn join_stopped(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Bump the inferred-frames counter; called per published frame result.
    pub fn note_inferred(&self) {
        self.shared.inferred_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status(&self) -> StreamStatus {
        let decoded = self.shared.decoded_frames.load(Ordering::Relaxed);
        let inferred = self.shared.inferred_frames.load(Ordering::Relaxed);
        let uptime = self.shared.started_at.lock().unwrap().elapsed().as_secs_f64();
        let (decode_fps, infer_fps) = if uptime > 0.0 {
            (decoded as f64 / uptime, inferred as f64 / uptime)
        } else {
            (0.0, 0.0)
        };

        StreamStatus {
            cam_id: self.config.cam_id.clone(),
            source_url: self.config.source_url.clone(),
            status: self.shared.state().as_str().to_string(),
            frame_skip: self.config.frame_skip,
            models: self.config.models.clone(),
            decoded_frames: decoded,
            inferred_frames: inferred,
            // Queue-level drops are an engine-global statistic.
            dropped_frames: 0,
            decode_fps,
            infer_fps,
            reconnect_count: self.shared.reconnect_count.load(Ordering::Relaxed),
            last_error: self.shared.last_error.lock().unwrap().clone(),
            uptime_seconds: uptime,
        }
    }
}

/// Sleep in stop-poll quanta. Returns `false` when a stop request cut the
/// sleep short.
fn sleep_with_stop(shared: &StreamShared, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if shared.stop_requested() {
            return false;
        }
        thread::sleep(STOP_POLL.min(deadline - Instant::now()));
    }
    !shared.stop_requested()
}

fn decode_loop(
    config: &StreamConfig,
    labels: &HashMap<String, Arc<Vec<String>>>,
    shared: &Arc<StreamShared>,
    ctx: &SupervisorContext,
) {
    let cam_id = config.cam_id.as_str();
    info!("[{cam_id}] decode loop started");

    let opts = SourceOptions::default();
    let frame_skip = config.effective_frame_skip();
    let mut local_frame_count: u64 = 0;
    let mut backoff = INITIAL_BACKOFF;

    while !shared.stop_requested() {
        shared.set_state(StreamState::Starting);
        info!("[{cam_id}] opening source: {}", config.source_url);
        let mut source = match ctx.source_factory.open(&config.source_url, &opts) {
            Ok(source) => source,
            Err(err) => {
                shared.set_error(&err.to_string());
                shared.set_state(StreamState::Reconnecting);
                shared.reconnect_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[{cam_id}] open failed ({err}), retrying in {}s",
                    backoff.as_secs()
                );
                if !sleep_with_stop(shared, backoff) {
                    break;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        backoff = INITIAL_BACKOFF;
        shared.set_state(StreamState::Running);
        shared.set_error("");
        info!(
            "[{cam_id}] source opened: {}x{} @ {:.1}fps codec={} hw={}",
            source.width(),
            source.height(),
            source.fps(),
            source.codec_name(),
            source.is_hardware()
        );
        let orig_w = source.width();
        let orig_h = source.height();

        while !shared.stop_requested() {
            local_frame_count += 1;
            let need_process = frame_skip <= 1 || local_frame_count % frame_skip == 0;

            // Skipped frames advance the decoder without materialising a
            // CPU buffer.
            if !need_process {
                if let Err(err) = source.skip_frame() {
                    note_decode_failure(shared, cam_id, &err.to_string(), backoff);
                    break;
                }
                shared.decoded_frames.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let frame = match source.decode_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    note_decode_failure(shared, cam_id, &err.to_string(), backoff);
                    break;
                }
            };
            let frame_id = shared.decoded_frames.fetch_add(1, Ordering::Relaxed) + 1;

            if !config.models.is_empty() {
                submit_frame(config, labels, ctx, &frame, frame_id, orig_w, orig_h);
            }
            if let Some(cache) = &ctx.cache {
                cache_frame(cam_id, ctx, cache, &frame, frame_id, orig_w, orig_h);
            }
        }
        source.close();

        if !shared.stop_requested() {
            if !sleep_with_stop(shared, backoff) {
                break;
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    shared.set_state(StreamState::Stopped);
    shared.running.store(false, Ordering::SeqCst);
    info!(
        "[{cam_id}] decode loop stopped (decoded {} frame(s))",
        shared.decoded_frames.load(Ordering::Relaxed)
    );
}

fn note_decode_failure(shared: &StreamShared, cam_id: &str, error: &str, backoff: Duration) {
    shared.set_error(error);
    shared.set_state(StreamState::Reconnecting);
    shared.reconnect_count.fetch_add(1, Ordering::Relaxed);
    warn!(
        "[{cam_id}] decode failed ({error}), reconnecting in {}s",
        backoff.as_secs()
    );
}

/// Resize the frame for each model and submit one task apiece. Frames for
/// multi-model streams share a collector; a resize failure drops only that
/// model's task.
fn submit_frame(
    config: &StreamConfig,
    labels: &HashMap<String, Arc<Vec<String>>>,
    ctx: &SupervisorContext,
    frame: &Nv12Frame,
    frame_id: u64,
    orig_w: u32,
    orig_h: u32,
) {
    let cam_id = config.cam_id.as_str();
    let num_models = config.models.len();

    let mut base = InferTask {
        cam_id: config.cam_id.clone(),
        source_url: config.source_url.clone(),
        frame_id,
        pts: frame.pts,
        timestamp_ms: frame.timestamp_ms,
        original_width: orig_w,
        original_height: orig_h,
        model_path: String::new(),
        task_name: String::new(),
        kind: Default::default(),
        conf_threshold: 0.0,
        nms_threshold: 0.0,
        labels: Arc::new(Vec::new()),
        input: Arc::new(Vec::new()),
        input_width: 0,
        input_height: 0,
        aggregator: None,
    };

    let collector: Option<Arc<dyn ResultAggregator>> = if num_models > 1 {
        Some(Arc::new(FrameResultCollector::new(
            num_models,
            base.base_result(),
        )))
    } else {
        None
    };

    for model in &config.models {
        let rgb = match ctx.converter.nv12_to_rgb_resize(
            &frame.data,
            orig_w,
            orig_h,
            model.input_width,
            model.input_height,
        ) {
            Ok(rgb) => rgb,
            Err(err) => {
                warn!("[{cam_id}] resize failed for model {}: {err}", model.task_name);
                continue;
            }
        };

        base.model_path = model.model_path.clone();
        base.task_name = model.task_name.clone();
        base.kind = model.kind;
        base.conf_threshold = model.conf_threshold;
        base.nms_threshold = model.nms_threshold;
        base.labels = labels
            .get(&model.model_path)
            .cloned()
            .unwrap_or_else(|| Arc::new(Vec::new()));
        base.input = Arc::new(rgb);
        base.input_width = model.input_width;
        base.input_height = model.input_height;
        base.aggregator = collector.clone();

        if !ctx.engine.submit(base.clone()) {
            warn!("[{cam_id}] engine rejected task for frame {frame_id}");
        }
    }

    metrics::gauge!("infer_queue_depth").set(ctx.engine.queue_len() as f64);
}

/// Resize for the preview cache, JPEG-encode, and insert.
fn cache_frame(
    cam_id: &str,
    ctx: &SupervisorContext,
    cache: &ImageCache,
    frame: &Nv12Frame,
    frame_id: u64,
    orig_w: u32,
    orig_h: u32,
) {
    let settings = ctx.cache_settings;
    let cache_w = if settings.resize_width > 0 {
        settings.resize_width.next_multiple_of(2)
    } else {
        orig_w.next_multiple_of(2)
    };
    let cache_h = calc_proportional_height(orig_w, orig_h, cache_w);
    if cache_h == 0 {
        return;
    }

    let rgb = match ctx
        .converter
        .nv12_to_rgb_resize(&frame.data, orig_w, orig_h, cache_w, cache_h)
    {
        Ok(rgb) => rgb,
        Err(err) => {
            warn!("[{cam_id}] cache resize failed: {err}");
            return;
        }
    };

    match jpeg::encode_rgb(&rgb, cache_w, cache_h, settings.jpeg_quality) {
        Ok(encoded) => {
            cache.add_frame(CachedFrame {
                cam_id: cam_id.to_string(),
                frame_id,
                timestamp_ms: frame.timestamp_ms,
                width: cache_w,
                height: cache_h,
                jpeg: Arc::new(encoded),
            });
        }
        Err(err) => {
            debug!("[{cam_id}] cache JPEG encode failed: {err:#}");
        }
    }
}
