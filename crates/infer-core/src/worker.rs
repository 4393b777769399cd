//! Accelerator worker: long-lived consumer of the shared task queue.
//!
//! Each worker is pinned to one core mask and owns one context per model it
//! has seen. Contexts are created lazily on first use, but the engine
//! pre-creates them during `load_models` so steady-state traffic never races
//! context creation against resize work on the same hardware.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use tracing::{debug, error, info};

use crate::{
    postprocess,
    queue::BoundedQueue,
    registry::ModelRegistry,
    runtime::{CoreMask, InferContext, TensorData},
    types::{FrameResult, InferTask, ModelResult},
};

/// Invoked with every completed `FrameResult`.
pub type ResultSink = Arc<dyn Fn(FrameResult) + Send + Sync>;

/// Blocked pops re-check the stop flag at this cadence.
const POP_TIMEOUT: Duration = Duration::from_millis(500);

struct Shared {
    worker_id: usize,
    core_mask: CoreMask,
    registry: Arc<ModelRegistry>,
    contexts: Mutex<HashMap<String, Box<dyn InferContext>>>,
    processed: AtomicU64,
}

pub struct InferWorker {
    shared: Arc<Shared>,
    queue: Arc<BoundedQueue<InferTask>>,
    sink: ResultSink,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl InferWorker {
    pub fn new(
        worker_id: usize,
        core_mask: CoreMask,
        registry: Arc<ModelRegistry>,
        queue: Arc<BoundedQueue<InferTask>>,
        sink: ResultSink,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                worker_id,
                core_mask,
                registry,
                contexts: Mutex::new(HashMap::new()),
                processed: AtomicU64::new(0),
            }),
            queue,
            sink,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Spawn the consumer loop. Idempotent while already running.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let queue = self.queue.clone();
        let sink = self.sink.clone();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name(format!("infer-worker-{}", shared.worker_id))
            .spawn(move || {
                debug!("worker #{} loop started", shared.worker_id);
                while !stop.load(Ordering::Relaxed) {
                    let Some(task) = queue.pop(POP_TIMEOUT) else {
                        continue;
                    };
                    if let Err(err) = process_task(&shared, &sink, task) {
                        error!("worker #{}: dropping task: {err:#}", shared.worker_id);
                    }
                    shared.processed.fetch_add(1, Ordering::Relaxed);
                }
                debug!("worker #{} loop exiting", shared.worker_id);
            })
            .expect("failed to spawn inference worker thread");

        self.handle = Some(handle);
        info!(
            "worker #{} started (core mask {:?})",
            self.shared.worker_id, self.shared.core_mask
        );
    }

    /// Signal cooperative shutdown, wait for the loop to exit, and release
    /// every context this worker created.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        let _ = handle.join();
        self.shared.contexts.lock().unwrap().clear();
        info!(
            "worker #{} stopped (processed {} task(s))",
            self.shared.worker_id,
            self.processed_count()
        );
    }

    /// Eagerly create this worker's context for `model_path`, so the first
    /// task for that model does not pay context creation while decode-side
    /// hardware work is in flight.
    pub fn pre_create_context(&self, model_path: &str) -> Result<()> {
        let mut contexts = self.shared.contexts.lock().unwrap();
        if contexts.contains_key(model_path) {
            return Ok(());
        }
        info!(
            "worker #{}: pre-creating context for model: {model_path}",
            self.shared.worker_id
        );
        let ctx = self
            .shared
            .registry
            .create_worker_context(model_path, self.shared.core_mask)
            .with_context(|| format!("pre-creating context for {model_path}"))?;
        contexts.insert(model_path.to_string(), ctx);
        Ok(())
    }

    pub fn worker_id(&self) -> usize {
        self.shared.worker_id
    }

    pub fn core_mask(&self) -> CoreMask {
        self.shared.core_mask
    }

    pub fn processed_count(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }
}

impl Drop for InferWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run one task end to end: context lookup, inference, post-processing,
/// aggregation. Any failure drops the task; there are no retries and no
/// partial results.
fn process_task(shared: &Shared, sink: &ResultSink, task: InferTask) -> Result<()> {
    let start = Instant::now();

    if task.input.is_empty() {
        bail!("empty input for [{}] frame {}", task.cam_id, task.frame_id);
    }

    let descriptor = shared
        .registry
        .get_descriptor(&task.model_path)
        .with_context(|| format!("model metadata missing: {}", task.model_path))?;

    let outputs = {
        let mut contexts = shared.contexts.lock().unwrap();
        let ctx = match contexts.entry(task.model_path.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                info!(
                    "worker #{}: creating context for model: {}",
                    shared.worker_id, task.model_path
                );
                let ctx = shared
                    .registry
                    .create_worker_context(&task.model_path, shared.core_mask)
                    .with_context(|| format!("creating context for {}", task.model_path))?;
                entry.insert(ctx)
            }
        };
        ctx.infer(&task.input)
            .with_context(|| format!("inference failed for task {}", task.task_name))?
    };

    let mut floats = Vec::with_capacity(outputs.len());
    for tensor in outputs {
        floats.push(match tensor {
            TensorData::Float(values) => values,
            TensorData::Quantized {
                data,
                zero_point,
                scale,
            } => postprocess::dequantize(&data, zero_point, scale),
        });
    }

    let detections = postprocess::process(
        task.kind,
        &floats,
        &descriptor.outputs,
        task.input_width,
        task.input_height,
        task.original_width,
        task.original_height,
        task.conf_threshold,
        task.nms_threshold,
        &task.labels,
    );

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    debug!(
        "worker #{}: [{}] frame {} model={} -> {} detection(s) in {:.1}ms",
        shared.worker_id,
        task.cam_id,
        task.frame_id,
        task.task_name,
        detections.len(),
        elapsed_ms
    );

    let model_result = ModelResult {
        task_name: task.task_name.clone(),
        model_path: task.model_path.clone(),
        inference_time_ms: elapsed_ms,
        detections,
    };

    match &task.aggregator {
        Some(aggregator) => {
            // Only the completing add yields a frame; that caller publishes.
            if let Some(frame) = aggregator.add(model_result) {
                (sink)(frame);
            }
        }
        None => {
            let mut frame = task.base_result();
            frame.results.push(model_result);
            (sink)(frame);
        }
    }

    Ok(())
}
