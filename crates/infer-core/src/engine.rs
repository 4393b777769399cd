//! Inference engine: owns the registry, the bounded task queue, the worker
//! pool, and the result sink.
//!
//! Producers call [`InferenceEngine::submit`]; completed `FrameResult`s flow
//! to the publisher and then to an optional completion callback (the stream
//! manager installs one to keep per-stream counters).

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{
    queue::BoundedQueue,
    registry::ModelRegistry,
    runtime::{AcceleratorRuntime, CoreMask},
    types::{FrameResult, InferTask, ModelConfig},
    worker::{InferWorker, ResultSink},
};

/// Downstream consumer of completed frame results. Implementations must be
/// non-blocking and lossy under backpressure.
pub trait ResultPublisher: Send + Sync {
    fn publish(&self, result: &FrameResult);

    fn published_count(&self) -> u64;

    fn shutdown(&self) {}
}

/// Publisher that counts and discards. Used when no downstream bus is
/// configured.
#[derive(Default)]
pub struct NullPublisher {
    published: AtomicU64,
}

impl ResultPublisher for NullPublisher {
    fn publish(&self, _result: &FrameResult) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub num_workers: usize,
    /// Physical accelerator cores available for pinning.
    pub num_cores: usize,
    /// Task queue capacity; `0` derives six slots per worker.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            num_cores: 3,
            queue_capacity: 0,
        }
    }
}

impl EngineConfig {
    fn resolved_queue_capacity(&self) -> usize {
        if self.queue_capacity > 0 {
            self.queue_capacity
        } else {
            self.num_workers.max(1) * 6
        }
    }
}

type CompletionCallback = Box<dyn Fn(&FrameResult) + Send + Sync>;

pub struct InferenceEngine {
    config: EngineConfig,
    registry: Arc<ModelRegistry>,
    queue: Arc<BoundedQueue<InferTask>>,
    workers: Mutex<Vec<InferWorker>>,
    publisher: Arc<dyn ResultPublisher>,
    callback: Mutex<Option<CompletionCallback>>,
    initialized: AtomicBool,
    /// Self-reference handed to worker sinks.
    weak_self: Weak<InferenceEngine>,
}

impl InferenceEngine {
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn AcceleratorRuntime>,
        publisher: Arc<dyn ResultPublisher>,
    ) -> Arc<Self> {
        let capacity = config.resolved_queue_capacity();
        Arc::new_cyclic(|weak_self| Self {
            config,
            registry: Arc::new(ModelRegistry::new(runtime)),
            queue: Arc::new(BoundedQueue::new(capacity)),
            workers: Mutex::new(Vec::new()),
            publisher,
            callback: Mutex::new(None),
            initialized: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// Create and start the worker pool. Idempotent.
    pub fn init(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("inference engine already initialized");
            return;
        }

        info!(
            "initializing inference engine: {} worker(s), queue capacity {}",
            self.config.num_workers,
            self.queue.capacity()
        );

        let weak = self.weak_self.clone();
        let sink: ResultSink = Arc::new(move |result| {
            if let Some(engine) = weak.upgrade() {
                engine.on_result_complete(result);
            }
        });

        let mut workers = self.workers.lock().unwrap();
        for worker_id in 0..self.config.num_workers {
            let mask = CoreMask::for_worker(worker_id, self.config.num_cores);
            let mut worker = InferWorker::new(
                worker_id,
                mask,
                self.registry.clone(),
                self.queue.clone(),
                sink.clone(),
            );
            worker.start();
            workers.push(worker);
        }
    }

    /// Ensure every artifact is loaded and every worker holds a context for
    /// it. Eager creation here keeps the first frames for a new stream off
    /// the lazy path.
    pub fn load_models(&self, models: &[ModelConfig]) -> Result<()> {
        for model in models {
            if self.registry.is_loaded(&model.model_path) {
                continue;
            }
            info!(
                "pre-loading model: {} (task={})",
                model.model_path, model.task_name
            );
            self.registry
                .load(&model.model_path)
                .with_context(|| format!("loading model {}", model.model_path))?;
            for worker in self.workers.lock().unwrap().iter() {
                worker
                    .pre_create_context(&model.model_path)
                    .with_context(|| format!("worker #{}", worker.worker_id()))?;
            }
        }
        Ok(())
    }

    /// Enqueue a task. Returns `false` when the engine is not initialized
    /// or already shut down.
    pub fn submit(&self, task: InferTask) -> bool {
        if !self.initialized.load(Ordering::SeqCst) {
            warn!("inference engine not initialized, dropping task");
            return false;
        }
        self.queue.push(task)
    }

    /// Install a callback invoked after publication of every frame result.
    pub fn set_result_callback(&self, callback: impl Fn(&FrameResult) + Send + Sync + 'static) {
        *self.callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Tear down in fixed order: wake workers out of the queue, stop them,
    /// shut the publisher, unload models.
    pub fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("inference engine shutting down");

        self.queue.stop();
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.iter_mut() {
            worker.stop();
        }
        workers.clear();
        drop(workers);

        self.publisher.shutdown();
        self.registry.unload_all();
        info!("inference engine shutdown complete");
    }

    fn on_result_complete(&self, result: FrameResult) {
        self.publisher.publish(&result);
        if let Some(callback) = self.callback.lock().unwrap().as_ref() {
            callback(&result);
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn queue_dropped(&self) -> u64 {
        self.queue.dropped_count()
    }

    /// Tasks popped across the live worker pool.
    pub fn total_processed(&self) -> u64 {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .map(|w| w.processed_count())
            .sum()
    }

    pub fn published_count(&self) -> u64 {
        self.publisher.published_count()
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
