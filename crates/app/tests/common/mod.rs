//! Shared fixtures for the pipeline integration tests: a collecting
//! publisher, a canned stub model, and a fully wired manager over the
//! synthetic source.
#![allow(dead_code)]

use std::{
    fs,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tempfile::TempDir;

use infer_core::{
    EngineConfig, FrameResult, InferenceEngine, ModelConfig, ModelKind, ResultPublisher,
    runtime::{ModelDescriptor, TensorData, TensorDesc},
    stub::{StubModelSpec, StubRuntime},
};
use infer_server::{
    cache::ImageCache,
    stream::{CacheSettings, StreamManager, SupervisorContext},
};
use video_ingest::{SoftwareConverter, synth::SyntheticFactory};

#[derive(Default)]
pub struct CollectingPublisher {
    pub results: Mutex<Vec<FrameResult>>,
    published: AtomicU64,
}

impl ResultPublisher for CollectingPublisher {
    fn publish(&self, result: &FrameResult) {
        self.results.lock().unwrap().push(result.clone());
        self.published.fetch_add(1, Ordering::SeqCst);
    }

    fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

/// Fused-layout stub spec producing exactly one detection per call.
pub fn one_detection_spec() -> StubModelSpec {
    let anchors = 100usize;
    let channels = 5usize;
    let mut data = vec![0.0f32; channels * anchors];
    for v in data[4 * anchors..].iter_mut() {
        *v = -10.0;
    }
    data[0] = 320.0;
    data[anchors] = 240.0;
    data[2 * anchors] = 64.0;
    data[3 * anchors] = 48.0;
    data[4 * anchors] = 3.0;

    StubModelSpec {
        descriptor: ModelDescriptor {
            inputs: vec![TensorDesc::float(vec![1, 640, 640, 3])],
            outputs: vec![TensorDesc::float(vec![1, channels, anchors])],
        },
        outputs: vec![TensorData::Float(data)],
        latency: None,
    }
}

pub struct Harness {
    pub manager: Arc<StreamManager>,
    pub engine: Arc<InferenceEngine>,
    pub publisher: Arc<CollectingPublisher>,
    pub cache: Arc<ImageCache>,
    pub factory: Arc<SyntheticFactory>,
    pub dir: TempDir,
}

impl Harness {
    /// Wire a full manager over the given synthetic factory, with the stub
    /// runtime's `det-one` model registered.
    pub fn new(factory: SyntheticFactory) -> Self {
        let runtime = Arc::new(StubRuntime::default());
        runtime.register("det-one", one_detection_spec());

        let publisher = Arc::new(CollectingPublisher::default());
        let engine = InferenceEngine::new(
            EngineConfig {
                num_workers: 2,
                num_cores: 3,
                queue_capacity: 0,
            },
            runtime,
            publisher.clone(),
        );
        engine.init();

        let cache = Arc::new(ImageCache::new(5, 0));
        let factory = Arc::new(factory);
        let dir = TempDir::new().unwrap();

        let manager = Arc::new(StreamManager::new(
            SupervisorContext {
                engine: engine.clone(),
                cache: Some(cache.clone()),
                source_factory: factory.clone(),
                converter: Arc::new(SoftwareConverter),
                cache_settings: CacheSettings {
                    resize_width: 320,
                    jpeg_quality: 75,
                },
            },
            dir.path().join("streams.json"),
        ));

        let callback_manager = Arc::downgrade(&manager);
        engine.set_result_callback(move |result| {
            if let Some(manager) = callback_manager.upgrade() {
                manager.on_infer_result(result);
            }
        });

        Self {
            manager,
            engine,
            publisher,
            cache,
            factory,
            dir,
        }
    }

    /// Write a model artifact that the stub runtime resolves to `tag`.
    pub fn artifact(&self, tag: &str) -> PathBuf {
        let path = self.dir.path().join(format!("{tag}-{}.bin", next_suffix()));
        fs::write(&path, tag).unwrap();
        path
    }

    pub fn model(&self, tag: &str, task_name: &str) -> ModelConfig {
        ModelConfig {
            model_path: self.artifact(tag).to_str().unwrap().to_string(),
            task_name: task_name.to_string(),
            kind: ModelKind::Yolov11,
            input_width: 64,
            input_height: 64,
            conf_threshold: 0.25,
            nms_threshold: 0.45,
            labels_file: None,
        }
    }

    pub fn shutdown(self) {
        self.manager.shutdown();
        self.engine.shutdown();
    }
}

static SUFFIX: AtomicU64 = AtomicU64::new(0);

fn next_suffix() -> u64 {
    SUFFIX.fetch_add(1, Ordering::SeqCst)
}

/// Poll until `predicate` holds or the timeout expires; panics with
/// `context` on expiry.
pub fn wait_until(timeout: Duration, context: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {context}");
        std::thread::sleep(Duration::from_millis(20));
    }
}
