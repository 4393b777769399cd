//! Accelerator-bound inference pipeline.
//!
//! The crate owns the concurrent core of the inference server: the bounded
//! task queue with drop-oldest admission, the model registry behind the
//! accelerator runtime seam, the per-frame multi-model result collector,
//! pure-CPU detector post-processing, and the worker pool that ties them
//! together under the [`engine::InferenceEngine`].

pub mod collector;
pub mod engine;
pub mod postprocess;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod stub;
pub mod types;
pub mod worker;

pub use collector::{FrameResultCollector, ResultAggregator};
pub use engine::{EngineConfig, InferenceEngine, ResultPublisher};
pub use queue::BoundedQueue;
pub use registry::{ModelRegistry, RegistryError};
pub use runtime::{
    AcceleratorRuntime, CoreMask, InferContext, LoadedModel, ModelDescriptor, QuantParams,
    RuntimeError, TensorData, TensorDesc,
};
pub use types::{
    BBox, Detection, FrameResult, InferTask, ModelConfig, ModelKind, ModelResult,
};
