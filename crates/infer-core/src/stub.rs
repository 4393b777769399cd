//! Deterministic in-process runtime.
//!
//! Serves two purposes: unit and integration tests run the full pipeline
//! against it, and driverless deployments (no accelerator present) can still
//! boot the server with it. Artifacts are keyed by their byte content — the
//! UTF-8 trimmed payload is treated as a registration tag.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use crate::runtime::{
    AcceleratorRuntime, CoreMask, InferContext, LoadedModel, ModelDescriptor, RuntimeError,
    TensorData, TensorDesc,
};

/// Canned behaviour for one registered model tag.
#[derive(Clone)]
pub struct StubModelSpec {
    pub descriptor: ModelDescriptor,
    /// Outputs returned by every inference call.
    pub outputs: Vec<TensorData>,
    /// Artificial per-call latency, for backpressure tests.
    pub latency: Option<Duration>,
}

impl StubModelSpec {
    /// A fused-layout model (`[1, 4 + classes, 8400]`) whose logits sit far
    /// below any confidence threshold, so it detects nothing.
    pub fn silent(classes: usize) -> Self {
        let dims = vec![1, 4 + classes, 8400];
        let n: usize = dims.iter().product();
        Self {
            descriptor: ModelDescriptor {
                inputs: vec![TensorDesc::float(vec![1, 640, 640, 3])],
                outputs: vec![TensorDesc::float(dims)],
            },
            outputs: vec![TensorData::Float(vec![-10.0; n])],
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

/// Stub [`AcceleratorRuntime`] with a fixed number of virtual cores.
pub struct StubRuntime {
    specs: Mutex<HashMap<String, StubModelSpec>>,
    num_cores: u32,
}

impl Default for StubRuntime {
    fn default() -> Self {
        Self::new(3)
    }
}

impl StubRuntime {
    pub fn new(num_cores: u32) -> Self {
        Self {
            specs: Mutex::new(HashMap::new()),
            num_cores,
        }
    }

    /// Associate canned behaviour with an artifact tag. Artifacts whose
    /// content matches no registration load as [`StubModelSpec::silent`].
    pub fn register(&self, tag: &str, spec: StubModelSpec) {
        self.specs.lock().unwrap().insert(tag.to_string(), spec);
    }
}

impl AcceleratorRuntime for StubRuntime {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn load(&self, artifact: &[u8]) -> Result<Arc<dyn LoadedModel>, RuntimeError> {
        if artifact.is_empty() {
            return Err(RuntimeError::Init("empty artifact".to_string()));
        }
        let tag = String::from_utf8_lossy(artifact).trim().to_string();
        let spec = self
            .specs
            .lock()
            .unwrap()
            .get(&tag)
            .cloned()
            .unwrap_or_else(|| StubModelSpec::silent(80));
        Ok(Arc::new(StubModel {
            spec,
            num_cores: self.num_cores,
        }))
    }
}

struct StubModel {
    spec: StubModelSpec,
    num_cores: u32,
}

impl LoadedModel for StubModel {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.spec.descriptor
    }

    fn create_context(&self, core: CoreMask) -> Result<Box<dyn InferContext>, RuntimeError> {
        if let CoreMask::Core(n) = core {
            if n >= self.num_cores {
                return Err(RuntimeError::CoreBind(format!(
                    "core {n} out of range (have {})",
                    self.num_cores
                )));
            }
        }
        Ok(Box::new(StubContext {
            outputs: self.spec.outputs.clone(),
            latency: self.spec.latency,
        }))
    }
}

struct StubContext {
    outputs: Vec<TensorData>,
    latency: Option<Duration>,
}

impl InferContext for StubContext {
    fn infer(&mut self, input: &[u8]) -> Result<Vec<TensorData>, RuntimeError> {
        if input.is_empty() {
            return Err(RuntimeError::Infer("empty input buffer".to_string()));
        }
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
        Ok(self.outputs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tags_load_as_silent_models() {
        let runtime = StubRuntime::default();
        let model = runtime.load(b"anything").unwrap();
        let mut ctx = model.create_context(CoreMask::Auto).unwrap();
        let outputs = ctx.infer(&[0u8; 16]).unwrap();
        assert_eq!(outputs.len(), 1);
        match &outputs[0] {
            TensorData::Float(values) => assert!(values.iter().all(|v| *v < -5.0)),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn registered_spec_takes_precedence() {
        let runtime = StubRuntime::default();
        let spec = StubModelSpec {
            descriptor: ModelDescriptor {
                inputs: vec![TensorDesc::float(vec![1, 2, 2, 3])],
                outputs: vec![TensorDesc::float(vec![1, 3])],
            },
            outputs: vec![TensorData::Float(vec![1.0, 2.0, 3.0])],
            latency: None,
        };
        runtime.register("model-a", spec);

        let model = runtime.load(b"model-a\n").unwrap();
        assert_eq!(model.descriptor().outputs[0].n_elems, 3);
    }

    #[test]
    fn out_of_range_core_mask_is_a_bind_error() {
        let runtime = StubRuntime::new(2);
        let model = runtime.load(b"x").unwrap();
        assert!(model.create_context(CoreMask::Core(1)).is_ok());
        assert!(matches!(
            model.create_context(CoreMask::Core(2)),
            Err(RuntimeError::CoreBind(_))
        ));
    }

    #[test]
    fn empty_artifact_fails_to_load() {
        let runtime = StubRuntime::default();
        assert!(matches!(
            runtime.load(b""),
            Err(RuntimeError::Init(_))
        ));
    }
}
