//! Accelerator runtime seam.
//!
//! The actual driver bindings (model deserialisation, tensor I/O, the
//! inference call itself) live behind these traits. The registry loads
//! artifacts through an [`AcceleratorRuntime`]; each worker owns
//! [`InferContext`]s created from the shared [`LoadedModel`]s and never
//! touches another worker's context.

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("model init failed: {0}")]
    Init(String),
    #[error("failed to bind accelerator core: {0}")]
    CoreBind(String),
    #[error("inference failed: {0}")]
    Infer(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Core affinity for an inference context.
///
/// Workers pin to one physical core each while enough cores exist; surplus
/// workers fall back to driver scheduling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreMask {
    Auto,
    Core(u32),
}

impl CoreMask {
    /// Assignment rule for `worker_id` over `num_cores` physical cores:
    /// workers below the core count pin one core apiece, the rest run auto.
    pub fn for_worker(worker_id: usize, num_cores: usize) -> Self {
        if num_cores > 0 && worker_id < num_cores {
            CoreMask::Core((worker_id % num_cores) as u32)
        } else {
            CoreMask::Auto
        }
    }
}

/// Quantization parameters of a tensor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantParams {
    pub zero_point: i32,
    pub scale: f32,
}

/// Shape and quantization metadata for one tensor.
#[derive(Clone, Debug)]
pub struct TensorDesc {
    pub dims: Vec<usize>,
    pub n_elems: usize,
    pub quant: Option<QuantParams>,
}

impl TensorDesc {
    pub fn float(dims: Vec<usize>) -> Self {
        let n_elems = dims.iter().product();
        Self {
            dims,
            n_elems,
            quant: None,
        }
    }

    pub fn quantized(dims: Vec<usize>, zero_point: i32, scale: f32) -> Self {
        let n_elems = dims.iter().product();
        Self {
            dims,
            n_elems,
            quant: Some(QuantParams { zero_point, scale }),
        }
    }
}

/// Input and output tensor metadata for a loaded model.
#[derive(Clone, Debug)]
pub struct ModelDescriptor {
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
}

/// One output tensor as produced by a context.
#[derive(Clone, Debug)]
pub enum TensorData {
    Float(Vec<f32>),
    Quantized {
        data: Vec<i8>,
        zero_point: i32,
        scale: f32,
    },
}

/// Deserialises model artifacts into shareable [`LoadedModel`]s.
pub trait AcceleratorRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(&self, artifact: &[u8]) -> Result<Arc<dyn LoadedModel>, RuntimeError>;
}

/// A deserialised model plus its master driver state. Contexts derived from
/// it execute independently.
pub trait LoadedModel: Send + Sync {
    fn descriptor(&self) -> &ModelDescriptor;

    /// Create an execution context bound to `core`. Implementations return
    /// [`RuntimeError::CoreBind`] when the mask cannot be honoured; the
    /// caller retries with [`CoreMask::Auto`].
    fn create_context(&self, core: CoreMask) -> Result<Box<dyn InferContext>, RuntimeError>;
}

/// Worker-owned execution context. Not shared across threads.
pub trait InferContext: Send {
    /// Run inference over a packed RGB input buffer and return every output
    /// tensor, quantized or float as the model produces them.
    fn infer(&mut self, input: &[u8]) -> Result<Vec<TensorData>, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_assignment_pins_then_falls_back() {
        assert_eq!(CoreMask::for_worker(0, 3), CoreMask::Core(0));
        assert_eq!(CoreMask::for_worker(1, 3), CoreMask::Core(1));
        assert_eq!(CoreMask::for_worker(2, 3), CoreMask::Core(2));
        assert_eq!(CoreMask::for_worker(3, 3), CoreMask::Auto);
        assert_eq!(CoreMask::for_worker(7, 3), CoreMask::Auto);
        assert_eq!(CoreMask::for_worker(0, 0), CoreMask::Auto);
    }

    #[test]
    fn tensor_desc_derives_element_count() {
        let desc = TensorDesc::float(vec![1, 80, 80, 255]);
        assert_eq!(desc.n_elems, 80 * 80 * 255);
        let q = TensorDesc::quantized(vec![1, 4], -12, 0.5);
        assert_eq!(q.n_elems, 4);
        assert_eq!(
            q.quant,
            Some(QuantParams {
                zero_point: -12,
                scale: 0.5
            })
        );
    }
}
