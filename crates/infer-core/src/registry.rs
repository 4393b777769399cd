//! Model registry: loads artifacts once, hands out per-worker contexts.
//!
//! Artifacts are keyed by path. Loading reads the file a single time,
//! deserialises it through the runtime, and caches the tensor descriptors.
//! Worker contexts are independent driver states derived from the loaded
//! model; a failed core bind degrades to auto scheduling instead of failing
//! the worker.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::runtime::{
    AcceleratorRuntime, CoreMask, InferContext, LoadedModel, ModelDescriptor, RuntimeError,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read model artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("model artifact is empty: {path}")]
    EmptyArtifact { path: String },
    #[error("model not loaded: {path}")]
    NotLoaded { path: String },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

struct Entry {
    model: Arc<dyn LoadedModel>,
    descriptor: ModelDescriptor,
}

pub struct ModelRegistry {
    runtime: Arc<dyn AcceleratorRuntime>,
    models: Mutex<HashMap<String, Entry>>,
}

impl ModelRegistry {
    pub fn new(runtime: Arc<dyn AcceleratorRuntime>) -> Self {
        Self {
            runtime,
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Load an artifact. Idempotent: a second call for the same path is a
    /// no-op.
    pub fn load(&self, path: &str) -> Result<(), RegistryError> {
        {
            let models = self.models.lock().unwrap();
            if models.contains_key(path) {
                debug!("model already loaded: {path}");
                return Ok(());
            }
        }

        let bytes = std::fs::read(path).map_err(|source| RegistryError::Io {
            path: path.to_string(),
            source,
        })?;
        if bytes.is_empty() {
            return Err(RegistryError::EmptyArtifact {
                path: path.to_string(),
            });
        }

        info!(
            "loading model: {path} ({:.2} MB, runtime {})",
            bytes.len() as f64 / (1024.0 * 1024.0),
            self.runtime.name()
        );
        let model = self.runtime.load(&bytes)?;
        let descriptor = model.descriptor().clone();
        debug!(
            "model {path}: {} input(s), {} output(s)",
            descriptor.inputs.len(),
            descriptor.outputs.len()
        );

        self.models
            .lock()
            .unwrap()
            .insert(path.to_string(), Entry { model, descriptor });
        Ok(())
    }

    pub fn is_loaded(&self, path: &str) -> bool {
        self.models.lock().unwrap().contains_key(path)
    }

    pub fn loaded_count(&self) -> usize {
        self.models.lock().unwrap().len()
    }

    /// Create a context bound to `core` for one worker. When the mask cannot
    /// be honoured the context falls back to auto scheduling with a warning.
    /// Contexts release their driver state on drop.
    pub fn create_worker_context(
        &self,
        path: &str,
        core: CoreMask,
    ) -> Result<Box<dyn InferContext>, RegistryError> {
        let model = {
            let models = self.models.lock().unwrap();
            let entry = models.get(path).ok_or_else(|| RegistryError::NotLoaded {
                path: path.to_string(),
            })?;
            entry.model.clone()
        };

        match model.create_context(core) {
            Ok(ctx) => Ok(ctx),
            Err(RuntimeError::CoreBind(reason)) => {
                warn!("core bind failed for {path} ({reason}); falling back to auto scheduling");
                Ok(model.create_context(CoreMask::Auto)?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Cached tensor metadata, or `None` when the model is not loaded.
    pub fn get_descriptor(&self, path: &str) -> Option<ModelDescriptor> {
        self.models
            .lock()
            .unwrap()
            .get(path)
            .map(|entry| entry.descriptor.clone())
    }

    pub fn unload(&self, path: &str) {
        if self.models.lock().unwrap().remove(path).is_some() {
            info!("unloaded model: {path}");
        }
    }

    pub fn unload_all(&self) {
        let mut models = self.models.lock().unwrap();
        for path in models.keys() {
            info!("unloading model: {path}");
        }
        models.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::stub::StubRuntime;

    fn artifact(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn load_is_idempotent() {
        let registry = ModelRegistry::new(Arc::new(StubRuntime::default()));
        let file = artifact("model-a");
        let path = file.path().to_str().unwrap();

        registry.load(path).unwrap();
        registry.load(path).unwrap();
        assert_eq!(registry.loaded_count(), 1);
        assert!(registry.is_loaded(path));
    }

    #[test]
    fn descriptor_is_cached_after_load() {
        let registry = ModelRegistry::new(Arc::new(StubRuntime::default()));
        let file = artifact("model-a");
        let path = file.path().to_str().unwrap();

        assert!(registry.get_descriptor(path).is_none());
        registry.load(path).unwrap();
        let descriptor = registry.get_descriptor(path).unwrap();
        assert_eq!(descriptor.outputs.len(), 1);
    }

    #[test]
    fn missing_file_and_missing_model_are_distinct_errors() {
        let registry = ModelRegistry::new(Arc::new(StubRuntime::default()));
        assert!(matches!(
            registry.load("/nonexistent/model.bin"),
            Err(RegistryError::Io { .. })
        ));
        assert!(matches!(
            registry.create_worker_context("/nonexistent/model.bin", CoreMask::Auto),
            Err(RegistryError::NotLoaded { .. })
        ));
    }

    #[test]
    fn out_of_range_core_falls_back_to_auto() {
        let registry = ModelRegistry::new(Arc::new(StubRuntime::new(2)));
        let file = artifact("model-a");
        let path = file.path().to_str().unwrap();
        registry.load(path).unwrap();

        // Core 5 does not exist on a 2-core runtime; the registry retries
        // with auto scheduling rather than erroring.
        assert!(
            registry
                .create_worker_context(path, CoreMask::Core(5))
                .is_ok()
        );
    }

    #[test]
    fn unload_drops_the_entry() {
        let registry = ModelRegistry::new(Arc::new(StubRuntime::default()));
        let file = artifact("model-a");
        let path = file.path().to_str().unwrap();
        registry.load(path).unwrap();
        registry.unload(path);
        assert!(!registry.is_loaded(path));
        assert_eq!(registry.loaded_count(), 0);
    }
}
