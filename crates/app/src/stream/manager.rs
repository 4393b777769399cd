//! Stream lifecycle management.
//!
//! Owns the id → supervisor map behind a single lock. The lock is held only
//! for map mutation and scalar reads; supervisor joins and persistence
//! always happen outside it. Every mutation rewrites the persisted stream
//! list so a restart recreates the active set.

use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Result, bail};
use infer_core::FrameResult;
use tracing::{debug, error, info, warn};

use crate::{
    config::ConfigStore,
    stream::supervisor::{StreamSupervisor, SupervisorContext},
    types::{StreamConfig, StreamStatus},
};

pub struct StreamManager {
    streams: Mutex<HashMap<String, StreamSupervisor>>,
    ctx: SupervisorContext,
    save_path: PathBuf,
}

impl StreamManager {
    pub fn new(ctx: SupervisorContext, save_path: PathBuf) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            ctx,
            save_path,
        }
    }

    /// Admit a new stream: validate, preload labels and models, register
    /// with the image cache, launch the supervisor, persist. On failure the
    /// partially created state is rolled back.
    pub fn add(&self, config: StreamConfig) -> Result<()> {
        if config.cam_id.is_empty() {
            bail!("cam_id is required");
        }
        if config.source_url.is_empty() {
            bail!("source_url is required");
        }

        let cam_id = config.cam_id.clone();
        info!(
            "adding stream: [{cam_id}] {} (skip={}, {} model(s))",
            config.source_url,
            config.frame_skip,
            config.models.len()
        );

        let mut labels = HashMap::new();
        for model in &config.models {
            if let Some(labels_file) = &model.labels_file {
                labels
                    .entry(model.model_path.clone())
                    .or_insert_with(|| Arc::new(load_labels_file(Path::new(labels_file))));
            }
        }

        // Reserve the id before the slow work so concurrent adds cannot
        // race past the duplicate check.
        let supervisor = StreamSupervisor::new(config.clone(), labels, self.ctx.clone());
        {
            let mut streams = self.streams.lock().unwrap();
            if streams.contains_key(&cam_id) {
                bail!("stream {cam_id} already exists");
            }
            streams.insert(cam_id.clone(), supervisor);
        }

        if let Err(err) = self.ctx.engine.load_models(&config.models) {
            self.streams.lock().unwrap().remove(&cam_id);
            return Err(err.context(format!("loading models for stream {cam_id}")));
        }

        if let Some(cache) = &self.ctx.cache {
            cache.add_stream(&cam_id);
        }

        {
            let mut streams = self.streams.lock().unwrap();
            match streams.get_mut(&cam_id) {
                Some(supervisor) => {
                    supervisor.start();
                }
                None => bail!("stream {cam_id} was removed during admission"),
            }
        }

        self.save_configs();
        Ok(())
    }

    /// Stop and remove a stream. The supervisor joins outside the map lock.
    pub fn remove(&self, cam_id: &str) -> bool {
        let mut supervisor = {
            let mut streams = self.streams.lock().unwrap();
            let Some(supervisor) = streams.remove(cam_id) else {
                warn!("cannot remove stream {cam_id}: not found");
                return false;
            };
            supervisor.signal_stop();
            supervisor
        };
        supervisor.join_stopped();
        info!("removed stream: [{cam_id}]");

        if let Some(cache) = &self.ctx.cache {
            cache.remove_stream(cam_id);
        }
        self.save_configs();
        true
    }

    /// Start an existing, currently stopped stream. Returns `false` for
    /// unknown ids and for streams that are already running.
    pub fn start(&self, cam_id: &str) -> bool {
        let mut streams = self.streams.lock().unwrap();
        match streams.get_mut(cam_id) {
            Some(supervisor) => {
                let started = supervisor.start();
                if started {
                    info!("started stream: [{cam_id}]");
                } else {
                    warn!("stream {cam_id} is already running");
                }
                started
            }
            None => {
                warn!("cannot start stream {cam_id}: not found");
                false
            }
        }
    }

    /// Stop a stream, joining its supervisor outside the map lock.
    pub fn stop(&self, cam_id: &str) -> bool {
        let handle = {
            let mut streams = self.streams.lock().unwrap();
            let Some(supervisor) = streams.get_mut(cam_id) else {
                warn!("cannot stop stream {cam_id}: not found");
                return false;
            };
            supervisor.signal_stop();
            supervisor.take_handle()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        info!("stopped stream: [{cam_id}]");
        true
    }

    pub fn start_all(&self) {
        let idle: Vec<String> = {
            let streams = self.streams.lock().unwrap();
            streams
                .iter()
                .filter(|(_, s)| !s.is_running())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for cam_id in idle {
            self.start(&cam_id);
        }
    }

    /// Signal every stream first, then join all supervisors outside the
    /// lock so slow shutdowns overlap.
    pub fn stop_all(&self) {
        let handles: Vec<_> = {
            let mut streams = self.streams.lock().unwrap();
            streams
                .values_mut()
                .map(|supervisor| {
                    supervisor.signal_stop();
                    supervisor.take_handle()
                })
                .collect()
        };
        for handle in handles.into_iter().flatten() {
            let _ = handle.join();
        }
    }

    pub fn get_status(&self, cam_id: &str) -> Option<StreamStatus> {
        self.streams
            .lock()
            .unwrap()
            .get(cam_id)
            .map(StreamSupervisor::status)
    }

    pub fn get_all_status(&self) -> Vec<StreamStatus> {
        self.streams
            .lock()
            .unwrap()
            .values()
            .map(StreamSupervisor::status)
            .collect()
    }

    pub fn get_all_configs(&self) -> Vec<StreamConfig> {
        self.streams
            .lock()
            .unwrap()
            .values()
            .map(|s| s.config().clone())
            .collect()
    }

    pub fn has_stream(&self, cam_id: &str) -> bool {
        self.streams.lock().unwrap().contains_key(cam_id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Recreate streams persisted by a previous run.
    pub fn load_and_start(&self, configs: &[StreamConfig]) {
        info!("restoring {} persisted stream(s)", configs.len());
        for config in configs {
            let cam_id = config.cam_id.clone();
            if let Err(err) = self.add(config.clone()) {
                error!("failed to restore stream [{cam_id}]: {err:#}");
            }
        }
    }

    /// Completion callback installed on the engine: attribute the published
    /// frame to its stream.
    pub fn on_infer_result(&self, result: &FrameResult) {
        let streams = self.streams.lock().unwrap();
        if let Some(supervisor) = streams.get(&result.cam_id) {
            supervisor.note_inferred();
        }
    }

    pub fn shutdown(&self) {
        info!("stream manager shutting down");
        self.stop_all();
    }

    fn save_configs(&self) {
        let configs = self.get_all_configs();
        match ConfigStore::save_streams(&self.save_path, &configs) {
            Ok(()) => debug!(
                "saved {} stream config(s) to {}",
                configs.len(),
                self.save_path.display()
            ),
            Err(err) => error!("failed to save stream configs: {err:#}"),
        }
    }
}

/// Read a labels file: one class name per line, trimmed, empty lines
/// skipped. Unreadable files yield an empty list with a warning.
pub fn load_labels_file(path: &Path) -> Vec<String> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!("cannot open labels file {}: {err}", path.display());
            return Vec::new();
        }
    };

    let labels: Vec<String> = BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    debug!("loaded {} label(s) from {}", labels.len(), path.display());
    labels
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn labels_files_are_trimmed_and_filtered() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "person\r").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  car  ").unwrap();
        writeln!(file, "phone").unwrap();
        file.flush().unwrap();

        let labels = load_labels_file(file.path());
        assert_eq!(labels, vec!["person", "car", "phone"]);
    }

    #[test]
    fn missing_labels_file_yields_empty_list() {
        assert!(load_labels_file(Path::new("/nonexistent/labels.txt")).is_empty());
    }
}
