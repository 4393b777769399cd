//! Stream supervision: per-stream decode loops and the lifecycle manager.

pub mod manager;
pub mod supervisor;

pub use manager::{StreamManager, load_labels_file};
pub use supervisor::{CacheSettings, StreamSupervisor, SupervisorContext};
