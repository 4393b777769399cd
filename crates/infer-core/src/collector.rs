//! Per-frame multi-model result aggregation.
//!
//! When a stream runs N models over the same frame, the decode loop creates
//! one [`FrameResultCollector`] and every `InferTask` for that frame shares
//! it. Workers call [`ResultAggregator::add`] concurrently; the call that
//! completes the set receives the assembled [`FrameResult`] and owns its
//! publication.

use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use crate::types::{FrameResult, ModelResult};

/// Type-erased aggregation handle carried by queue tasks.
///
/// The queue stays ignorant of the concrete collector; tasks own a
/// reference-counted handle to this trait.
pub trait ResultAggregator: Send + Sync {
    /// Record one model's result. Returns the complete `FrameResult` to
    /// exactly one caller: the one whose addition reaches the expected
    /// total.
    fn add(&self, result: ModelResult) -> Option<FrameResult>;

    /// Number of model results this frame expects.
    fn total(&self) -> usize;

    /// Number of results recorded so far.
    fn completed(&self) -> usize;

    fn is_complete(&self) -> bool {
        self.completed() >= self.total()
    }
}

pub struct FrameResultCollector {
    total: usize,
    completed: AtomicUsize,
    /// Holds the accumulating result until completion hands it out.
    slot: Mutex<Option<FrameResult>>,
}

impl FrameResultCollector {
    /// `base` carries the frame-level fields; its `results` list is filled
    /// by `add` calls.
    pub fn new(total: usize, mut base: FrameResult) -> Self {
        base.results.reserve(total);
        Self {
            total: total.max(1),
            completed: AtomicUsize::new(0),
            slot: Mutex::new(Some(base)),
        }
    }
}

impl ResultAggregator for FrameResultCollector {
    fn add(&self, result: ModelResult) -> Option<FrameResult> {
        let mut slot = self.slot.lock().unwrap();
        let frame = slot.as_mut()?;
        frame.results.push(result);
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if completed == self.total {
            return slot.take();
        }
        None
    }

    fn total(&self) -> usize {
        self.total
    }

    fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }
}
