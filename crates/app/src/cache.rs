//! Rolling per-stream image cache.
//!
//! Each stream keeps an ordered deque of JPEG frames covering the last `D`
//! seconds. Two eviction policies apply: inserting a frame first expires
//! entries older than the time window for that stream, then a global memory
//! budget evicts the oldest frame across all streams until the total fits.
//!
//! Locking is two-level: one lock on the id → deque map, one lock per
//! stream deque. Inserts against different streams run concurrently; only
//! global eviction walks every stream's front pointer under the map lock.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use tracing::debug;

use crate::types::CachedFrame;

struct StreamCache {
    frames: Mutex<VecDeque<CachedFrame>>,
    memory_bytes: AtomicUsize,
}

impl StreamCache {
    fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            memory_bytes: AtomicUsize::new(0),
        }
    }
}

pub struct ImageCache {
    duration_ms: i64,
    /// Zero disables the global budget.
    max_memory_bytes: usize,
    caches: Mutex<HashMap<String, Arc<StreamCache>>>,
    total_memory: AtomicUsize,
}

impl ImageCache {
    pub fn new(duration_sec: u64, max_memory_mb: usize) -> Self {
        Self {
            duration_ms: (duration_sec * 1000) as i64,
            max_memory_bytes: max_memory_mb * 1024 * 1024,
            caches: Mutex::new(HashMap::new()),
            total_memory: AtomicUsize::new(0),
        }
    }

    /// Register a stream. Idempotent; `add_frame` also creates on demand.
    pub fn add_stream(&self, cam_id: &str) {
        let mut caches = self.caches.lock().unwrap();
        caches
            .entry(cam_id.to_string())
            .or_insert_with(|| Arc::new(StreamCache::new()));
    }

    /// Drop a stream and all its cached frames.
    pub fn remove_stream(&self, cam_id: &str) {
        let mut caches = self.caches.lock().unwrap();
        if let Some(cache) = caches.remove(cam_id) {
            let freed = cache.memory_bytes.load(Ordering::SeqCst);
            self.total_memory.fetch_sub(freed, Ordering::SeqCst);
        }
    }

    /// Insert a frame: expire this stream's out-of-window entries, append,
    /// then enforce the global memory budget.
    pub fn add_frame(&self, frame: CachedFrame) {
        let cache = self.get_or_create(&frame.cam_id);
        let frame_size = frame.jpeg_size();

        {
            let mut frames = cache.frames.lock().unwrap();
            self.evict_expired(&cache, &mut frames, frame.timestamp_ms);
            frames.push_back(frame);
            cache.memory_bytes.fetch_add(frame_size, Ordering::SeqCst);
        }
        self.total_memory.fetch_add(frame_size, Ordering::SeqCst);

        if self.max_memory_bytes > 0
            && self.total_memory.load(Ordering::SeqCst) > self.max_memory_bytes
        {
            self.evict_global();
        }
    }

    /// Frame with an exactly matching timestamp.
    pub fn get_exact(&self, cam_id: &str, timestamp_ms: i64) -> Option<CachedFrame> {
        let cache = self.get(cam_id)?;
        let frames = cache.frames.lock().unwrap();
        frames
            .iter()
            .find(|f| f.timestamp_ms == timestamp_ms)
            .cloned()
    }

    /// Frame minimising `|timestamp - requested|`; ties go to the earlier
    /// frame.
    pub fn get_nearest(&self, cam_id: &str, timestamp_ms: i64) -> Option<CachedFrame> {
        let cache = self.get(cam_id)?;
        let frames = cache.frames.lock().unwrap();
        frames
            .iter()
            .min_by_key(|f| (f.timestamp_ms - timestamp_ms).abs())
            .cloned()
    }

    pub fn get_latest(&self, cam_id: &str) -> Option<CachedFrame> {
        let cache = self.get(cam_id)?;
        let frames = cache.frames.lock().unwrap();
        frames.back().cloned()
    }

    pub fn total_memory_bytes(&self) -> usize {
        self.total_memory.load(Ordering::SeqCst)
    }

    pub fn total_frames(&self) -> usize {
        let caches = self.caches.lock().unwrap();
        caches
            .values()
            .map(|c| c.frames.lock().unwrap().len())
            .sum()
    }

    pub fn stream_frame_count(&self, cam_id: &str) -> usize {
        self.get(cam_id)
            .map(|c| c.frames.lock().unwrap().len())
            .unwrap_or(0)
    }

    pub fn stream_count(&self) -> usize {
        self.caches.lock().unwrap().len()
    }

    fn get_or_create(&self, cam_id: &str) -> Arc<StreamCache> {
        let mut caches = self.caches.lock().unwrap();
        caches
            .entry(cam_id.to_string())
            .or_insert_with(|| Arc::new(StreamCache::new()))
            .clone()
    }

    fn get(&self, cam_id: &str) -> Option<Arc<StreamCache>> {
        self.caches.lock().unwrap().get(cam_id).cloned()
    }

    /// Caller holds the stream's frame lock.
    fn evict_expired(
        &self,
        cache: &StreamCache,
        frames: &mut VecDeque<CachedFrame>,
        now_ms: i64,
    ) {
        let threshold = now_ms - self.duration_ms;
        while let Some(front) = frames.front() {
            if front.timestamp_ms >= threshold {
                break;
            }
            let size = front.jpeg_size();
            frames.pop_front();
            cache.memory_bytes.fetch_sub(size, Ordering::SeqCst);
            self.total_memory.fetch_sub(size, Ordering::SeqCst);
        }
    }

    /// Evict the globally oldest frame repeatedly until the budget fits.
    fn evict_global(&self) {
        let caches = self.caches.lock().unwrap();

        let mut evicted = 0usize;
        while self.total_memory.load(Ordering::SeqCst) > self.max_memory_bytes {
            let mut oldest: Option<(&Arc<StreamCache>, i64)> = None;
            for cache in caches.values() {
                let frames = cache.frames.lock().unwrap();
                if let Some(front) = frames.front() {
                    if oldest.is_none_or(|(_, ts)| front.timestamp_ms < ts) {
                        oldest = Some((cache, front.timestamp_ms));
                    }
                }
            }

            let Some((cache, _)) = oldest else {
                break; // every stream is empty
            };
            let mut frames = cache.frames.lock().unwrap();
            if let Some(front) = frames.pop_front() {
                let size = front.jpeg_size();
                cache.memory_bytes.fetch_sub(size, Ordering::SeqCst);
                self.total_memory.fetch_sub(size, Ordering::SeqCst);
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(
                "cache evicted {evicted} frame(s) for memory budget ({} / {} bytes)",
                self.total_memory.load(Ordering::SeqCst),
                self.max_memory_bytes
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(cam_id: &str, frame_id: u64, timestamp_ms: i64, size: usize) -> CachedFrame {
        CachedFrame {
            cam_id: cam_id.to_string(),
            frame_id,
            timestamp_ms,
            width: 640,
            height: 360,
            jpeg: Arc::new(vec![0u8; size]),
        }
    }

    #[test]
    fn frames_older_than_the_window_expire_on_insert() {
        let cache = ImageCache::new(5, 0);
        cache.add_stream("cam-1");
        for i in 0..5 {
            cache.add_frame(frame("cam-1", i, 1_000 * i as i64, 100));
        }
        assert_eq!(cache.stream_frame_count("cam-1"), 5);

        // t=20s expires everything below 15s.
        cache.add_frame(frame("cam-1", 99, 20_000, 100));
        assert_eq!(cache.stream_frame_count("cam-1"), 1);
        assert_eq!(cache.get_latest("cam-1").unwrap().frame_id, 99);
        assert_eq!(cache.total_memory_bytes(), 100);
    }

    #[test]
    fn memory_budget_evicts_oldest_across_streams() {
        // 1 MiB budget, 200 KiB frames: at most 5 fit.
        let cache = ImageCache::new(3600, 1);
        let size = 200 * 1024;
        for i in 0..3 {
            cache.add_frame(frame("cam-a", i, 1_000 + i as i64, size));
        }
        for i in 0..3 {
            cache.add_frame(frame("cam-b", i, 2_000 + i as i64, size));
        }

        assert!(cache.total_memory_bytes() <= 1024 * 1024);
        assert_eq!(cache.total_frames(), 5);
        // cam-a's first frame was globally oldest.
        assert_eq!(cache.stream_frame_count("cam-a"), 2);
        assert_eq!(cache.stream_frame_count("cam-b"), 3);
        assert!(cache.get_exact("cam-a", 1_000).is_none());
    }

    #[test]
    fn total_memory_equals_the_sum_of_jpeg_sizes() {
        let cache = ImageCache::new(3600, 0);
        cache.add_frame(frame("cam-a", 1, 1, 123));
        cache.add_frame(frame("cam-a", 2, 2, 456));
        cache.add_frame(frame("cam-b", 1, 3, 789));
        assert_eq!(cache.total_memory_bytes(), 123 + 456 + 789);

        cache.remove_stream("cam-a");
        assert_eq!(cache.total_memory_bytes(), 789);
        assert_eq!(cache.stream_count(), 1);
    }

    #[test]
    fn lookups_cover_exact_nearest_and_latest() {
        let cache = ImageCache::new(3600, 0);
        for (id, ts) in [(1u64, 1_000i64), (2, 2_000), (3, 3_000)] {
            cache.add_frame(frame("cam-1", id, ts, 10));
        }

        assert_eq!(cache.get_exact("cam-1", 2_000).unwrap().frame_id, 2);
        assert!(cache.get_exact("cam-1", 2_001).is_none());

        assert_eq!(cache.get_nearest("cam-1", 2_400).unwrap().frame_id, 2);
        assert_eq!(cache.get_nearest("cam-1", 2_600).unwrap().frame_id, 3);
        assert_eq!(cache.get_nearest("cam-1", -5_000).unwrap().frame_id, 1);

        assert_eq!(cache.get_latest("cam-1").unwrap().frame_id, 3);
        assert!(cache.get_latest("cam-x").is_none());
        assert!(cache.get_nearest("cam-x", 0).is_none());
    }

    #[test]
    fn add_and_remove_stream_are_idempotent() {
        let cache = ImageCache::new(5, 0);
        cache.add_stream("cam-1");
        cache.add_stream("cam-1");
        assert_eq!(cache.stream_count(), 1);
        cache.remove_stream("cam-1");
        cache.remove_stream("cam-1");
        assert_eq!(cache.stream_count(), 0);
    }
}
