use std::sync::Arc;

/// Total byte length of an NV12 buffer: Y plane followed by the interleaved
/// UV plane, `w * h * 3 / 2`.
pub fn nv12_buffer_len(width: u32, height: u32) -> usize {
    (width as usize) * (height as usize) * 3 / 2
}

/// A decoded frame in NV12 layout, backed by contiguous memory.
///
/// Frames are shared between the resize-for-inference and resize-for-cache
/// paths of a single decode-loop iteration, so the payload is reference
/// counted. Stream identity (camera id, frame id) is attached by the
/// supervisor when it builds inference tasks.
#[derive(Clone)]
pub struct Nv12Frame {
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp from the container, in stream time base units.
    pub pts: i64,
    /// Wall-clock capture time, milliseconds since the epoch.
    pub timestamp_ms: i64,
    pub data: Arc<Vec<u8>>,
}

impl Nv12Frame {
    /// True when the payload length matches the advertised dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == nv12_buffer_len(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_len_matches_nv12_layout() {
        assert_eq!(nv12_buffer_len(1920, 1080), 1920 * 1080 * 3 / 2);
        assert_eq!(nv12_buffer_len(2, 2), 6);
    }

    #[test]
    fn well_formed_checks_length() {
        let frame = Nv12Frame {
            width: 4,
            height: 2,
            pts: 0,
            timestamp_ms: 0,
            data: Arc::new(vec![0u8; nv12_buffer_len(4, 2)]),
        };
        assert!(frame.is_well_formed());

        let short = Nv12Frame {
            data: Arc::new(vec![0u8; 3]),
            ..frame
        };
        assert!(!short.is_well_formed());
    }
}
