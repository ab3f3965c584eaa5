//! Track metadata and encoded chunks.

use bytes::Bytes;

/// Codec parameters needed to configure a decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecConfig {
    /// Sample entry four-character code, e.g. `avc1` or `raw `.
    pub codec: String,
    pub coded_width: u32,
    pub coded_height: u32,
    /// Bits per pixel as declared by the sample entry.
    pub depth: u16,
    /// Out-of-band decoder configuration (`avcC` payload for H.264).
    pub description: Option<Bytes>,
}

/// Immutable description of the selected video track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata {
    pub codec: CodecConfig,
    pub width: u32,
    pub height: u32,
    pub duration_us: i64,
    pub frame_rate: f64,
    pub frame_count: u64,
    /// Presentation timestamps of sync samples, ascending.
    pub keyframe_timestamps: Vec<i64>,
    /// Presentation timestamps of every frame, ascending.
    pub frame_timestamps: Vec<i64>,
}

impl TrackMetadata {
    /// Timestamp of the frame displayed at `t_us`.
    pub fn frame_at_or_before(&self, t_us: i64) -> Option<i64> {
        at_or_before(&self.frame_timestamps, t_us)
    }

    /// Timestamp of the last keyframe at or before `t_us`.
    pub fn keyframe_at_or_before(&self, t_us: i64) -> Option<i64> {
        at_or_before(&self.keyframe_timestamps, t_us)
    }

    /// Nominal frame duration.
    pub fn frame_duration_us(&self) -> i64 {
        if self.frame_rate > 0.0 {
            (1_000_000.0 / self.frame_rate).round() as i64
        } else {
            0
        }
    }

    pub fn first_frame_us(&self) -> Option<i64> {
        self.frame_timestamps.first().copied()
    }
}

fn at_or_before(sorted: &[i64], t_us: i64) -> Option<i64> {
    let idx = sorted.partition_point(|&ts| ts <= t_us);
    idx.checked_sub(1).map(|i| sorted[i])
}

/// One compressed sample in decode order.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    /// Presentation timestamp.
    pub timestamp_us: i64,
    pub duration_us: i64,
    pub is_keyframe: bool,
    pub data: Bytes,
    /// Position in decode order.
    pub decode_index: u64,
    /// Position in presentation order.
    pub presentation_index: u64,
}

/// Where a keyframe seek landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekPoint {
    pub timestamp_us: i64,
    pub decode_index: u64,
    pub presentation_index: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> TrackMetadata {
        TrackMetadata {
            codec: CodecConfig {
                codec: "raw ".into(),
                coded_width: 2,
                coded_height: 2,
                depth: 24,
                description: None,
            },
            width: 2,
            height: 2,
            duration_us: 400_000,
            frame_rate: 10.0,
            frame_count: 4,
            keyframe_timestamps: vec![0, 200_000],
            frame_timestamps: vec![0, 100_000, 200_000, 300_000],
        }
    }

    #[test]
    fn test_frame_lookup() {
        let meta = metadata();
        assert_eq!(meta.frame_at_or_before(150_000), Some(100_000));
        assert_eq!(meta.frame_at_or_before(100_000), Some(100_000));
        assert_eq!(meta.frame_at_or_before(-1), None);
        assert_eq!(meta.keyframe_at_or_before(199_999), Some(0));
        assert_eq!(meta.keyframe_at_or_before(999_999), Some(200_000));
    }

    #[test]
    fn test_frame_duration() {
        assert_eq!(metadata().frame_duration_us(), 100_000);
    }
}
