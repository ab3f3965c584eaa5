//! Trim segments and the effective ↔ source timeline mapping.
//!
//! A recording is trimmed by keeping an ordered set of source ranges. The
//! kept ranges are concatenated into the *effective* timeline that the export
//! produces. All times are microseconds.

use serde::{Deserialize, Serialize};

/// A retained source range and its position on the effective timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimSegment {
    /// Inclusive start in source time.
    pub source_start_us: i64,
    /// Exclusive end in source time.
    pub source_end_us: i64,
    /// Where `source_start_us` lands on the effective timeline.
    pub effective_start_us: i64,
}

/// A retained range as written in job files; effective positions are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimRange {
    pub start_us: i64,
    pub end_us: i64,
}

impl TrimSegment {
    pub fn duration_us(&self) -> i64 {
        self.source_end_us - self.source_start_us
    }

    pub fn effective_end_us(&self) -> i64 {
        self.effective_start_us + self.duration_us()
    }

    pub fn contains_source(&self, t_us: i64) -> bool {
        t_us >= self.source_start_us && t_us < self.source_end_us
    }
}

/// Errors raised while building or querying a trim mapping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrimError {
    #[error("Segment {index} has non-positive duration ({start_us}us..{end_us}us)")]
    EmptySegment {
        index: usize,
        start_us: i64,
        end_us: i64,
    },

    #[error("Segment {index} starts at a negative source time")]
    NegativeStart { index: usize },

    #[error("Segment {index} extends to {end_us}us, past the end of the {duration_us}us source")]
    BeyondSource {
        index: usize,
        end_us: i64,
        duration_us: i64,
    },

    #[error("Segment {index} pushes the effective timeline past i64 microseconds")]
    Overflow { index: usize },

    #[error("Segment {index} overlaps or precedes the previous segment")]
    Overlap { index: usize },

    #[error("Segment {index} effective start is {actual_us}us, expected {expected_us}us")]
    EffectiveGap {
        index: usize,
        expected_us: i64,
        actual_us: i64,
    },

    #[error("Effective time {t_us}us is outside [0, {duration_us}us)")]
    EffectiveOutOfRange { t_us: i64, duration_us: i64 },

    #[error("Source time {t_us}us is not inside a retained segment")]
    NotRetained { t_us: i64 },
}

/// Converts between the effective (post-trim) timeline and source time.
#[derive(Debug, Clone, PartialEq)]
pub struct TrimTimeMapper {
    segments: Vec<TrimSegment>,
    trimmed: bool,
}

impl TrimTimeMapper {
    /// Build a mapper from validated segments.
    ///
    /// With no segments the mapping is the identity over `[0, source_duration_us)`.
    /// Segments must lie inside the source.
    pub fn new(segments: Vec<TrimSegment>, source_duration_us: i64) -> Result<Self, TrimError> {
        if segments.is_empty() {
            return Ok(Self::identity(source_duration_us));
        }

        let mut expected_effective = 0i64;
        for (index, segment) in segments.iter().enumerate() {
            if segment.source_start_us < 0 {
                return Err(TrimError::NegativeStart { index });
            }
            if segment.duration_us() <= 0 {
                return Err(TrimError::EmptySegment {
                    index,
                    start_us: segment.source_start_us,
                    end_us: segment.source_end_us,
                });
            }
            if segment.source_end_us > source_duration_us {
                return Err(TrimError::BeyondSource {
                    index,
                    end_us: segment.source_end_us,
                    duration_us: source_duration_us,
                });
            }
            if index > 0 && segments[index - 1].source_end_us > segment.source_start_us {
                return Err(TrimError::Overlap { index });
            }
            if segment.effective_start_us != expected_effective {
                return Err(TrimError::EffectiveGap {
                    index,
                    expected_us: expected_effective,
                    actual_us: segment.effective_start_us,
                });
            }
            expected_effective = expected_effective
                .checked_add(segment.duration_us())
                .ok_or(TrimError::Overflow { index })?;
        }

        Ok(Self {
            segments,
            trimmed: true,
        })
    }

    /// Build a mapper from retained source ranges, deriving effective starts.
    ///
    /// A range running past the end of the source is cut at the end; one
    /// starting at or after the end is rejected.
    pub fn from_ranges(ranges: &[TrimRange], source_duration_us: i64) -> Result<Self, TrimError> {
        let mut effective = 0i64;
        let mut segments = Vec::with_capacity(ranges.len());
        for (index, range) in ranges.iter().enumerate() {
            if range.start_us < 0 {
                return Err(TrimError::NegativeStart { index });
            }
            if range.end_us <= range.start_us {
                return Err(TrimError::EmptySegment {
                    index,
                    start_us: range.start_us,
                    end_us: range.end_us,
                });
            }
            if range.start_us >= source_duration_us {
                return Err(TrimError::BeyondSource {
                    index,
                    end_us: range.end_us,
                    duration_us: source_duration_us,
                });
            }
            let end_us = range.end_us.min(source_duration_us);
            segments.push(TrimSegment {
                source_start_us: range.start_us,
                source_end_us: end_us,
                effective_start_us: effective,
            });
            effective = effective
                .checked_add(end_us - range.start_us)
                .ok_or(TrimError::Overflow { index })?;
        }
        Self::new(segments, source_duration_us)
    }

    /// Identity mapping over the whole source.
    pub fn identity(source_duration_us: i64) -> Self {
        let segments = if source_duration_us > 0 {
            vec![TrimSegment {
                source_start_us: 0,
                source_end_us: source_duration_us,
                effective_start_us: 0,
            }]
        } else {
            vec![]
        };
        Self {
            segments,
            trimmed: false,
        }
    }

    /// Whether any part of the source is trimmed away.
    pub fn is_trimmed(&self) -> bool {
        self.trimmed
    }

    pub fn segments(&self) -> &[TrimSegment] {
        &self.segments
    }

    /// Length of the concatenated effective timeline.
    pub fn effective_duration_us(&self) -> i64 {
        self.segments
            .last()
            .map(TrimSegment::effective_end_us)
            .unwrap_or(0)
    }

    /// Map an effective time to the source time it displays.
    pub fn effective_to_source(&self, t_us: i64) -> Result<i64, TrimError> {
        let duration_us = self.effective_duration_us();
        if t_us < 0 || t_us >= duration_us {
            return Err(TrimError::EffectiveOutOfRange { t_us, duration_us });
        }
        let idx = self
            .segments
            .partition_point(|s| s.effective_start_us <= t_us)
            - 1;
        let segment = &self.segments[idx];
        Ok(segment.source_start_us + (t_us - segment.effective_start_us))
    }

    /// Map a source time to the effective timeline; fails outside retained segments.
    pub fn source_to_effective(&self, t_us: i64) -> Result<i64, TrimError> {
        self.segment_for_source(t_us)
            .map(|segment| segment.effective_start_us + (t_us - segment.source_start_us))
            .ok_or(TrimError::NotRetained { t_us })
    }

    /// Whether a source time is kept by the trim.
    pub fn contains_source(&self, t_us: i64) -> bool {
        self.segment_for_source(t_us).is_some()
    }

    /// The first retained segment starting strictly after `t_us`.
    pub fn next_segment_after(&self, t_us: i64) -> Option<&TrimSegment> {
        let idx = self.segments.partition_point(|s| s.source_start_us <= t_us);
        self.segments.get(idx)
    }

    fn segment_for_source(&self, t_us: i64) -> Option<&TrimSegment> {
        let idx = self.segments.partition_point(|s| s.source_start_us <= t_us);
        if idx == 0 {
            return None;
        }
        let segment = &self.segments[idx - 1];
        segment.contains_source(t_us).then_some(segment)
    }
}
