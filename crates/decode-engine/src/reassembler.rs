//! Restores presentation order for frames decoded out of order.

use std::collections::HashMap;

use crate::frame::DecodedFrame;

enum Slot {
    Frame(DecodedFrame),
    /// The chunk at this index produced no picture.
    Skipped,
}

/// Index-keyed reorder buffer.
///
/// Frames are released in ascending presentation index. Anything arriving
/// for an index that has already been emitted is dropped on the spot.
pub struct FrameReassembler {
    next_index: u64,
    pending: HashMap<u64, Slot>,
}

impl FrameReassembler {
    pub fn new(next_index: u64) -> Self {
        Self {
            next_index,
            pending: HashMap::new(),
        }
    }

    /// Index the next emitted frame must carry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Frames currently held back.
    pub fn len(&self) -> usize {
        self.pending
            .values()
            .filter(|slot| matches!(slot, Slot::Frame(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accept a frame; returns every frame that became emittable.
    pub fn push(&mut self, index: u64, frame: DecodedFrame) -> Vec<DecodedFrame> {
        if index < self.next_index {
            return vec![];
        }
        self.pending.insert(index, Slot::Frame(frame));
        self.collect_ready()
    }

    /// Record that `index` will never produce a frame.
    pub fn skip(&mut self, index: u64) -> Vec<DecodedFrame> {
        if index < self.next_index {
            return vec![];
        }
        self.pending.insert(index, Slot::Skipped);
        self.collect_ready()
    }

    /// Give up on every index below `index`.
    ///
    /// Used by serial decoders, which emit in presentation order: a picture at
    /// `index` means nothing below it is still coming.
    pub fn skip_below(&mut self, index: u64) -> Vec<DecodedFrame> {
        if index <= self.next_index {
            return vec![];
        }
        self.pending.retain(|&i, _| i >= index);
        self.next_index = index;
        self.collect_ready()
    }

    /// Emit everything still held, in ascending order, regardless of gaps.
    pub fn drain(&mut self) -> Vec<DecodedFrame> {
        let mut indices: Vec<u64> = self.pending.keys().copied().collect();
        indices.sort_unstable();
        if let Some(&last) = indices.last() {
            self.next_index = last + 1;
        }
        indices
            .into_iter()
            .filter_map(|i| match self.pending.remove(&i) {
                Some(Slot::Frame(frame)) => Some(frame),
                _ => None,
            })
            .collect()
    }

    /// Release held frames and restart at `next_index`.
    pub fn reset(&mut self, next_index: u64) {
        self.pending.clear();
        self.next_index = next_index;
    }

    fn collect_ready(&mut self) -> Vec<DecodedFrame> {
        let mut ready = Vec::new();
        while let Some(slot) = self.pending.remove(&self.next_index) {
            self.next_index += 1;
            if let Slot::Frame(frame) = slot {
                ready.push(frame);
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::frame::FramePool;

    fn frame(pool: &FramePool, ts: i64) -> DecodedFrame {
        pool.lease(1, 1, ts, 0)
    }

    fn timestamps(frames: &[DecodedFrame]) -> Vec<i64> {
        frames.iter().map(|f| f.source_timestamp_us()).collect()
    }

    #[test]
    fn test_out_of_order_frames_emit_in_order() {
        let pool = FramePool::new();
        let mut r = FrameReassembler::new(0);

        assert!(r.push(2, frame(&pool, 20)).is_empty());
        assert!(r.push(1, frame(&pool, 10)).is_empty());
        assert_eq!(r.len(), 2);

        let ready = r.push(0, frame(&pool, 0));
        assert_eq!(timestamps(&ready), vec![0, 10, 20]);
        assert_eq!(r.next_index(), 3);
        assert!(r.is_empty());
    }

    #[test]
    fn test_skipped_index_unblocks_successors() {
        let pool = FramePool::new();
        let mut r = FrameReassembler::new(0);
        assert!(r.push(1, frame(&pool, 10)).is_empty());
        let ready = r.skip(0);
        assert_eq!(timestamps(&ready), vec![10]);
    }

    #[test]
    fn test_stale_frames_are_released() {
        let pool = FramePool::new();
        let mut r = FrameReassembler::new(5);
        assert!(r.push(3, frame(&pool, 30)).is_empty());
        assert_eq!(pool.live_frames(), 0);
    }

    #[test]
    fn test_skip_below_discards_gaps() {
        let pool = FramePool::new();
        let mut r = FrameReassembler::new(0);
        let ready = r.skip_below(4);
        assert!(ready.is_empty());
        let ready = r.push(4, frame(&pool, 40));
        assert_eq!(timestamps(&ready), vec![40]);
    }

    #[test]
    fn test_drain_emits_remaining_in_order() {
        let pool = FramePool::new();
        let mut r = FrameReassembler::new(0);
        r.push(7, frame(&pool, 70));
        r.push(3, frame(&pool, 30));
        r.skip(5);
        let drained = r.drain();
        assert_eq!(timestamps(&drained), vec![30, 70]);
        assert_eq!(r.next_index(), 8);
    }

    #[test]
    fn test_reset_releases_frames() {
        let pool = FramePool::new();
        let mut r = FrameReassembler::new(0);
        r.push(2, frame(&pool, 20));
        r.push(4, frame(&pool, 40));
        r.reset(10);
        assert_eq!(pool.live_frames(), 0);
        assert_eq!(r.next_index(), 10);
    }

    proptest! {
        #[test]
        fn prop_any_completion_order_emits_in_presentation_order(
            order in Just((0u64..24).collect::<Vec<_>>()).prop_shuffle(),
            skipped in proptest::collection::hash_set(0u64..24, 0..6),
        ) {
            let pool = FramePool::new();
            let mut r = FrameReassembler::new(0);
            let mut emitted = Vec::new();
            for &index in &order {
                let ready = if skipped.contains(&index) {
                    r.skip(index)
                } else {
                    r.push(index, frame(&pool, index as i64 * 10))
                };
                emitted.extend(timestamps(&ready));
            }

            let expected: Vec<i64> = (0u64..24)
                .filter(|i| !skipped.contains(i))
                .map(|i| i as i64 * 10)
                .collect();
            prop_assert_eq!(emitted, expected);
            prop_assert!(r.is_empty());
            prop_assert_eq!(r.next_index(), 24);
        }
    }
}
