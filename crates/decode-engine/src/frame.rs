//! Decoded frames and the buffer pool they are leased from.
//!
//! A [`DecodedFrame`] owns an RGBA buffer leased from a [`FramePool`]. The
//! frame is single-owner: it is released exactly once, either explicitly via
//! [`DecodedFrame::close`] or implicitly on drop, and the pool only recycles
//! the backing storage after that release. The pool's counters make leaks
//! observable in tests and in end-of-job logging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use image::RgbaImage;

/// Free buffers kept around for reuse.
const DEFAULT_RETAINED_BUFFERS: usize = 16;

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated fresh (not recycled).
    pub allocated: u64,
    /// Total leases handed out.
    pub leased: u64,
    /// Leases returned.
    pub released: u64,
}

impl PoolStats {
    /// Frames currently alive.
    pub fn live(&self) -> u64 {
        self.leased - self.released
    }
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    retained: usize,
    allocated: AtomicU64,
    leased: AtomicU64,
    released: AtomicU64,
}

/// Shared pool of RGBA frame buffers.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePool {
    pub fn new() -> Self {
        Self::with_retained(DEFAULT_RETAINED_BUFFERS)
    }

    /// Pool keeping at most `retained` free buffers for reuse.
    pub fn with_retained(retained: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                retained,
                allocated: AtomicU64::new(0),
                leased: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Lease a `width`×`height` frame. Pixel contents are unspecified.
    pub fn lease(
        &self,
        width: u32,
        height: u32,
        source_timestamp_us: i64,
        duration_us: i64,
    ) -> DecodedFrame {
        let len = width as usize * height as usize * 4;
        let recycled = self
            .inner
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop());
        let mut buf = match recycled {
            Some(buf) => buf,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(len)
            }
        };
        buf.resize(len, 0);
        self.inner.leased.fetch_add(1, Ordering::Relaxed);

        let image =
            RgbaImage::from_raw(width, height, buf).unwrap_or_else(|| RgbaImage::new(width, height));
        DecodedFrame {
            image,
            timestamp_us: source_timestamp_us,
            source_timestamp_us,
            duration_us,
            pool: Some(self.clone()),
        }
    }

    /// Lease a frame holding a copy of `image`.
    pub fn lease_copy(
        &self,
        image: &RgbaImage,
        source_timestamp_us: i64,
        duration_us: i64,
    ) -> DecodedFrame {
        let mut frame = self.lease(
            image.width(),
            image.height(),
            source_timestamp_us,
            duration_us,
        );
        frame.image.copy_from_slice(image.as_raw());
        frame
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            leased: self.inner.leased.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
        }
    }

    /// Frames leased and not yet released.
    pub fn live_frames(&self) -> u64 {
        self.stats().live()
    }

    fn recycle(&self, buf: Vec<u8>) {
        self.inner.released.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut free) = self.inner.free.lock() {
            if free.len() < self.inner.retained {
                free.push(buf);
            }
        }
    }
}

/// One decoded picture in RGBA.
///
/// `timestamp_us` is the presentation time on whichever timeline the current
/// owner works in: source time straight out of a decoder, effective time once
/// a frame source has emitted it.
pub struct DecodedFrame {
    image: RgbaImage,
    timestamp_us: i64,
    source_timestamp_us: i64,
    duration_us: i64,
    pool: Option<FramePool>,
}

impl DecodedFrame {
    /// Wrap an image that is not backed by a pool.
    pub fn unpooled(image: RgbaImage, source_timestamp_us: i64, duration_us: i64) -> Self {
        Self {
            image,
            timestamp_us: source_timestamp_us,
            source_timestamp_us,
            duration_us,
            pool: None,
        }
    }

    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    pub fn source_timestamp_us(&self) -> i64 {
        self.source_timestamp_us
    }

    pub fn duration_us(&self) -> i64 {
        self.duration_us
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbaImage {
        &mut self.image
    }

    /// Re-stamp the frame onto another timeline.
    pub fn with_timestamp(mut self, timestamp_us: i64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// Release the frame now.
    pub fn close(self) {
        drop(self);
    }
}

impl std::fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("timestamp_us", &self.timestamp_us)
            .field("source_timestamp_us", &self.source_timestamp_us)
            .field("duration_us", &self.duration_us)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

impl Drop for DecodedFrame {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let image = std::mem::replace(&mut self.image, RgbaImage::new(0, 0));
            pool.recycle(image.into_raw());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_and_release_balance() {
        let pool = FramePool::new();
        let a = pool.lease(4, 2, 0, 33_333);
        let b = pool.lease(4, 2, 33_333, 33_333);
        assert_eq!(pool.live_frames(), 2);
        assert_eq!(a.image().as_raw().len(), 4 * 2 * 4);

        a.close();
        assert_eq!(pool.live_frames(), 1);
        drop(b);
        assert_eq!(pool.live_frames(), 0);
        assert_eq!(pool.stats().released, 2);
    }

    #[test]
    fn test_buffers_are_recycled() {
        let pool = FramePool::new();
        pool.lease(8, 8, 0, 0).close();
        pool.lease(8, 8, 0, 0).close();
        pool.lease(16, 16, 0, 0).close();

        let stats = pool.stats();
        assert_eq!(stats.leased, 3);
        assert_eq!(stats.allocated, 1);
    }

    #[test]
    fn test_retained_limit() {
        let pool = FramePool::with_retained(1);
        let a = pool.lease(2, 2, 0, 0);
        let b = pool.lease(2, 2, 0, 0);
        drop(a);
        drop(b);
        // Only one buffer survives; the next two leases need one fresh allocation.
        let _c = pool.lease(2, 2, 0, 0);
        let _d = pool.lease(2, 2, 0, 0);
        assert_eq!(pool.stats().allocated, 3);
    }

    #[test]
    fn test_restamping_keeps_source_time() {
        let pool = FramePool::new();
        let frame = pool.lease(1, 1, 5_000_000, 40_000).with_timestamp(3_000_000);
        assert_eq!(frame.timestamp_us(), 3_000_000);
        assert_eq!(frame.source_timestamp_us(), 5_000_000);
    }

    #[test]
    fn test_unpooled_frames_do_not_touch_counters() {
        let pool = FramePool::new();
        let frame = DecodedFrame::unpooled(RgbaImage::new(2, 2), 0, 0);
        drop(frame);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn test_lease_copy_duplicates_pixels() {
        let pool = FramePool::new();
        let mut image = RgbaImage::new(2, 1);
        image.put_pixel(1, 0, image::Rgba([1, 2, 3, 4]));
        let frame = pool.lease_copy(&image, 10, 20);
        assert_eq!(frame.image().get_pixel(1, 0).0, [1, 2, 3, 4]);
    }
}
