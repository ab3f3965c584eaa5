//! Double-buffered seeking over two playback elements.
//!
//! The active element serves the requested frame while the standby element
//! seeks ahead to the hinted next timestamp on a spawned task. When the next
//! request matches the hint the roles swap and no synchronous seek is
//! needed. Any other request discards the prefetch and seeks the active
//! element directly.

use std::time::Duration;

use recast_common::error::{RecastError, RecastResult};
use recast_project_model::MediaRef;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::element::{ElementFactory, PlaybackElement};
use crate::frame::{DecodedFrame, FramePool};
use crate::track::TrackMetadata;

/// Prefetch effectiveness counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PrefetchStats {
    pub hits: u64,
    pub misses: u64,
}

impl PrefetchStats {
    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        if self.requests() == 0 {
            return 0.0;
        }
        self.hits as f64 / self.requests() as f64
    }
}

type SeekTask = JoinHandle<(Box<dyn PlaybackElement>, RecastResult<()>)>;

enum Standby {
    Ready(Box<dyn PlaybackElement>),
    Seeking { target_us: i64, task: SeekTask },
    Gone,
}

/// Two playback elements with alternating roles.
pub struct PrefetchManager {
    active: Option<Box<dyn PlaybackElement>>,
    standby: Standby,
    metadata: TrackMetadata,
    seek_timeout: Duration,
    hit_target: f64,
    stats: PrefetchStats,
    cancel: CancellationToken,
}

impl PrefetchManager {
    /// Open both elements for `media`.
    pub async fn open(
        factory: &dyn ElementFactory,
        media: &MediaRef,
        seek_timeout: Duration,
        hit_target: f64,
        cancel: CancellationToken,
    ) -> RecastResult<Self> {
        let active = factory.open(media, cancel.clone()).await?;
        let mut standby = match factory.open(media, cancel.clone()).await {
            Ok(element) => element,
            Err(e) => {
                let mut active = active;
                active.close().await;
                return Err(e);
            }
        };
        if standby.metadata() != active.metadata() {
            standby.close().await;
            let mut active = active;
            active.close().await;
            return Err(RecastError::decode(
                "playback elements disagree on track metadata",
            ));
        }

        tracing::debug!(factory = factory.name(), media = %media, "Prefetch elements open");
        Ok(Self::from_elements(
            active,
            standby,
            seek_timeout,
            hit_target,
            cancel,
        ))
    }

    pub fn from_elements(
        active: Box<dyn PlaybackElement>,
        standby: Box<dyn PlaybackElement>,
        seek_timeout: Duration,
        hit_target: f64,
        cancel: CancellationToken,
    ) -> Self {
        let metadata = active.metadata().clone();
        Self {
            active: Some(active),
            standby: Standby::Ready(standby),
            metadata,
            seek_timeout,
            hit_target,
            stats: PrefetchStats::default(),
            cancel,
        }
    }

    pub fn metadata(&self) -> &TrackMetadata {
        &self.metadata
    }

    pub fn stats(&self) -> PrefetchStats {
        self.stats
    }

    /// Frame displayed at `target_us`, prefetching `next_hint_us`.
    pub async fn frame_at(
        &mut self,
        target_us: i64,
        next_hint_us: Option<i64>,
        pool: &FramePool,
    ) -> RecastResult<DecodedFrame> {
        if self.cancel.is_cancelled() {
            return Err(RecastError::Cancelled);
        }
        let target = self.normalize(target_us);

        let already_there = self
            .active
            .as_ref()
            .map(|a| a.current_time_us() == Some(target))
            .unwrap_or(false);

        if already_there {
            self.stats.hits += 1;
        } else if matches!(&self.standby, Standby::Seeking { target_us, .. } if *target_us == target)
        {
            let element = self.settle_standby().await?;
            let previous = self.active.replace(element);
            if let Some(previous) = previous {
                self.standby = Standby::Ready(previous);
            }
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
            self.discard_prefetch().await;
            let seek_timeout = self.seek_timeout;
            let cancel = self.cancel.clone();
            let active = self.active_mut()?;
            seek_with_timeout(active, target, seek_timeout, &cancel).await?;
        }

        let frame = {
            let cancel = self.cancel.clone();
            let active = self.active_mut()?;
            tokio::select! {
                frame = active.capture_frame(pool) => frame?,
                _ = cancel.cancelled() => return Err(RecastError::Cancelled),
            }
        };

        if let Some(next) = next_hint_us.map(|t| self.normalize(t)) {
            if next != target {
                self.start_prefetch(next);
            }
        }
        Ok(frame)
    }

    /// Abort pending seeks and close both elements. Idempotent.
    pub async fn abort(&mut self) {
        match std::mem::replace(&mut self.standby, Standby::Gone) {
            Standby::Seeking { task, .. } => {
                task.abort();
                if let Ok((mut element, _)) = task.await {
                    element.close().await;
                }
            }
            Standby::Ready(mut element) => element.close().await,
            Standby::Gone => {}
        }
        if let Some(mut active) = self.active.take() {
            active.close().await;
            let stats = self.stats;
            if stats.requests() > 0 {
                tracing::info!(
                    hits = stats.hits,
                    misses = stats.misses,
                    hit_rate = stats.hit_rate(),
                    "Prefetch finished"
                );
                if stats.hit_rate() < self.hit_target {
                    tracing::debug!(
                        hit_rate = stats.hit_rate(),
                        target = self.hit_target,
                        "Prefetch hit rate below target"
                    );
                }
            }
        }
    }

    fn normalize(&self, t_us: i64) -> i64 {
        self.metadata
            .frame_at_or_before(t_us)
            .or_else(|| self.metadata.first_frame_us())
            .unwrap_or(0)
    }

    fn active_mut(&mut self) -> RecastResult<&mut Box<dyn PlaybackElement>> {
        self.active
            .as_mut()
            .ok_or_else(|| RecastError::decode("prefetch manager has been aborted"))
    }

    fn start_prefetch(&mut self, target_us: i64) {
        let Standby::Ready(mut element) = std::mem::replace(&mut self.standby, Standby::Gone)
        else {
            return;
        };
        if element.current_time_us() == Some(target_us) {
            self.standby = Standby::Ready(element);
            return;
        }
        let seek_timeout = self.seek_timeout;
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let result = seek_with_timeout(&mut element, target_us, seek_timeout, &cancel).await;
            (element, result)
        });
        self.standby = Standby::Seeking { target_us, task };
    }

    /// Wait for the standby seek and take its element.
    async fn settle_standby(&mut self) -> RecastResult<Box<dyn PlaybackElement>> {
        let Standby::Seeking { task, .. } = std::mem::replace(&mut self.standby, Standby::Gone)
        else {
            return Err(RecastError::decode("no prefetch in progress"));
        };
        let (element, result) = task
            .await
            .map_err(|e| RecastError::decode(format!("prefetch task failed: {e}")))?;
        match result {
            Ok(()) => Ok(element),
            Err(e) => {
                self.standby = Standby::Ready(element);
                Err(e)
            }
        }
    }

    /// Drop a pending prefetch, keeping its element as standby.
    async fn discard_prefetch(&mut self) {
        match std::mem::replace(&mut self.standby, Standby::Gone) {
            Standby::Seeking { task, .. } => {
                if let Ok((element, _)) = task.await {
                    self.standby = Standby::Ready(element);
                }
            }
            other => self.standby = other,
        }
    }
}

async fn seek_with_timeout(
    element: &mut Box<dyn PlaybackElement>,
    target_us: i64,
    timeout: Duration,
    cancel: &CancellationToken,
) -> RecastResult<()> {
    tokio::select! {
        result = tokio::time::timeout(timeout, element.seek(target_us)) => match result {
            Ok(settled) => settled,
            Err(_) => Err(RecastError::SeekTimeout {
                target_us,
                timeout_ms: timeout.as_millis() as u64,
            }),
        },
        _ = cancel.cancelled() => Err(RecastError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use image::RgbaImage;

    use super::*;
    use crate::track::CodecConfig;

    fn metadata(frames: i64) -> TrackMetadata {
        let frame_timestamps: Vec<i64> = (0..frames).map(|i| i * 100_000).collect();
        TrackMetadata {
            codec: CodecConfig {
                codec: "test".into(),
                coded_width: 1,
                coded_height: 1,
                depth: 24,
                description: None,
            },
            width: 1,
            height: 1,
            duration_us: frames * 100_000,
            frame_rate: 10.0,
            frame_count: frames as u64,
            keyframe_timestamps: frame_timestamps.clone(),
            frame_timestamps,
        }
    }

    /// Element whose seeks take `delay` and are counted.
    struct FakeElement {
        metadata: TrackMetadata,
        current: Option<i64>,
        delay: Duration,
        seeks: Arc<AtomicU64>,
    }

    #[async_trait]
    impl PlaybackElement for FakeElement {
        fn metadata(&self) -> &TrackMetadata {
            &self.metadata
        }

        async fn seek(&mut self, source_us: i64) -> RecastResult<()> {
            self.seeks.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current = Some(source_us);
            Ok(())
        }

        fn current_time_us(&self) -> Option<i64> {
            self.current
        }

        async fn capture_frame(&mut self, pool: &FramePool) -> RecastResult<DecodedFrame> {
            let ts = self
                .current
                .ok_or_else(|| RecastError::decode("capture before seek"))?;
            Ok(pool.lease_copy(&RgbaImage::new(1, 1), ts, 100_000))
        }

        async fn close(&mut self) {}
    }

    fn manager(delay: Duration, timeout: Duration) -> (PrefetchManager, Arc<AtomicU64>) {
        let seeks = Arc::new(AtomicU64::new(0));
        let element = || -> Box<dyn PlaybackElement> {
            Box::new(FakeElement {
                metadata: metadata(20),
                current: None,
                delay,
                seeks: seeks.clone(),
            })
        };
        let manager = PrefetchManager::from_elements(
            element(),
            element(),
            timeout,
            0.9,
            CancellationToken::new(),
        );
        (manager, seeks)
    }

    #[tokio::test]
    async fn test_sequential_access_hits_prefetch() {
        let (mut manager, _) = manager(Duration::from_millis(1), Duration::from_secs(5));
        let pool = FramePool::new();

        for i in 0..20i64 {
            let next = (i < 19).then_some((i + 1) * 100_000);
            let frame = manager.frame_at(i * 100_000, next, &pool).await.unwrap();
            assert_eq!(frame.source_timestamp_us(), i * 100_000);
        }

        let stats = manager.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 19);
        assert!(stats.hit_rate() > 0.9);
        manager.abort().await;
    }

    #[tokio::test]
    async fn test_non_sequential_request_seeks_synchronously() {
        let (mut manager, _) = manager(Duration::from_millis(1), Duration::from_secs(5));
        let pool = FramePool::new();

        manager.frame_at(0, Some(100_000), &pool).await.unwrap();
        let frame = manager.frame_at(1_500_000, None, &pool).await.unwrap();
        assert_eq!(frame.source_timestamp_us(), 1_500_000);
        assert_eq!(manager.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_targets_snap_to_frame_grid() {
        let (mut manager, _) = manager(Duration::ZERO, Duration::from_secs(5));
        let pool = FramePool::new();
        let frame = manager.frame_at(250_000, None, &pool).await.unwrap();
        assert_eq!(frame.source_timestamp_us(), 200_000);
    }

    #[tokio::test]
    async fn test_slow_seek_times_out() {
        let (mut manager, _) = manager(Duration::from_millis(200), Duration::from_millis(20));
        let pool = FramePool::new();
        let err = manager.frame_at(300_000, None, &pool).await.unwrap_err();
        assert!(matches!(
            err,
            RecastError::SeekTimeout {
                target_us: 300_000,
                timeout_ms: 20
            }
        ));
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let (mut manager, _) = manager(Duration::from_millis(50), Duration::from_secs(5));
        let pool = FramePool::new();
        manager.frame_at(0, Some(100_000), &pool).await.unwrap();
        manager.abort().await;
        manager.abort().await;
        assert!(manager.frame_at(0, None, &pool).await.is_err());
    }
}
