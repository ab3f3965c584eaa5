//! Decoder service: bounded, multi-worker decoding with ordered output.
//!
//! Chunks are submitted by a producer and decoded on dedicated worker
//! threads. Intra-only codecs fan out across several workers and may finish
//! out of order; a [`FrameReassembler`] restores presentation order before
//! frames reach the [`DecodedFrames`] consumer.
//!
//! Occupancy is the sum of chunks in flight, frames held for reordering and
//! frames delivered but not yet received. Producers suspend in
//! [`DecoderGate::wait_for_space`] while occupancy is at `max_queue_size`;
//! receiving a frame frees capacity. A flush hands every delivered frame off
//! to the consumer, so those frames stop counting against capacity.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use recast_common::clock::RunningAverage;
use recast_common::config::PipelineConfig;
use recast_common::error::{RecastError, RecastResult};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::codec::{DecodedPicture, DecoderBackend, DecoderRegistry};
use crate::frame::{DecodedFrame, FramePool};
use crate::reassembler::FrameReassembler;
use crate::track::{CodecConfig, EncodedChunk};

/// Decoder service tuning.
#[derive(Debug, Clone)]
pub struct DecoderOptions {
    pub max_queue_size: usize,
    /// Worker threads for intra-only codecs.
    pub workers: usize,
    /// Log every decoded chunk.
    pub debug: bool,
    pub hardware_threshold_ms: f64,
    pub hardware_min_samples: u64,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl DecoderOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_queue_size: config.decoder_queue_size.max(1),
            workers: config.decoder_workers.max(1),
            debug: config.debug,
            hardware_threshold_ms: config.hardware_decode_threshold_ms,
            hardware_min_samples: config.hardware_decode_min_samples,
        }
    }
}

/// Item received from [`DecodedFrames`].
#[derive(Debug)]
pub enum DecoderOutput {
    Frame(DecodedFrame),
    /// Every chunk submitted before the flush has been emitted.
    Flushed { generation: u64 },
}

/// Decoder telemetry snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderStats {
    pub backend: &'static str,
    pub workers: usize,
    pub frames_decoded: u64,
    pub average_decode_ms: f64,
    /// Average decode time stayed under the configured threshold.
    pub hardware_accelerated: bool,
    pub occupancy: usize,
    pub peak_occupancy: usize,
}

#[derive(Debug, Clone)]
enum Failure {
    Decode(String),
    Demux(String),
    Cancelled,
}

impl Failure {
    fn from_error(err: &RecastError) -> Self {
        match err {
            RecastError::Decode { message } => Self::Decode(message.clone()),
            RecastError::Demux { message } => Self::Demux(message.clone()),
            RecastError::Cancelled => Self::Cancelled,
            other => Self::Decode(other.to_string()),
        }
    }

    fn to_error(&self) -> RecastError {
        match self {
            Self::Decode(message) => RecastError::decode(message.clone()),
            Self::Demux(message) => RecastError::demux(message.clone()),
            Self::Cancelled => RecastError::Cancelled,
        }
    }
}

enum Job {
    Decode { generation: u64, chunk: EncodedChunk },
    Reset,
    Flush {
        generation: u64,
        ack: oneshot::Sender<()>,
    },
}

enum Delivery {
    Frame { generation: u64, frame: DecodedFrame },
    Flushed { generation: u64 },
    Failed,
}

struct State {
    generation: u64,
    in_flight: usize,
    /// Delivered frames of the current generation not yet received.
    in_channel: usize,
    /// Frames handed off by a flush, still ahead of `in_channel` in the
    /// output channel.
    handed_off: usize,
    reassembler: FrameReassembler,
    failure: Option<Failure>,
    peak: usize,
    decode_times: RunningAverage,
    output: Option<mpsc::UnboundedSender<Delivery>>,
}

impl State {
    fn occupancy(&self) -> usize {
        self.in_flight + self.reassembler.len() + self.in_channel
    }

    fn track_peak(&mut self) {
        self.peak = self.peak.max(self.occupancy());
    }

    fn deliver(&mut self, generation: u64, frames: Vec<DecodedFrame>) {
        for frame in frames {
            if let Some(output) = &self.output {
                if output.send(Delivery::Frame { generation, frame }).is_ok() {
                    self.in_channel += 1;
                }
            }
        }
    }

    fn place(&mut self, generation: u64, serial: bool, picture: DecodedPicture) {
        let mut ready = if serial {
            self.reassembler.skip_below(picture.presentation_index)
        } else {
            Vec::new()
        };
        ready.extend(self.reassembler.push(picture.presentation_index, picture.frame));
        self.deliver(generation, ready);
    }

    fn fail(&mut self, failure: Failure) {
        if self.failure.is_some() {
            return;
        }
        self.failure = Some(failure);
        let next = self.reassembler.next_index();
        self.reassembler.reset(next);
        if let Some(output) = &self.output {
            let _ = output.send(Delivery::Failed);
        }
    }
}

struct Shared {
    state: Mutex<State>,
    space: Notify,
    backend: &'static str,
    workers: usize,
    serial: bool,
    options: DecoderOptions,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn can_accept_chunk(&self) -> bool {
        let state = self.lock();
        state.failure.is_none()
            && state.output.is_some()
            && state.occupancy() < self.options.max_queue_size
    }

    async fn wait_for_space(&self, cancel: &CancellationToken) -> RecastResult<()> {
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock();
                if let Some(failure) = &state.failure {
                    return Err(failure.to_error());
                }
                if state.output.is_none() {
                    return Err(RecastError::decode("decoder is closed"));
                }
                if state.occupancy() < self.options.max_queue_size {
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(RecastError::Cancelled),
            }
        }
    }

    fn complete(
        &self,
        generation: u64,
        presentation_index: u64,
        result: RecastResult<Option<DecodedPicture>>,
        elapsed: Duration,
    ) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if generation == state.generation && state.failure.is_none() {
                match result {
                    Ok(Some(picture)) => {
                        state.decode_times.record(elapsed);
                        if self.options.debug {
                            tracing::debug!(
                                index = picture.presentation_index,
                                timestamp_us = picture.frame.source_timestamp_us(),
                                decode_ms = elapsed.as_secs_f64() * 1_000.0,
                                "Decoded chunk"
                            );
                        }
                        state.place(generation, self.serial, picture);
                    }
                    Ok(None) => {
                        if !self.serial {
                            let ready = state.reassembler.skip(presentation_index);
                            state.deliver(generation, ready);
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            index = presentation_index,
                            error = %e,
                            "Decode failed"
                        );
                        state.fail(Failure::from_error(&e));
                    }
                }
                state.track_peak();
            }
        }
        self.space.notify_waiters();
    }

    /// Pictures a decoder released while flushing.
    fn complete_flush(&self, generation: u64, result: RecastResult<Vec<DecodedPicture>>) {
        {
            let mut state = self.lock();
            if generation == state.generation && state.failure.is_none() {
                match result {
                    Ok(pictures) => {
                        for picture in pictures {
                            state.place(generation, self.serial, picture);
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Decoder flush failed");
                        state.fail(Failure::from_error(&e));
                    }
                }
                state.track_peak();
            }
        }
        self.space.notify_waiters();
    }

    fn consume(&self, generation: u64) -> bool {
        let current = {
            let mut state = self.lock();
            let current = state.generation == generation;
            if current {
                // The channel is FIFO: handed-off frames are received first.
                if state.handed_off > 0 {
                    state.handed_off -= 1;
                } else {
                    state.in_channel = state.in_channel.saturating_sub(1);
                }
            }
            current
        };
        self.space.notify_waiters();
        current
    }

    fn fail(&self, failure: Failure) {
        self.lock().fail(failure);
        self.space.notify_waiters();
    }

    fn failure_error(&self) -> RecastError {
        self.lock()
            .failure
            .as_ref()
            .map(Failure::to_error)
            .unwrap_or_else(|| RecastError::decode("decoder failed"))
    }

    fn stats(&self) -> DecoderStats {
        let state = self.lock();
        let frames_decoded = state.decode_times.count();
        let average_decode_ms = state.decode_times.mean_ms();
        DecoderStats {
            backend: self.backend,
            workers: self.workers,
            frames_decoded,
            average_decode_ms,
            hardware_accelerated: frames_decoded > self.options.hardware_min_samples
                && average_decode_ms < self.options.hardware_threshold_ms,
            occupancy: state.occupancy(),
            peak_occupancy: state.peak,
        }
    }
}

/// Cloneable handle for backpressure checks and telemetry.
#[derive(Clone)]
pub struct DecoderGate {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl DecoderGate {
    /// Whether a chunk could be submitted without exceeding capacity.
    pub fn can_accept_chunk(&self) -> bool {
        self.shared.can_accept_chunk()
    }

    /// Suspend until occupancy drops below capacity.
    ///
    /// Fails with the decoder's error once it has failed, or with
    /// `Cancelled` when the job is cancelled.
    pub async fn wait_for_space(&self) -> RecastResult<()> {
        self.shared.wait_for_space(&self.cancel).await
    }

    pub fn stats(&self) -> DecoderStats {
        self.shared.stats()
    }
}

/// Producer half of the decoder.
pub struct VideoDecoderService {
    shared: Arc<Shared>,
    workers: Vec<std_mpsc::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    next_worker: usize,
    cancel: CancellationToken,
    closed: bool,
}

impl VideoDecoderService {
    /// Start workers for `codec`.
    ///
    /// Fails when no backend in `registry` supports the codec or a worker
    /// cannot construct its decoder.
    pub fn configure(
        codec: &CodecConfig,
        options: DecoderOptions,
        registry: &DecoderRegistry,
        pool: FramePool,
        cancel: CancellationToken,
    ) -> RecastResult<(Self, DecodedFrames)> {
        let backend = registry.probe(codec).ok_or_else(|| {
            RecastError::unsupported(format!("no decoder backend for codec '{}'", codec.codec))
        })?;
        let serial = !backend.intra_only();
        let worker_count = if serial { 1 } else { options.workers.max(1) };
        let max_queue_size = options.max_queue_size;

        let (output, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                generation: 0,
                in_flight: 0,
                in_channel: 0,
                handed_off: 0,
                reassembler: FrameReassembler::new(0),
                failure: None,
                peak: 0,
                decode_times: RunningAverage::default(),
                output: Some(output),
            }),
            space: Notify::new(),
            backend: backend.name(),
            workers: worker_count,
            serial,
            options,
        });

        let mut service = Self {
            shared: shared.clone(),
            workers: Vec::with_capacity(worker_count),
            handles: Vec::with_capacity(worker_count),
            next_worker: 0,
            cancel: cancel.clone(),
            closed: false,
        };

        let (ready_tx, ready_rx) = std_mpsc::channel();
        for worker in 0..worker_count {
            let (job_tx, job_rx) = std_mpsc::channel();
            let backend = backend.clone();
            let codec = codec.clone();
            let shared = shared.clone();
            let pool = pool.clone();
            let ready = ready_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("recast-decode-{worker}"))
                .spawn(move || run_worker(backend, codec, shared, pool, job_rx, ready))?;
            service.workers.push(job_tx);
            service.handles.push(handle);
        }
        drop(ready_tx);

        for _ in 0..worker_count {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(RecastError::decode("decoder worker exited during startup")),
            }
        }

        tracing::info!(
            backend = backend.name(),
            codec = %codec.codec,
            workers = worker_count,
            max_queue_size,
            "Decoder configured"
        );

        let frames = DecodedFrames {
            rx,
            shared,
            cancel,
        };
        Ok((service, frames))
    }

    pub fn gate(&self) -> DecoderGate {
        DecoderGate {
            shared: self.shared.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn can_accept_chunk(&self) -> bool {
        self.shared.can_accept_chunk()
    }

    pub async fn wait_for_space(&self) -> RecastResult<()> {
        self.shared.wait_for_space(&self.cancel).await
    }

    /// Current generation; bumped by every [`reset`](Self::reset).
    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// Hand a chunk to a worker without waiting for capacity.
    pub fn submit(&mut self, chunk: EncodedChunk) -> RecastResult<()> {
        let generation = {
            let mut state = self.shared.lock();
            if let Some(failure) = &state.failure {
                return Err(failure.to_error());
            }
            if self.closed || state.output.is_none() {
                return Err(RecastError::decode("decoder is closed"));
            }
            state.in_flight += 1;
            state.track_peak();
            state.generation
        };

        let worker = if self.shared.serial {
            0
        } else {
            let w = self.next_worker % self.workers.len();
            self.next_worker = self.next_worker.wrapping_add(1);
            w
        };
        if self.workers[worker]
            .send(Job::Decode { generation, chunk })
            .is_err()
        {
            {
                let mut state = self.shared.lock();
                state.in_flight = state.in_flight.saturating_sub(1);
            }
            self.shared
                .fail(Failure::Decode("decoder worker exited".to_string()));
            return Err(self.shared.failure_error());
        }
        Ok(())
    }

    /// Wait for capacity, then submit.
    pub async fn decode(&mut self, chunk: EncodedChunk) -> RecastResult<()> {
        self.wait_for_space().await?;
        self.submit(chunk)
    }

    /// Wait for every submitted chunk, emit all buffered frames in order,
    /// then emit [`DecoderOutput::Flushed`].
    pub async fn flush(&mut self) -> RecastResult<()> {
        let generation = {
            let state = self.shared.lock();
            if let Some(failure) = &state.failure {
                return Err(failure.to_error());
            }
            state.generation
        };

        let mut acks = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let (tx, rx) = oneshot::channel();
            if worker.send(Job::Flush { generation, ack: tx }).is_ok() {
                acks.push(rx);
            }
        }
        for ack in acks {
            tokio::select! {
                result = ack => {
                    if result.is_err() {
                        return Err(self.shared.failure_error());
                    }
                }
                _ = self.cancel.cancelled() => return Err(RecastError::Cancelled),
            }
        }

        {
            let mut state = self.shared.lock();
            if let Some(failure) = &state.failure {
                return Err(failure.to_error());
            }
            if state.generation != generation {
                // Superseded by a reset while waiting.
                return Ok(());
            }
            let frames = state.reassembler.drain();
            state.deliver(generation, frames);
            state.handed_off += state.in_channel;
            state.in_channel = 0;
            if let Some(output) = &state.output {
                let _ = output.send(Delivery::Flushed { generation });
            }
        }
        self.shared.space.notify_waiters();
        Ok(())
    }

    /// Start a new generation at `next_presentation_index`.
    ///
    /// In-flight work and undelivered frames of earlier generations are
    /// discarded. Returns the new generation.
    pub fn reset(&mut self, next_presentation_index: u64) -> RecastResult<u64> {
        let generation = {
            let mut state = self.shared.lock();
            if let Some(failure) = &state.failure {
                return Err(failure.to_error());
            }
            state.generation += 1;
            state.reassembler.reset(next_presentation_index);
            state.in_channel = 0;
            state.handed_off = 0;
            state.generation
        };
        for worker in &self.workers {
            let _ = worker.send(Job::Reset);
        }
        self.shared.space.notify_waiters();
        tracing::debug!(generation, next_presentation_index, "Decoder reset");
        Ok(generation)
    }

    /// Fail the service with an upstream error (e.g. a demux failure).
    ///
    /// Suspended producers and the consumer both observe the error.
    pub fn abort(&self, err: &RecastError) {
        self.shared.fail(Failure::from_error(err));
    }

    pub fn stats(&self) -> DecoderStats {
        self.shared.stats()
    }

    /// Stop workers and release buffered frames. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.workers.clear();
        {
            let mut state = self.shared.lock();
            state.output = None;
            let next = state.reassembler.next_index();
            state.reassembler.reset(next);
        }
        self.shared.space.notify_waiters();
        // Workers exit once their job channels close; a decode in progress
        // finishes on its own and its frame is released on delivery.
        self.handles.clear();
        tracing::debug!(backend = self.shared.backend, "Decoder closed");
    }
}

impl Drop for VideoDecoderService {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer half of the decoder.
pub struct DecodedFrames {
    rx: mpsc::UnboundedReceiver<Delivery>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl DecodedFrames {
    /// Next frame or flush marker, in presentation order.
    ///
    /// Returns `Ok(None)` once the service is closed and drained. Frames of
    /// superseded generations are released and skipped.
    pub async fn recv(&mut self) -> RecastResult<Option<DecoderOutput>> {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RecastError::Cancelled),
                delivery = self.rx.recv() => delivery,
            };
            let Some(delivery) = delivery else {
                return Ok(None);
            };
            match delivery {
                Delivery::Frame { generation, frame } => {
                    if self.shared.consume(generation) {
                        return Ok(Some(DecoderOutput::Frame(frame)));
                    }
                }
                Delivery::Flushed { generation } => {
                    if self.shared.is_current(generation) {
                        return Ok(Some(DecoderOutput::Flushed { generation }));
                    }
                }
                Delivery::Failed => return Err(self.shared.failure_error()),
            }
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.shared.stats()
    }
}

fn run_worker(
    backend: Arc<dyn DecoderBackend>,
    codec: CodecConfig,
    shared: Arc<Shared>,
    pool: FramePool,
    jobs: std_mpsc::Receiver<Job>,
    ready: std_mpsc::Sender<RecastResult<()>>,
) {
    let mut decoder = match backend.create(&codec) {
        Ok(decoder) => {
            let _ = ready.send(Ok(()));
            decoder
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    drop(ready);

    while let Ok(job) = jobs.recv() {
        match job {
            Job::Decode { generation, chunk } => {
                let started = Instant::now();
                let result = if shared.is_current(generation) {
                    decoder.decode(&chunk, &pool)
                } else {
                    Ok(None)
                };
                shared.complete(generation, chunk.presentation_index, result, started.elapsed());
            }
            Job::Reset => {
                if let Err(e) = decoder.reset() {
                    shared.fail(Failure::from_error(&e));
                }
            }
            Job::Flush { generation, ack } => {
                if shared.is_current(generation) {
                    shared.complete_flush(generation, decoder.flush(&pool));
                }
                let _ = ack.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::codec::FrameDecoder;

    /// Backend decoding each chunk to a 1x1 frame after a per-index delay.
    struct ScriptedBackend {
        intra: bool,
        delay: fn(u64) -> Duration,
        fail_at: Option<u64>,
    }

    struct ScriptedDecoder {
        delay: fn(u64) -> Duration,
        fail_at: Option<u64>,
    }

    impl DecoderBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn supports(&self, config: &CodecConfig) -> bool {
            config.codec == "test"
        }

        fn intra_only(&self) -> bool {
            self.intra
        }

        fn create(&self, _config: &CodecConfig) -> RecastResult<Box<dyn FrameDecoder>> {
            Ok(Box::new(ScriptedDecoder {
                delay: self.delay,
                fail_at: self.fail_at,
            }))
        }
    }

    impl FrameDecoder for ScriptedDecoder {
        fn decode(
            &mut self,
            chunk: &EncodedChunk,
            pool: &FramePool,
        ) -> RecastResult<Option<DecodedPicture>> {
            std::thread::sleep((self.delay)(chunk.presentation_index));
            if self.fail_at == Some(chunk.presentation_index) {
                return Err(RecastError::decode("corrupt sample"));
            }
            Ok(Some(DecodedPicture {
                presentation_index: chunk.presentation_index,
                frame: pool.lease(1, 1, chunk.timestamp_us, 1_000),
            }))
        }

        fn reset(&mut self) -> RecastResult<()> {
            Ok(())
        }
    }

    /// Serial decoder that holds `depth` pictures back and releases them in
    /// presentation order, like an H.264 decoder facing B-frames.
    struct ReorderingBackend {
        depth: usize,
    }

    struct ReorderingDecoder {
        depth: usize,
        held: std::collections::BTreeMap<u64, i64>,
    }

    impl DecoderBackend for ReorderingBackend {
        fn name(&self) -> &'static str {
            "reordering"
        }

        fn supports(&self, config: &CodecConfig) -> bool {
            config.codec == "test"
        }

        fn intra_only(&self) -> bool {
            false
        }

        fn create(&self, _config: &CodecConfig) -> RecastResult<Box<dyn FrameDecoder>> {
            Ok(Box::new(ReorderingDecoder {
                depth: self.depth,
                held: Default::default(),
            }))
        }
    }

    impl ReorderingDecoder {
        fn release(&mut self, pool: &FramePool) -> Option<DecodedPicture> {
            let (index, timestamp_us) = self.held.pop_first()?;
            Some(DecodedPicture {
                presentation_index: index,
                frame: pool.lease(1, 1, timestamp_us, 1_000),
            })
        }
    }

    impl FrameDecoder for ReorderingDecoder {
        fn decode(
            &mut self,
            chunk: &EncodedChunk,
            pool: &FramePool,
        ) -> RecastResult<Option<DecodedPicture>> {
            self.held
                .insert(chunk.presentation_index, chunk.timestamp_us);
            if self.held.len() > self.depth {
                Ok(self.release(pool))
            } else {
                Ok(None)
            }
        }

        fn flush(&mut self, pool: &FramePool) -> RecastResult<Vec<DecodedPicture>> {
            Ok(std::iter::from_fn(|| self.release(pool)).collect())
        }

        fn reset(&mut self) -> RecastResult<()> {
            self.held.clear();
            Ok(())
        }
    }

    fn no_delay(_: u64) -> Duration {
        Duration::ZERO
    }

    fn early_frames_slow(index: u64) -> Duration {
        Duration::from_millis(40u64.saturating_sub(index * 10))
    }

    fn codec() -> CodecConfig {
        CodecConfig {
            codec: "test".into(),
            coded_width: 1,
            coded_height: 1,
            depth: 24,
            description: None,
        }
    }

    fn chunk(index: u64) -> EncodedChunk {
        EncodedChunk {
            timestamp_us: index as i64 * 1_000,
            duration_us: 1_000,
            is_keyframe: true,
            data: Bytes::new(),
            decode_index: index,
            presentation_index: index,
        }
    }

    fn start(
        backend: ScriptedBackend,
        max_queue_size: usize,
        pool: &FramePool,
    ) -> (VideoDecoderService, DecodedFrames) {
        let mut registry = DecoderRegistry::empty();
        registry.register(Arc::new(backend));
        let options = DecoderOptions {
            max_queue_size,
            workers: 4,
            ..DecoderOptions::default()
        };
        VideoDecoderService::configure(
            &codec(),
            options,
            &registry,
            pool.clone(),
            CancellationToken::new(),
        )
        .unwrap()
    }

    async fn next_timestamp(frames: &mut DecodedFrames) -> i64 {
        match frames.recv().await.unwrap() {
            Some(DecoderOutput::Frame(frame)) => frame.source_timestamp_us(),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parallel_workers_deliver_in_presentation_order() {
        let pool = FramePool::new();
        let (mut service, mut frames) = start(
            ScriptedBackend {
                intra: true,
                delay: early_frames_slow,
                fail_at: None,
            },
            8,
            &pool,
        );
        assert_eq!(service.stats().workers, 4);

        for i in 0..5 {
            service.decode(chunk(i)).await.unwrap();
        }
        service.flush().await.unwrap();

        for i in 0..5 {
            assert_eq!(next_timestamp(&mut frames).await, i * 1_000);
        }
        assert!(matches!(
            frames.recv().await.unwrap(),
            Some(DecoderOutput::Flushed { generation: 0 })
        ));
    }

    #[tokio::test]
    async fn test_producer_suspends_until_frame_is_consumed() {
        let pool = FramePool::new();
        let (mut service, mut frames) = start(
            ScriptedBackend {
                intra: false,
                delay: no_delay,
                fail_at: None,
            },
            2,
            &pool,
        );
        let gate = service.gate();

        service.submit(chunk(0)).unwrap();
        service.submit(chunk(1)).unwrap();
        assert!(!gate.can_accept_chunk());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), gate.wait_for_space())
                .await
                .is_err(),
            "producer must stay suspended while nothing is consumed"
        );

        assert_eq!(next_timestamp(&mut frames).await, 0);
        tokio::time::timeout(Duration::from_secs(1), gate.wait_for_space())
            .await
            .unwrap()
            .unwrap();
        assert!(gate.stats().peak_occupancy <= 2);
    }

    #[tokio::test]
    async fn test_flush_frees_capacity_for_waiting_producer() {
        let pool = FramePool::new();
        let (mut service, mut frames) = start(
            ScriptedBackend {
                intra: false,
                delay: no_delay,
                fail_at: None,
            },
            2,
            &pool,
        );
        let gate = service.gate();

        service.submit(chunk(0)).unwrap();
        service.submit(chunk(1)).unwrap();
        assert!(!gate.can_accept_chunk());
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait_for_space().await }
        });

        service.flush().await.unwrap();
        assert!(gate.can_accept_chunk());
        assert_eq!(gate.stats().occupancy, 0);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Frames submitted after the flush are counted until received.
        service.submit(chunk(2)).unwrap();
        assert_eq!(next_timestamp(&mut frames).await, 0);
        assert_eq!(next_timestamp(&mut frames).await, 1_000);
        assert!(matches!(
            frames.recv().await.unwrap(),
            Some(DecoderOutput::Flushed { generation: 0 })
        ));
        assert_eq!(gate.stats().occupancy, 1);
        assert_eq!(next_timestamp(&mut frames).await, 2_000);
        assert_eq!(gate.stats().occupancy, 0);
    }

    #[tokio::test]
    async fn test_reordering_decoder_keeps_b_frames_and_flushes_tail() {
        let pool = FramePool::new();
        let mut registry = DecoderRegistry::empty();
        registry.register(Arc::new(ReorderingBackend { depth: 2 }));
        let options = DecoderOptions {
            max_queue_size: 8,
            ..DecoderOptions::default()
        };
        let (mut service, mut frames) = VideoDecoderService::configure(
            &codec(),
            options,
            &registry,
            pool.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        // Decode order I0 P3 B1 B2 P6 B4 B5.
        for index in [0, 3, 1, 2, 6, 4, 5] {
            service.decode(chunk(index)).await.unwrap();
        }
        service.flush().await.unwrap();

        for i in 0..7 {
            assert_eq!(next_timestamp(&mut frames).await, i * 1_000);
        }
        assert!(matches!(
            frames.recv().await.unwrap(),
            Some(DecoderOutput::Flushed { generation: 0 })
        ));
        assert_eq!(service.stats().occupancy, 0);
    }

    #[tokio::test]
    async fn test_decode_failure_releases_waiters_and_consumer() {
        let pool = FramePool::new();
        let (mut service, mut frames) = start(
            ScriptedBackend {
                intra: false,
                delay: |_| Duration::from_millis(20),
                fail_at: Some(0),
            },
            1,
            &pool,
        );
        let gate = service.gate();

        service.submit(chunk(0)).unwrap();
        let waited = tokio::time::timeout(Duration::from_secs(1), gate.wait_for_space())
            .await
            .unwrap();
        assert!(matches!(waited, Err(RecastError::Decode { .. })));
        assert!(matches!(
            frames.recv().await,
            Err(RecastError::Decode { .. })
        ));
        assert!(service.submit(chunk(1)).is_err());
    }

    #[tokio::test]
    async fn test_abort_propagates_demux_error() {
        let pool = FramePool::new();
        let (service, mut frames) = start(
            ScriptedBackend {
                intra: true,
                delay: no_delay,
                fail_at: None,
            },
            4,
            &pool,
        );
        service.abort(&RecastError::demux("truncated mdat"));
        assert!(matches!(
            service.wait_for_space().await,
            Err(RecastError::Demux { .. })
        ));
        assert!(matches!(
            frames.recv().await,
            Err(RecastError::Demux { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_discards_stale_frames() {
        let pool = FramePool::new();
        let (mut service, mut frames) = start(
            ScriptedBackend {
                intra: false,
                delay: no_delay,
                fail_at: None,
            },
            16,
            &pool,
        );

        for i in 0..4 {
            service.submit(chunk(i)).unwrap();
        }
        let generation = service.reset(10).unwrap();
        assert_eq!(generation, 1);
        service.submit(chunk(10)).unwrap();
        service.submit(chunk(11)).unwrap();
        service.flush().await.unwrap();

        assert_eq!(next_timestamp(&mut frames).await, 10_000);
        assert_eq!(next_timestamp(&mut frames).await, 11_000);
        assert!(matches!(
            frames.recv().await.unwrap(),
            Some(DecoderOutput::Flushed { generation: 1 })
        ));

        service.close();
        assert!(frames.recv().await.unwrap().is_none());
        assert_eq!(pool.live_frames(), 0);
    }

    #[tokio::test]
    async fn test_fast_decoding_is_reported_as_accelerated() {
        let pool = FramePool::new();
        let (mut service, mut frames) = start(
            ScriptedBackend {
                intra: false,
                delay: no_delay,
                fail_at: None,
            },
            32,
            &pool,
        );
        for i in 0..12 {
            service.submit(chunk(i)).unwrap();
        }
        service.flush().await.unwrap();
        for _ in 0..12 {
            next_timestamp(&mut frames).await;
        }

        let stats = service.stats();
        assert_eq!(stats.frames_decoded, 12);
        assert!(stats.hardware_accelerated);
        assert_eq!(stats.occupancy, 0);
    }

    #[tokio::test]
    async fn test_cancellation_releases_waiters() {
        let pool = FramePool::new();
        let mut registry = DecoderRegistry::empty();
        registry.register(Arc::new(ScriptedBackend {
            intra: false,
            delay: no_delay,
            fail_at: None,
        }));
        let cancel = CancellationToken::new();
        let options = DecoderOptions {
            max_queue_size: 1,
            ..DecoderOptions::default()
        };
        let (mut service, _frames) =
            VideoDecoderService::configure(&codec(), options, &registry, pool, cancel.clone())
                .unwrap();

        service.submit(chunk(0)).unwrap();
        let gate = service.gate();
        let waiter = tokio::spawn(async move { gate.wait_for_space().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(RecastError::Cancelled)));
    }

    #[test]
    fn test_unsupported_codec_fails_configuration() {
        let result = VideoDecoderService::configure(
            &codec(),
            DecoderOptions::default(),
            &DecoderRegistry::with_defaults(),
            FramePool::new(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(RecastError::Unsupported { .. })));
    }
}
