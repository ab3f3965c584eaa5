//! Recast Render Engine
//!
//! Drives an export job: pulls frames from the decode engine, composites
//! the camera overlay and hands frames to an encoder through a bounded
//! queue.
//!
//! # Pipeline Architecture
//!
//! ```text
//! primary.mp4 ── FrameSource ──┐
//!                              ├── CameraPipRenderer (camera.mp4)
//!                              │         │
//!                              │         ▼
//!                              └──► EncodeQueue (bounded)
//!                                        │
//!                                        ▼ pump task
//!                                   EncoderSink
//! ```

pub mod compositor;
pub mod export;
pub mod pip;
pub mod queue;
pub mod sink;

pub use export::*;
pub use pip::{CameraPipRenderer, PipStats};
pub use queue::{Bottleneck, EncodeQueue, QueueEntry, QueueStats};
pub use sink::{EncoderSink, NullSink, RawVideoSink};
