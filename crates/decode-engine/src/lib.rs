//! Recast Decode Engine
//!
//! Turns a recorded media track into an ordered stream of decoded frames
//! on the effective (trimmed) timeline.
//!
//! # Frame Paths
//!
//! ```text
//! accelerated:
//!   ByteSource ── mp4 ── VideoDemuxer ── EncodedChunk ──┐
//!                              ▲                         ▼
//!                         seek / gaps        VideoDecoderService (workers)
//!                                                        │
//!                                              FrameReassembler
//!                                                        │
//!                                                  DecodedFrames ──┐
//! fallback:                                                        │
//!   ElementFactory ── 2× PlaybackElement ── PrefetchManager ───────┤
//!                                                                  ▼
//!                                                 FrameSource::next_frame
//! ```
//!
//! Frames are leased from a [`FramePool`] and returned to it when dropped.

pub mod codec;
pub mod decoder;
pub mod demux;
pub mod element;
pub mod frame;
#[cfg(feature = "gstreamer")]
pub mod gst_element;
pub mod media;
pub mod mp4;
pub mod prefetch;
pub mod reassembler;
pub mod source;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod track;

pub use codec::{DecoderBackend, DecoderRegistry, FrameDecoder};
pub use decoder::{DecodedFrames, DecoderGate, DecoderOptions, DecoderOutput, DecoderStats, VideoDecoderService};
pub use demux::VideoDemuxer;
pub use element::{DecodingElementFactory, ElementFactory, PlaybackElement};
pub use frame::{DecodedFrame, FramePool, PoolStats};
#[cfg(feature = "gstreamer")]
pub use gst_element::GstElementFactory;
pub use media::{open_media, ByteSource};
pub use prefetch::{PrefetchManager, PrefetchStats};
pub use reassembler::FrameReassembler;
pub use source::{
    AcceleratedFrameSource, FallbackFrameSource, FrameSource, FrameSourceFactory,
    FrameSourceKind, SourceProbe, SourceStats,
};
pub use track::{CodecConfig, EncodedChunk, SeekPoint, TrackMetadata};
