//! Decoder backends.
//!
//! A [`DecoderBackend`] describes a codec implementation and creates
//! [`FrameDecoder`] instances. Decoders are created on, and never leave, the
//! worker thread that drives them, so they need not be `Send`.

use std::sync::Arc;

use recast_common::error::RecastResult;

use crate::frame::{DecodedFrame, FramePool};
use crate::track::{CodecConfig, EncodedChunk};

pub mod h264;
pub mod raw;

pub use h264::H264Backend;
pub use raw::RawBackend;

/// A decoded picture tagged with its presentation index.
#[derive(Debug)]
pub struct DecodedPicture {
    pub presentation_index: u64,
    pub frame: DecodedFrame,
}

/// Stateful decoder instance.
pub trait FrameDecoder {
    /// Decode one chunk. Returns `None` when the chunk produced no picture yet.
    fn decode(
        &mut self,
        chunk: &EncodedChunk,
        pool: &FramePool,
    ) -> RecastResult<Option<DecodedPicture>>;

    /// Emit pictures still held for reordering, in presentation order.
    /// Called once the last chunk of a stream has been decoded.
    fn flush(&mut self, _pool: &FramePool) -> RecastResult<Vec<DecodedPicture>> {
        Ok(Vec::new())
    }

    /// Drop reference state ahead of a discontinuity.
    fn reset(&mut self) -> RecastResult<()>;
}

/// Factory for decoders of one codec family.
pub trait DecoderBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, config: &CodecConfig) -> bool;

    /// Whether every chunk decodes independently, so chunks may be spread
    /// across worker threads.
    fn intra_only(&self) -> bool;

    fn create(&self, config: &CodecConfig) -> RecastResult<Box<dyn FrameDecoder>>;
}

/// Ordered list of available backends.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    backends: Vec<Arc<dyn DecoderBackend>>,
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in software backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(RawBackend));
        registry.register(Arc::new(H264Backend));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn DecoderBackend>) {
        self.backends.push(backend);
    }

    /// First backend that supports `config`.
    pub fn probe(&self, config: &CodecConfig) -> Option<Arc<dyn DecoderBackend>> {
        self.backends
            .iter()
            .find(|backend| backend.supports(config))
            .cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(codec: &str) -> CodecConfig {
        CodecConfig {
            codec: codec.to_string(),
            coded_width: 2,
            coded_height: 2,
            depth: 24,
            description: None,
        }
    }

    #[test]
    fn test_default_registry_probes_by_codec() {
        let registry = DecoderRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["raw", "h264"]);
        assert_eq!(registry.probe(&config("raw ")).unwrap().name(), "raw");
        assert_eq!(registry.probe(&config("avc3")).unwrap().name(), "h264");
        assert!(registry.probe(&config("hvc1")).is_none());
    }

    #[test]
    fn test_empty_registry_supports_nothing() {
        assert!(DecoderRegistry::empty().probe(&config("raw ")).is_none());
    }
}
