//! QuickTime uncompressed video (`raw `): packed RGB24 or ARGB32 rows.

use recast_common::error::{RecastError, RecastResult};

use super::{DecodedPicture, DecoderBackend, FrameDecoder};
use crate::frame::FramePool;
use crate::track::{CodecConfig, EncodedChunk};

#[derive(Debug, Clone, Copy, Default)]
pub struct RawBackend;

impl DecoderBackend for RawBackend {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn supports(&self, config: &CodecConfig) -> bool {
        config.codec == "raw " && matches!(config.depth, 24 | 32)
    }

    fn intra_only(&self) -> bool {
        true
    }

    fn create(&self, config: &CodecConfig) -> RecastResult<Box<dyn FrameDecoder>> {
        if !self.supports(config) {
            return Err(RecastError::unsupported(format!(
                "raw decoder cannot handle {} at {}-bit",
                config.codec, config.depth
            )));
        }
        if config.coded_width == 0 || config.coded_height == 0 {
            return Err(RecastError::decode("raw video with zero dimensions"));
        }
        Ok(Box::new(RawDecoder {
            width: config.coded_width,
            height: config.coded_height,
            bytes_per_pixel: (config.depth / 8) as usize,
        }))
    }
}

struct RawDecoder {
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
}

impl FrameDecoder for RawDecoder {
    fn decode(
        &mut self,
        chunk: &EncodedChunk,
        pool: &FramePool,
    ) -> RecastResult<Option<DecodedPicture>> {
        let row_len = self.width as usize * self.bytes_per_pixel;
        let stride = chunk.data.len() / self.height as usize;
        if stride < row_len {
            return Err(RecastError::decode(format!(
                "raw sample {} is {} bytes, need at least {} for {}x{}",
                chunk.decode_index,
                chunk.data.len(),
                row_len * self.height as usize,
                self.width,
                self.height
            )));
        }

        let mut frame = pool.lease(
            self.width,
            self.height,
            chunk.timestamp_us,
            chunk.duration_us,
        );
        let out: &mut [u8] = frame.image_mut();
        for (y, row) in chunk.data.chunks(stride).take(self.height as usize).enumerate() {
            let dst = &mut out[y * self.width as usize * 4..(y + 1) * self.width as usize * 4];
            let src = &row[..row_len];
            if self.bytes_per_pixel == 3 {
                for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
                    d.copy_from_slice(&[s[0], s[1], s[2], 255]);
                }
            } else {
                // ARGB → RGBA
                for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                    d.copy_from_slice(&[s[1], s[2], s[3], s[0]]);
                }
            }
        }

        Ok(Some(DecodedPicture {
            presentation_index: chunk.presentation_index,
            frame,
        }))
    }

    fn reset(&mut self) -> RecastResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn config(depth: u16) -> CodecConfig {
        CodecConfig {
            codec: "raw ".into(),
            coded_width: 2,
            coded_height: 1,
            depth,
            description: None,
        }
    }

    fn chunk(data: Vec<u8>) -> EncodedChunk {
        EncodedChunk {
            timestamp_us: 40_000,
            duration_us: 40_000,
            is_keyframe: true,
            data: Bytes::from(data),
            decode_index: 1,
            presentation_index: 1,
        }
    }

    #[test]
    fn test_rgb24_expands_to_rgba() {
        let pool = FramePool::new();
        let mut decoder = RawBackend.create(&config(24)).unwrap();
        let picture = decoder
            .decode(&chunk(vec![1, 2, 3, 4, 5, 6]), &pool)
            .unwrap()
            .unwrap();
        assert_eq!(picture.presentation_index, 1);
        assert_eq!(picture.frame.source_timestamp_us(), 40_000);
        assert_eq!(picture.frame.image().as_raw(), &vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn test_argb32_reorders_alpha() {
        let pool = FramePool::new();
        let mut decoder = RawBackend.create(&config(32)).unwrap();
        let picture = decoder
            .decode(&chunk(vec![9, 1, 2, 3, 8, 4, 5, 6]), &pool)
            .unwrap()
            .unwrap();
        assert_eq!(picture.frame.image().as_raw(), &vec![1, 2, 3, 9, 4, 5, 6, 8]);
    }

    #[test]
    fn test_padded_rows_use_stride() {
        let pool = FramePool::new();
        let mut decoder = RawBackend.create(&config(24)).unwrap();
        let picture = decoder
            .decode(&chunk(vec![1, 2, 3, 4, 5, 6, 0, 0]), &pool)
            .unwrap()
            .unwrap();
        assert_eq!(picture.frame.image().get_pixel(1, 0).0, [4, 5, 6, 255]);
    }

    #[test]
    fn test_short_sample_is_a_decode_error() {
        let pool = FramePool::new();
        let mut decoder = RawBackend.create(&config(24)).unwrap();
        assert!(decoder.decode(&chunk(vec![1, 2, 3]), &pool).is_err());
        assert_eq!(pool.live_frames(), 0);
    }

    #[test]
    fn test_rejects_other_depths() {
        assert!(RawBackend.create(&config(16)).is_err());
    }
}
