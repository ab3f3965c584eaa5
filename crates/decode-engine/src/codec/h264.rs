//! H.264 software decoding through `openh264`.
//!
//! MP4 stores length-prefixed NAL units with parameter sets out of band in
//! `avcC`. openh264 wants an Annex-B byte stream, so samples are rewritten
//! with start codes and SPS/PPS are re-injected in front of every keyframe.
//!
//! The decoder runs without per-call flushing so it can hold pictures back
//! for B-frame reordering; pictures leave it in display order and the rest
//! are drained by [`FrameDecoder::flush`] at end of stream.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use openh264::decoder::{DecodedYUV, Decoder, DecoderConfig, Flush};
use openh264::formats::YUVSource;
use openh264::OpenH264API;
use recast_common::error::{RecastError, RecastResult};

use super::{DecodedPicture, DecoderBackend, FrameDecoder};
use crate::frame::FramePool;
use crate::track::{CodecConfig, EncodedChunk};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Clone, Copy, Default)]
pub struct H264Backend;

impl DecoderBackend for H264Backend {
    fn name(&self) -> &'static str {
        "h264"
    }

    fn supports(&self, config: &CodecConfig) -> bool {
        matches!(config.codec.as_str(), "avc1" | "avc3")
    }

    fn intra_only(&self) -> bool {
        false
    }

    fn create(&self, config: &CodecConfig) -> RecastResult<Box<dyn FrameDecoder>> {
        let avcc = match &config.description {
            Some(description) => AvcConfig::parse(description)?,
            None if config.codec == "avc3" => AvcConfig::in_band(),
            None => return Err(RecastError::decode("avc1 track without avcC")),
        };
        Ok(Box::new(H264Decoder {
            decoder: new_decoder()?,
            avcc,
            pending: PendingPictures::default(),
            annex_b: Vec::new(),
            rgba: Vec::new(),
        }))
    }
}

fn new_decoder() -> RecastResult<Decoder> {
    let config = DecoderConfig::new().flush_after_decode(Flush::NoFlush);
    Decoder::with_api_config(OpenH264API::from_source(), config)
        .map_err(|e| RecastError::decode(format!("openh264 init failed: {e}")))
}

/// Chunks submitted to the decoder that have not produced a picture yet.
///
/// Pictures come out in display order, so each one belongs to the pending
/// chunk with the smallest presentation time.
#[derive(Debug, Default)]
struct PendingPictures {
    heap: BinaryHeap<Reverse<(i64, u64, i64)>>,
}

impl PendingPictures {
    fn push(&mut self, chunk: &EncodedChunk) {
        self.heap.push(Reverse((
            chunk.timestamp_us,
            chunk.presentation_index,
            chunk.duration_us,
        )));
    }

    /// `(timestamp_us, presentation_index, duration_us)` of the next picture.
    fn next(&mut self) -> Option<(i64, u64, i64)> {
        self.heap.pop().map(|Reverse(entry)| entry)
    }

    fn clear(&mut self) {
        self.heap.clear();
    }
}

/// Convert a decoded picture and tag it with the pending chunk it belongs to.
fn take_picture(
    yuv: &DecodedYUV<'_>,
    pending: &mut PendingPictures,
    rgba: &mut Vec<u8>,
    pool: &FramePool,
) -> Option<DecodedPicture> {
    let (pts, presentation_index, duration) = pending.next()?;
    let (width, height) = yuv.dimensions();
    rgba.clear();
    rgba.resize(width * height * 4, 0);
    yuv.write_rgba8(rgba);

    let mut frame = pool.lease(width as u32, height as u32, pts, duration);
    frame.image_mut().copy_from_slice(rgba);
    Some(DecodedPicture {
        presentation_index,
        frame,
    })
}

/// Parsed `AVCDecoderConfigurationRecord`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    pub nal_length_size: usize,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

impl AvcConfig {
    /// Parameters carried in-band (`avc3` without `avcC`).
    pub fn in_band() -> Self {
        Self {
            nal_length_size: 4,
            sps: vec![],
            pps: vec![],
        }
    }

    pub fn parse(data: &[u8]) -> RecastResult<Self> {
        let invalid = || RecastError::decode("truncated avcC record");
        if data.len() < 6 || data[0] != 1 {
            return Err(RecastError::decode("unsupported avcC version"));
        }
        let nal_length_size = (data[4] & 0x03) as usize + 1;

        let mut pos = 5;
        let read_sets = |count: usize, pos: &mut usize| -> RecastResult<Vec<Vec<u8>>> {
            let mut sets = Vec::with_capacity(count);
            for _ in 0..count {
                let len_bytes = data.get(*pos..*pos + 2).ok_or_else(invalid)?;
                let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                *pos += 2;
                let set = data.get(*pos..*pos + len).ok_or_else(invalid)?;
                sets.push(set.to_vec());
                *pos += len;
            }
            Ok(sets)
        };

        let sps_count = (data[5] & 0x1f) as usize;
        pos += 1;
        let sps = read_sets(sps_count, &mut pos)?;
        let pps_count = *data.get(pos).ok_or_else(invalid)? as usize;
        pos += 1;
        let pps = read_sets(pps_count, &mut pos)?;

        Ok(Self {
            nal_length_size,
            sps,
            pps,
        })
    }

    /// Rewrite a length-prefixed sample as Annex-B into `out`.
    pub fn to_annex_b(&self, sample: &[u8], keyframe: bool, out: &mut Vec<u8>) -> RecastResult<()> {
        out.clear();
        if keyframe {
            for set in self.sps.iter().chain(&self.pps) {
                out.extend_from_slice(&START_CODE);
                out.extend_from_slice(set);
            }
        }

        let n = self.nal_length_size;
        let mut pos = 0usize;
        while pos + n <= sample.len() {
            let len = sample[pos..pos + n]
                .iter()
                .fold(0usize, |acc, &b| (acc << 8) | b as usize);
            pos += n;
            let nal = sample
                .get(pos..pos + len)
                .ok_or_else(|| RecastError::decode("NAL unit overruns sample"))?;
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(nal);
            pos += len;
        }
        if pos != sample.len() {
            return Err(RecastError::decode("trailing bytes after last NAL unit"));
        }
        Ok(())
    }
}

struct H264Decoder {
    decoder: Decoder,
    avcc: AvcConfig,
    pending: PendingPictures,
    annex_b: Vec<u8>,
    rgba: Vec<u8>,
}

impl FrameDecoder for H264Decoder {
    fn decode(
        &mut self,
        chunk: &EncodedChunk,
        pool: &FramePool,
    ) -> RecastResult<Option<DecodedPicture>> {
        self.avcc
            .to_annex_b(&chunk.data, chunk.is_keyframe, &mut self.annex_b)?;
        self.pending.push(chunk);

        let decoded = self.decoder.decode(&self.annex_b).map_err(|e| {
            RecastError::decode(format!(
                "openh264 failed on sample {}: {e}",
                chunk.decode_index
            ))
        })?;
        Ok(decoded.and_then(|yuv| take_picture(&yuv, &mut self.pending, &mut self.rgba, pool)))
    }

    fn flush(&mut self, pool: &FramePool) -> RecastResult<Vec<DecodedPicture>> {
        let remaining = self
            .decoder
            .flush_remaining()
            .map_err(|e| RecastError::decode(format!("openh264 flush failed: {e}")))?;
        let pictures = remaining
            .iter()
            .filter_map(|yuv| take_picture(yuv, &mut self.pending, &mut self.rgba, pool))
            .collect();
        // Chunks left over produced no picture.
        self.pending.clear();
        Ok(pictures)
    }

    fn reset(&mut self) -> RecastResult<()> {
        self.pending.clear();
        self.decoder = new_decoder()?;
        Ok(())
    }
}
