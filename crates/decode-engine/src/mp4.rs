//! Minimal ISO-BMFF (MP4/MOV) reader.
//!
//! Only what frame extraction needs: locate `moov`, pick the first video
//! track, and expand its sample table into per-sample offsets, sizes and
//! timestamps. Sample payloads stay in the byte source until requested.

use bytes::Bytes;
use recast_common::clock::ticks_to_us;
use recast_common::error::RecastError;

use crate::media::ByteSource;
use crate::track::CodecConfig;

/// Visual sample entry fields preceding child boxes.
const VISUAL_SAMPLE_ENTRY_LEN: usize = 78;

/// Container parse failures.
#[derive(Debug, thiserror::Error)]
pub enum Mp4Error {
    #[error("truncated {0} box")]
    Truncated(&'static str),

    #[error("invalid {kind} box: {reason}")]
    Invalid { kind: String, reason: String },

    #[error("missing {0} box")]
    Missing(&'static str),

    #[error("no video track")]
    NoVideoTrack,

    #[error("video track has no samples")]
    EmptySampleTable,

    #[error("unsupported sample entry '{0}'")]
    UnsupportedSampleEntry(String),

    #[error(transparent)]
    Source(#[from] RecastError),
}

impl From<Mp4Error> for RecastError {
    fn from(err: Mp4Error) -> Self {
        match err {
            Mp4Error::Source(inner) => inner,
            other => RecastError::demux(other.to_string()),
        }
    }
}

type Mp4Result<T> = Result<T, Mp4Error>;

/// One sample of the selected track, in decode order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub offset: u64,
    pub size: u32,
    pub dts_us: i64,
    pub pts_us: i64,
    pub duration_us: i64,
    pub is_keyframe: bool,
}

/// The selected video track with its expanded sample table.
#[derive(Debug, Clone)]
pub struct VideoTrack {
    pub track_id: u32,
    pub timescale: u32,
    pub codec: CodecConfig,
    pub samples: Vec<Sample>,
}

/// Parse the container behind `source` and return its first video track.
pub fn read_video_track(source: &dyn ByteSource) -> Mp4Result<VideoTrack> {
    let moov = read_top_level_moov(source)?;
    for (kind, payload) in children(&moov, "moov")? {
        if &kind == b"trak" {
            if let Some(track) = parse_trak(payload)? {
                return Ok(track);
            }
        }
    }
    Err(Mp4Error::NoVideoTrack)
}

fn read_top_level_moov(source: &dyn ByteSource) -> Mp4Result<Bytes> {
    let file_len = source.len();
    let mut offset = 0u64;
    while offset + 8 <= file_len {
        let header = source.read_at(offset, 8)?;
        let size32 = be_u32(&header[0..4]);
        let kind = [header[4], header[5], header[6], header[7]];

        let (size, header_len) = match size32 {
            0 => (file_len - offset, 8u64),
            1 => {
                if offset + 16 > file_len {
                    return Err(Mp4Error::Truncated("top-level"));
                }
                let large = source.read_at(offset + 8, 8)?;
                (be_u64(&large), 16u64)
            }
            n => (n as u64, 8u64),
        };
        if size < header_len || offset + size > file_len {
            return Err(Mp4Error::Invalid {
                kind: fourcc(&kind),
                reason: format!("size {size} at offset {offset} exceeds file"),
            });
        }

        if &kind == b"moov" {
            let payload_len = usize::try_from(size - header_len).map_err(|_| Mp4Error::Invalid {
                kind: "moov".into(),
                reason: "too large".into(),
            })?;
            return Ok(source.read_at(offset + header_len, payload_len)?);
        }
        offset += size;
    }
    Err(Mp4Error::Missing("moov"))
}

/// Split a container payload into `(type, payload)` pairs.
fn children<'a>(data: &'a [u8], parent: &'static str) -> Mp4Result<Vec<([u8; 4], &'a [u8])>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let size32 = be_u32(&data[pos..pos + 4]) as usize;
        let kind = [data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]];
        let (size, header_len) = match size32 {
            0 => (data.len() - pos, 8),
            1 => {
                if pos + 16 > data.len() {
                    return Err(Mp4Error::Truncated(parent));
                }
                (be_u64(&data[pos + 8..pos + 16]) as usize, 16)
            }
            n => (n, 8),
        };
        if size < header_len || pos + size > data.len() {
            return Err(Mp4Error::Invalid {
                kind: fourcc(&kind),
                reason: format!("child of {parent} overruns its parent"),
            });
        }
        out.push((kind, &data[pos + header_len..pos + size]));
        pos += size;
    }
    Ok(out)
}

fn find<'a>(boxes: &[([u8; 4], &'a [u8])], kind: &[u8; 4]) -> Option<&'a [u8]> {
    boxes.iter().find(|(k, _)| k == kind).map(|(_, p)| *p)
}

fn require<'a>(
    boxes: &[([u8; 4], &'a [u8])],
    kind: &[u8; 4],
    name: &'static str,
) -> Mp4Result<&'a [u8]> {
    find(boxes, kind).ok_or(Mp4Error::Missing(name))
}

fn parse_trak(trak: &[u8]) -> Mp4Result<Option<VideoTrack>> {
    let boxes = children(trak, "trak")?;
    let mdia = children(require(&boxes, b"mdia", "mdia")?, "mdia")?;

    let hdlr = require(&mdia, b"hdlr", "hdlr")?;
    let mut r = Reader::new(hdlr, "hdlr");
    r.skip(8)?;
    if r.bytes(4)? != b"vide" {
        return Ok(None);
    }

    let track_id = match find(&boxes, b"tkhd") {
        Some(tkhd) => {
            let mut r = Reader::new(tkhd, "tkhd");
            let version = r.u8()?;
            r.skip(3)?;
            r.skip(if version == 1 { 16 } else { 8 })?;
            r.u32()?
        }
        None => 0,
    };

    let mut r = Reader::new(require(&mdia, b"mdhd", "mdhd")?, "mdhd");
    let version = r.u8()?;
    r.skip(3)?;
    r.skip(if version == 1 { 16 } else { 8 })?;
    let timescale = r.u32()?;
    if timescale == 0 {
        return Err(Mp4Error::Invalid {
            kind: "mdhd".into(),
            reason: "zero timescale".into(),
        });
    }

    let minf = children(require(&mdia, b"minf", "minf")?, "minf")?;
    let stbl = children(require(&minf, b"stbl", "stbl")?, "stbl")?;

    let codec = parse_stsd(require(&stbl, b"stsd", "stsd")?)?;
    let samples = build_samples(&stbl, timescale)?;
    if samples.is_empty() {
        return Err(Mp4Error::EmptySampleTable);
    }

    Ok(Some(VideoTrack {
        track_id,
        timescale,
        codec,
        samples,
    }))
}

fn parse_stsd(stsd: &[u8]) -> Mp4Result<CodecConfig> {
    let mut r = Reader::new(stsd, "stsd");
    r.skip(4)?;
    let count = r.u32()?;
    if count == 0 {
        return Err(Mp4Error::Invalid {
            kind: "stsd".into(),
            reason: "no sample entries".into(),
        });
    }
    let entries = children(r.rest(), "stsd")?;
    let (kind, entry) = entries.first().ok_or(Mp4Error::Truncated("stsd"))?;
    let codec = fourcc(kind);

    if entry.len() < VISUAL_SAMPLE_ENTRY_LEN {
        return Err(Mp4Error::Truncated("visual sample entry"));
    }
    let mut r = Reader::new(entry, "visual sample entry");
    r.skip(24)?;
    let coded_width = r.u16()? as u32;
    let coded_height = r.u16()? as u32;
    r.skip(46)?;
    let depth = r.u16()?;
    r.skip(2)?;
    let extensions = children(r.rest(), "visual sample entry")?;

    let description = match kind {
        b"avc1" | b"avc3" => find(&extensions, b"avcC").map(Bytes::copy_from_slice),
        b"raw " => None,
        _ => extensions
            .iter()
            .find(|(k, _)| !matches!(k, b"pasp" | b"colr" | b"btrt" | b"clap" | b"fiel"))
            .map(|(_, payload)| Bytes::copy_from_slice(payload)),
    };

    match kind {
        b"avc1" if description.is_none() => {
            return Err(Mp4Error::Missing("avcC"));
        }
        b"raw " if depth != 24 && depth != 32 => {
            return Err(Mp4Error::UnsupportedSampleEntry(format!(
                "raw with {depth}-bit depth"
            )));
        }
        b"avc1" | b"avc3" | b"raw " => {}
        _ if description.is_none() => {
            return Err(Mp4Error::UnsupportedSampleEntry(codec));
        }
        _ => {}
    }

    Ok(CodecConfig {
        codec,
        coded_width,
        coded_height,
        depth,
        description,
    })
}

fn build_samples(stbl: &[([u8; 4], &[u8])], timescale: u32) -> Mp4Result<Vec<Sample>> {
    // stsz
    let mut r = Reader::new(require(stbl, b"stsz", "stsz")?, "stsz");
    r.skip(4)?;
    let uniform_size = r.u32()?;
    let sample_count = r.u32()? as usize;
    let sizes: Vec<u32> = if uniform_size == 0 {
        (0..sample_count).map(|_| r.u32()).collect::<Mp4Result<_>>()?
    } else {
        vec![uniform_size; sample_count]
    };
    if sample_count == 0 {
        return Ok(vec![]);
    }

    // stts
    let mut r = Reader::new(require(stbl, b"stts", "stts")?, "stts");
    r.skip(4)?;
    let entries = r.u32()?;
    let mut deltas = Vec::with_capacity(sample_count);
    for _ in 0..entries {
        let count = r.u32()?;
        let delta = r.u32()?;
        for _ in 0..count {
            if deltas.len() == sample_count {
                break;
            }
            deltas.push(delta);
        }
    }
    if deltas.len() < sample_count {
        return Err(Mp4Error::Invalid {
            kind: "stts".into(),
            reason: format!("covers {} of {sample_count} samples", deltas.len()),
        });
    }

    // ctts
    let mut cts_offsets = vec![0i64; sample_count];
    if let Some(ctts) = find(stbl, b"ctts") {
        let mut r = Reader::new(ctts, "ctts");
        let version = r.u8()?;
        r.skip(3)?;
        let entries = r.u32()?;
        let mut idx = 0usize;
        for _ in 0..entries {
            let count = r.u32()?;
            let raw = r.u32()?;
            let offset = if version == 1 {
                raw as i32 as i64
            } else {
                raw as i64
            };
            for _ in 0..count {
                if idx < sample_count {
                    cts_offsets[idx] = offset;
                    idx += 1;
                }
            }
        }
    }

    // stss: absent means every sample is a sync sample
    let mut keyframes = vec![find(stbl, b"stss").is_none(); sample_count];
    if let Some(stss) = find(stbl, b"stss") {
        let mut r = Reader::new(stss, "stss");
        r.skip(4)?;
        let entries = r.u32()?;
        for _ in 0..entries {
            let number = r.u32()? as usize;
            if number >= 1 && number <= sample_count {
                keyframes[number - 1] = true;
            }
        }
    }

    let offsets = sample_offsets(stbl, &sizes)?;

    let mut samples = Vec::with_capacity(sample_count);
    let mut dts_ticks = 0i64;
    for i in 0..sample_count {
        let pts_ticks = dts_ticks + cts_offsets[i];
        samples.push(Sample {
            offset: offsets[i],
            size: sizes[i],
            dts_us: ticks_to_us(dts_ticks, timescale),
            pts_us: ticks_to_us(pts_ticks, timescale),
            duration_us: ticks_to_us(deltas[i] as i64, timescale),
            is_keyframe: keyframes[i],
        });
        dts_ticks += deltas[i] as i64;
    }

    // Composition offsets may start the first picture after zero; shift so
    // presentation begins at zero.
    if let Some(min_pts) = samples.iter().map(|s| s.pts_us).min() {
        if min_pts != 0 {
            for sample in &mut samples {
                sample.pts_us -= min_pts;
            }
        }
    }

    Ok(samples)
}

fn sample_offsets(stbl: &[([u8; 4], &[u8])], sizes: &[u32]) -> Mp4Result<Vec<u64>> {
    let chunk_offsets: Vec<u64> = if let Some(stco) = find(stbl, b"stco") {
        let mut r = Reader::new(stco, "stco");
        r.skip(4)?;
        let n = r.u32()?;
        (0..n).map(|_| r.u32().map(u64::from)).collect::<Mp4Result<_>>()?
    } else if let Some(co64) = find(stbl, b"co64") {
        let mut r = Reader::new(co64, "co64");
        r.skip(4)?;
        let n = r.u32()?;
        (0..n).map(|_| r.u64()).collect::<Mp4Result<_>>()?
    } else {
        return Err(Mp4Error::Missing("stco"));
    };

    let mut r = Reader::new(require(stbl, b"stsc", "stsc")?, "stsc");
    r.skip(4)?;
    let n = r.u32()?;
    let mut runs = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let first_chunk = r.u32()?;
        let per_chunk = r.u32()?;
        r.skip(4)?;
        if first_chunk == 0 {
            return Err(Mp4Error::Invalid {
                kind: "stsc".into(),
                reason: "chunk numbers start at 1".into(),
            });
        }
        runs.push((first_chunk as usize, per_chunk as usize));
    }

    let mut offsets = Vec::with_capacity(sizes.len());
    let mut sample = 0usize;
    for (run_idx, &(first_chunk, per_chunk)) in runs.iter().enumerate() {
        let last_chunk = runs
            .get(run_idx + 1)
            .map(|&(next, _)| next - 1)
            .unwrap_or(chunk_offsets.len());
        for chunk in first_chunk..=last_chunk {
            let Some(&base) = chunk_offsets.get(chunk - 1) else {
                break;
            };
            let mut offset = base;
            for _ in 0..per_chunk {
                if sample == sizes.len() {
                    break;
                }
                offsets.push(offset);
                offset += sizes[sample] as u64;
                sample += 1;
            }
        }
    }

    if offsets.len() < sizes.len() {
        return Err(Mp4Error::Invalid {
            kind: "stsc".into(),
            reason: format!("maps {} of {} samples", offsets.len(), sizes.len()),
        });
    }
    Ok(offsets)
}

fn fourcc(kind: &[u8; 4]) -> String {
    String::from_utf8_lossy(kind).into_owned()
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Big-endian cursor over a box payload.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    fn bytes(&mut self, n: usize) -> Mp4Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(Mp4Error::Truncated(self.what))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Mp4Result<()> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Mp4Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Mp4Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Mp4Result<u32> {
        Ok(be_u32(self.bytes(4)?))
    }

    fn u64(&mut self) -> Mp4Result<u64> {
        Ok(be_u64(self.bytes(8)?))
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}
