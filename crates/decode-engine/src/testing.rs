//! In-memory MP4 fixtures.
//!
//! Builds small uncompressed (`raw `) MP4 files whose pixels follow a known
//! pattern, so decoded output can be checked exactly without shipping media.

use recast_project_model::MediaRef;

const TIMESCALE: u32 = 90_000;

/// Expected RGB value of pixel (`x`, `y`) in fixture frame `frame`.
pub fn fixture_pixel(frame: u32, x: u32, y: u32) -> [u8; 3] {
    [
        (frame.wrapping_mul(37).wrapping_add(x * 5)) as u8,
        (frame.wrapping_mul(11).wrapping_add(y * 7)) as u8,
        (frame.wrapping_add(x).wrapping_add(y)) as u8,
    ]
}

/// Builder for a single-track uncompressed MP4.
#[derive(Debug, Clone)]
pub struct Mp4Builder {
    width: u16,
    height: u16,
    fps: u32,
    frames: u32,
    keyframe_interval: Option<u32>,
    handler: [u8; 4],
    depth: u16,
    codec: [u8; 4],
}

impl Mp4Builder {
    /// 24-bit RGB frames at `fps`.
    pub fn raw_rgb(width: u16, height: u16, fps: u32) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            frames: 1,
            keyframe_interval: None,
            handler: *b"vide",
            depth: 24,
            codec: *b"raw ",
        }
    }

    pub fn frames(mut self, frames: u32) -> Self {
        self.frames = frames;
        self
    }

    /// Mark every `n`th sample as sync and write an `stss` box.
    pub fn keyframe_interval(mut self, n: u32) -> Self {
        self.keyframe_interval = Some(n.max(1));
        self
    }

    pub fn handler(mut self, handler: [u8; 4]) -> Self {
        self.handler = handler;
        self
    }

    /// 24 for RGB, 32 for ARGB.
    pub fn depth(mut self, depth: u16) -> Self {
        self.depth = depth;
        self
    }

    pub fn codec(mut self, codec: [u8; 4]) -> Self {
        self.codec = codec;
        self
    }

    /// Presentation timestamp of frame `i` in microseconds.
    pub fn frame_time_us(&self, i: u32) -> i64 {
        let delta = (TIMESCALE / self.fps) as i64;
        i as i64 * delta * 1_000_000 / TIMESCALE as i64
    }

    pub fn build_media(&self, name: &str) -> MediaRef {
        MediaRef::memory(name, self.build())
    }

    pub fn build(&self) -> Vec<u8> {
        let payloads: Vec<Vec<u8>> = (0..self.frames).map(|i| self.frame_payload(i)).collect();
        let sizes: Vec<u32> = payloads.iter().map(|p| p.len() as u32).collect();

        let ftyp = self.ftyp();
        // stco is fixed-size, so a placeholder offset gives the final moov size.
        let moov_len = self.moov(&sizes, 0).len();
        let mdat_payload_offset = (ftyp.len() + moov_len + 8) as u32;
        let moov = self.moov(&sizes, mdat_payload_offset);

        let mdat = build_box(b"mdat", &payloads.concat());
        [ftyp, moov, mdat].concat()
    }

    fn frame_payload(&self, frame: u32) -> Vec<u8> {
        let bytes_per_pixel = if self.depth == 32 { 4 } else { 3 };
        let mut out =
            Vec::with_capacity(self.width as usize * self.height as usize * bytes_per_pixel);
        for y in 0..self.height as u32 {
            for x in 0..self.width as u32 {
                let [r, g, b] = fixture_pixel(frame, x, y);
                if bytes_per_pixel == 4 {
                    out.extend_from_slice(&[255, r, g, b]);
                } else {
                    out.extend_from_slice(&[r, g, b]);
                }
            }
        }
        out
    }

    fn ftyp(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"qt  ");
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(b"qt  isom");
        build_box(b"ftyp", &payload)
    }

    fn moov(&self, sizes: &[u32], chunk_offset: u32) -> Vec<u8> {
        let delta = TIMESCALE / self.fps;
        let duration = delta * self.frames;

        let mut mvhd = vec![0u8; 4];
        mvhd.extend_from_slice(&0u32.to_be_bytes());
        mvhd.extend_from_slice(&0u32.to_be_bytes());
        mvhd.extend_from_slice(&TIMESCALE.to_be_bytes());
        mvhd.extend_from_slice(&duration.to_be_bytes());
        mvhd.extend_from_slice(&[0u8; 80]);

        let mut tkhd = vec![0u8, 0, 0, 3];
        tkhd.extend_from_slice(&0u32.to_be_bytes());
        tkhd.extend_from_slice(&0u32.to_be_bytes());
        tkhd.extend_from_slice(&1u32.to_be_bytes());
        tkhd.extend_from_slice(&0u32.to_be_bytes());
        tkhd.extend_from_slice(&duration.to_be_bytes());
        tkhd.extend_from_slice(&[0u8; 52]);
        tkhd.extend_from_slice(&((self.width as u32) << 16).to_be_bytes());
        tkhd.extend_from_slice(&((self.height as u32) << 16).to_be_bytes());

        let mut mdhd = vec![0u8; 4];
        mdhd.extend_from_slice(&0u32.to_be_bytes());
        mdhd.extend_from_slice(&0u32.to_be_bytes());
        mdhd.extend_from_slice(&TIMESCALE.to_be_bytes());
        mdhd.extend_from_slice(&duration.to_be_bytes());
        mdhd.extend_from_slice(&[0x55, 0xc4, 0, 0]);

        let mut hdlr = vec![0u8; 4];
        hdlr.extend_from_slice(&0u32.to_be_bytes());
        hdlr.extend_from_slice(&self.handler);
        hdlr.extend_from_slice(&[0u8; 12]);
        hdlr.push(0);

        let mdia = [
            build_box(b"mdhd", &mdhd),
            build_box(b"hdlr", &hdlr),
            build_box(b"minf", &build_box(b"stbl", &self.stbl(sizes, chunk_offset))),
        ]
        .concat();
        let trak = [build_box(b"tkhd", &tkhd), build_box(b"mdia", &mdia)].concat();
        build_box(
            b"moov",
            &[build_box(b"mvhd", &mvhd), build_box(b"trak", &trak)].concat(),
        )
    }

    fn stbl(&self, sizes: &[u32], chunk_offset: u32) -> Vec<u8> {
        let mut entry = Vec::new();
        entry.extend_from_slice(&[0u8; 6]);
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0u8; 16]);
        entry.extend_from_slice(&self.width.to_be_bytes());
        entry.extend_from_slice(&self.height.to_be_bytes());
        entry.extend_from_slice(&0x0048_0000_u32.to_be_bytes());
        entry.extend_from_slice(&0x0048_0000_u32.to_be_bytes());
        entry.extend_from_slice(&0u32.to_be_bytes());
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0u8; 32]);
        entry.extend_from_slice(&self.depth.to_be_bytes());
        entry.extend_from_slice(&0xffffu16.to_be_bytes());

        let mut stsd = vec![0u8; 4];
        stsd.extend_from_slice(&1u32.to_be_bytes());
        stsd.extend_from_slice(&build_box(&self.codec, &entry));

        let mut stts = vec![0u8; 4];
        stts.extend_from_slice(&1u32.to_be_bytes());
        stts.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
        stts.extend_from_slice(&(TIMESCALE / self.fps).to_be_bytes());

        let mut stsc = vec![0u8; 4];
        stsc.extend_from_slice(&1u32.to_be_bytes());
        stsc.extend_from_slice(&1u32.to_be_bytes());
        stsc.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
        stsc.extend_from_slice(&1u32.to_be_bytes());

        let mut stsz = vec![0u8; 4];
        stsz.extend_from_slice(&0u32.to_be_bytes());
        stsz.extend_from_slice(&(sizes.len() as u32).to_be_bytes());
        for size in sizes {
            stsz.extend_from_slice(&size.to_be_bytes());
        }

        let mut stco = vec![0u8; 4];
        stco.extend_from_slice(&1u32.to_be_bytes());
        stco.extend_from_slice(&chunk_offset.to_be_bytes());

        let mut boxes = vec![
            build_box(b"stsd", &stsd),
            build_box(b"stts", &stts),
            build_box(b"stsc", &stsc),
            build_box(b"stsz", &stsz),
            build_box(b"stco", &stco),
        ];

        if let Some(interval) = self.keyframe_interval {
            let keys: Vec<u32> = (0..sizes.len() as u32)
                .filter(|i| i % interval == 0)
                .map(|i| i + 1)
                .collect();
            let mut stss = vec![0u8; 4];
            stss.extend_from_slice(&(keys.len() as u32).to_be_bytes());
            for key in keys {
                stss.extend_from_slice(&key.to_be_bytes());
            }
            boxes.push(build_box(b"stss", &stss));
        }

        boxes.concat()
    }
}

fn build_box(typ: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let length = (8 + payload.len()) as u32;
    let mut buffer = Vec::with_capacity(payload.len() + 8);
    buffer.extend_from_slice(&length.to_be_bytes());
    buffer.extend_from_slice(typ);
    buffer.extend_from_slice(payload);
    buffer
}
