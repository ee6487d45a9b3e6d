//! Shared helpers: a minimal MP4 writer and scripted pipeline collaborators.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use frameserve::{
    DecodeStatus, DecodedPicture, DemuxEvent, EncodedSample, FrameDecoder, FrameServeError,
    MovieInfo, SampleSource, TrackInfo, TrackKind,
};

// ── MP4 fixtures ─────────────────────────────────────────────────

fn boxed(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&(body.len() as u32 + 8).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(body);
    out
}

fn full_box(kind: &[u8; 4], version: u8, body: &[u8]) -> Vec<u8> {
    flagged_box(kind, version, 0, body)
}

fn flagged_box(kind: &[u8; 4], version: u8, flags: u8, body: &[u8]) -> Vec<u8> {
    let mut content = vec![version, 0, 0, flags];
    content.extend_from_slice(body);
    boxed(kind, &content)
}

fn be32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_be_bytes()).collect()
}

/// Builds a single-track progressive MP4 with one chunk of samples.
#[derive(Debug, Clone)]
pub struct Mp4Builder {
    pub time_base: u32,
    pub sample_delta: u32,
    pub samples: Vec<Vec<u8>>,
    pub composition_offsets: Option<Vec<u32>>,
    pub width: u16,
    pub height: u16,
    pub handler: [u8; 4],
    pub codec: [u8; 4],
    pub moov_first: bool,
    /// Store chunk offsets in `co64`, shifted by this amount.
    pub co64_shift: Option<u64>,
    /// Replacement bodies (after version and flags) for sample tables.
    pub table_overrides: Vec<([u8; 4], Vec<u8>)>,
}

/// AVC configuration record with no parameter sets.
pub const AVC_CONFIG: [u8; 7] = [1, 0x42, 0xc0, 0x1e, 0xff, 0xe0, 0x00];

impl Mp4Builder {
    /// `count` samples of distinct payloads, 30 per second.
    pub fn new(count: usize) -> Self {
        let samples = (0..count)
            .map(|index| {
                let length = 16 + index % 7;
                (0..length).map(|byte| (index * 31 + byte) as u8).collect()
            })
            .collect();
        Self {
            time_base: 3000,
            sample_delta: 100,
            samples,
            composition_offsets: None,
            width: 64,
            height: 48,
            handler: *b"vide",
            codec: *b"avc1",
            moov_first: true,
            co64_shift: None,
            table_overrides: Vec::new(),
        }
    }

    /// Replace the body of the `kind` sample table.
    pub fn with_table(mut self, kind: &[u8; 4], body: Vec<u8>) -> Self {
        self.table_overrides.push((*kind, body));
        self
    }

    /// Write chunk offsets to a `co64` box, adding `shift` to each.
    pub fn with_co64(mut self, shift: u64) -> Self {
        self.co64_shift = Some(shift);
        self
    }

    fn table(&self, kind: &[u8; 4], body: Vec<u8>) -> Vec<u8> {
        let body = self
            .table_overrides
            .iter()
            .find(|(overridden, _)| overridden == kind)
            .map_or(body, |(_, replacement)| replacement.clone());
        full_box(kind, 0, &body)
    }

    pub fn moov_at_end(mut self) -> Self {
        self.moov_first = false;
        self
    }

    pub fn duration(&self) -> u32 {
        self.samples.len() as u32 * self.sample_delta
    }

    fn moov(&self, data_offset: u32) -> Vec<u8> {
        let count = self.samples.len() as u32;

        let mut mvhd = be32(&[0, 0, self.time_base, self.duration()]);
        mvhd.extend_from_slice(&[0u8; 80]);

        let mut tkhd = be32(&[0, 0, 1, 0, self.duration(), 0, 0]);
        tkhd.extend_from_slice(&[0u8; 8]);
        tkhd.extend_from_slice(&[0u8; 36]);
        tkhd.extend_from_slice(&be32(&[
            (self.width as u32) << 16,
            (self.height as u32) << 16,
        ]));

        let mut mdhd = be32(&[0, 0, self.time_base, self.duration()]);
        mdhd.extend_from_slice(&[0x55, 0xc4, 0, 0]);

        let mut hdlr = be32(&[0]);
        hdlr.extend_from_slice(&self.handler);
        hdlr.extend_from_slice(&[0u8; 13]);

        let mut entry = vec![0u8; 6];
        entry.extend_from_slice(&1u16.to_be_bytes());
        entry.extend_from_slice(&[0u8; 16]);
        entry.extend_from_slice(&self.width.to_be_bytes());
        entry.extend_from_slice(&self.height.to_be_bytes());
        entry.extend_from_slice(&[0u8; 50]);
        entry.extend_from_slice(&boxed(b"avcC", &AVC_CONFIG));
        let mut stsd = be32(&[1]);
        stsd.extend_from_slice(&boxed(&self.codec, &entry));

        let stts = be32(&[1, count, self.sample_delta]);
        let stsc = be32(&[1, 1, count, 1]);
        let mut stsz = be32(&[0, count]);
        stsz.extend_from_slice(&be32(
            &self.samples.iter().map(|sample| sample.len() as u32).collect::<Vec<_>>(),
        ));
        let stss = be32(&[1, 1]);

        let mut stbl = Vec::new();
        stbl.extend_from_slice(&full_box(b"stsd", 0, &stsd));
        stbl.extend_from_slice(&self.table(b"stts", stts));
        if let Some(offsets) = &self.composition_offsets {
            let mut ctts = be32(&[offsets.len() as u32]);
            for offset in offsets {
                ctts.extend_from_slice(&be32(&[1, *offset]));
            }
            stbl.extend_from_slice(&self.table(b"ctts", ctts));
        }
        stbl.extend_from_slice(&self.table(b"stss", stss));
        stbl.extend_from_slice(&self.table(b"stsc", stsc));
        stbl.extend_from_slice(&self.table(b"stsz", stsz));
        match self.co64_shift {
            Some(shift) => {
                let mut co64 = be32(&[1]);
                co64.extend_from_slice(&u64::from(data_offset).saturating_add(shift).to_be_bytes());
                stbl.extend_from_slice(&self.table(b"co64", co64));
            }
            None => stbl.extend_from_slice(&self.table(b"stco", be32(&[1, data_offset]))),
        }

        let media_header = if &self.handler == b"soun" {
            full_box(b"smhd", 0, &[0u8; 4])
        } else {
            flagged_box(b"vmhd", 0, 1, &[0u8; 8])
        };
        let dref = {
            let mut body = be32(&[1]);
            body.extend_from_slice(&flagged_box(b"url ", 0, 1, &[]));
            full_box(b"dref", 0, &body)
        };
        let mut minf = media_header;
        minf.extend_from_slice(&boxed(b"dinf", &dref));
        minf.extend_from_slice(&boxed(b"stbl", &stbl));

        let mut mdia = full_box(b"mdhd", 0, &mdhd);
        mdia.extend_from_slice(&full_box(b"hdlr", 0, &hdlr));
        mdia.extend_from_slice(&boxed(b"minf", &minf));

        let mut trak = full_box(b"tkhd", 0, &tkhd);
        trak.extend_from_slice(&boxed(b"mdia", &mdia));

        let mut moov = full_box(b"mvhd", 0, &mvhd);
        moov.extend_from_slice(&boxed(b"trak", &trak));
        boxed(b"moov", &moov)
    }

    pub fn build(&self) -> Vec<u8> {
        let ftyp = boxed(b"ftyp", b"isom\0\0\x02\0isomavc1");
        let payload: Vec<u8> = self.samples.concat();
        let mdat = boxed(b"mdat", &payload);
        let moov_len = self.moov(0).len();

        let mut file = ftyp.clone();
        if self.moov_first {
            let data_offset = ftyp.len() + moov_len + 8;
            file.extend_from_slice(&self.moov(data_offset as u32));
            file.extend_from_slice(&mdat);
        } else {
            let data_offset = ftyp.len() + 8;
            file.extend_from_slice(&mdat);
            file.extend_from_slice(&self.moov(data_offset as u32));
        }
        file
    }
}

// ── Scripted collaborators ───────────────────────────────────────

/// A source that replays a fixed list of events.
pub struct ScriptedSource {
    events: VecDeque<DemuxEvent>,
    selected: Option<u32>,
}

impl ScriptedSource {
    pub fn new(events: Vec<DemuxEvent>) -> Self {
        Self {
            events: events.into(),
            selected: None,
        }
    }
}

impl SampleSource for ScriptedSource {
    async fn next_event(&mut self) -> Result<Option<DemuxEvent>, FrameServeError> {
        loop {
            match self.events.pop_front() {
                Some(DemuxEvent::Sample(sample)) if Some(sample.track_id) != self.selected => {}
                other => return Ok(other),
            }
        }
    }

    fn select_track(&mut self, track_id: u32) -> Result<(), FrameServeError> {
        self.selected = Some(track_id);
        Ok(())
    }
}

pub fn video_track(id: u32, time_base: u32, duration: u64) -> TrackInfo {
    TrackInfo {
        id,
        kind: TrackKind::Video,
        codec: "avc1".to_string(),
        width: 8,
        height: 6,
        time_base,
        duration,
        sample_count: 0,
        decoder_config: None,
    }
}

pub fn sample(track_id: u32, timestamp: i64, time_base: u32) -> EncodedSample {
    EncodedSample {
        track_id,
        data: Bytes::from(timestamp.to_be_bytes().to_vec()),
        timestamp,
        decode_timestamp: timestamp,
        time_base,
        is_sync: timestamp == 0,
    }
}

/// Ready event plus evenly spaced samples covering `duration` ticks.
pub fn synthetic_events(time_base: u32, duration: u64, delta: u64) -> Vec<DemuxEvent> {
    let mut track = video_track(1, time_base, duration);
    track.sample_count = duration.div_ceil(delta) as usize;
    let mut events = vec![DemuxEvent::Ready(MovieInfo {
        time_base,
        duration,
        tracks: vec![track],
    })];
    events.extend(
        (0..duration)
            .step_by(delta as usize)
            .map(|timestamp| DemuxEvent::Sample(sample(1, timestamp as i64, time_base))),
    );
    events
}

/// A decoder that produces a flat picture whose luma depends on the
/// sample's timestamp.
pub struct ScriptedDecoder {
    width: u32,
    height: u32,
    planar: Vec<u8>,
    ready: bool,
    withheld: HashSet<i64>,
    fed: Arc<AtomicUsize>,
}

impl ScriptedDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            planar: Vec::new(),
            ready: false,
            withheld: HashSet::new(),
            fed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Report `NeedMoreInput` for samples at these timestamps.
    pub fn withholding(mut self, timestamps: &[i64]) -> Self {
        self.withheld.extend(timestamps);
        self
    }

    /// Counter of samples fed, shared with the caller.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fed)
    }
}

impl FrameDecoder for ScriptedDecoder {
    fn decode(&mut self, sample: &EncodedSample) -> Result<DecodeStatus, FrameServeError> {
        self.fed.fetch_add(1, Ordering::SeqCst);
        if self.withheld.contains(&sample.timestamp) {
            self.ready = false;
            return Ok(DecodeStatus::NeedMoreInput);
        }

        let luma_len = (self.width * self.height) as usize;
        let chroma_len = ((self.width / 2) * (self.height / 2)) as usize;
        let luma = (sample.timestamp / 100 % 256) as u8;
        self.planar = vec![luma; luma_len];
        self.planar.resize(luma_len + 2 * chroma_len, 128);
        self.ready = true;
        Ok(DecodeStatus::PictureReady)
    }

    fn picture(&self) -> Option<DecodedPicture<'_>> {
        self.ready.then(|| DecodedPicture {
            width: self.width,
            height: self.height,
            planar: &self.planar,
        })
    }
}

// ── Multipart parsing ────────────────────────────────────────────

/// One parsed multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub filename: String,
    pub content_type: String,
    pub payload: Vec<u8>,
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|position| position + from)
}

/// Split a complete body into parts; asserts the terminator ends the body.
pub fn parse_multipart(body: &[u8], boundary: &str) -> Vec<Part> {
    let delimiter = format!("--{boundary}\r\n").into_bytes();
    let terminator = format!("--{boundary}--\r\n").into_bytes();
    assert!(body.ends_with(&terminator), "body must end with the terminator");

    let content = &body[..body.len() - terminator.len()];
    let mut parts = Vec::new();
    let mut position = 0;
    while position < content.len() {
        assert_eq!(&content[position..position + delimiter.len()], &delimiter[..]);
        let header_start = position + delimiter.len();
        let header_end = find(content, b"\r\n\r\n", header_start).expect("header block");
        let headers = std::str::from_utf8(&content[header_start..header_end]).expect("ascii");

        let next = find(content, &delimiter, header_end + 4).unwrap_or(content.len());
        let payload = content[header_end + 4..next - 2].to_vec();
        assert_eq!(&content[next - 2..next], b"\r\n");

        let filename = headers
            .split("filename=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .expect("filename")
            .to_string();
        let content_type = headers
            .lines()
            .find_map(|line| line.strip_prefix("Content-Type: "))
            .expect("content type")
            .to_string();

        parts.push(Part {
            filename,
            content_type,
            payload,
        });
        position = next;
    }
    parts
}
