//! Incremental MP4 demuxing.
//!
//! [`Mp4Demuxer`] accepts the file as a sequence of contiguous chunks, each
//! annotated with its absolute offset, and turns it into [`DemuxEvent`]s:
//! one [`DemuxEvent::Ready`] once the `moov` box has been parsed, then one
//! [`DemuxEvent::Sample`] per sample of the selected track, in decode order,
//! as soon as the sample's bytes have arrived.
//!
//! Box decoding is done by `mp4-atom`. This module only decides which bytes
//! to keep: top-level headers are inspected as they arrive, the `moov` box is
//! decoded once it is complete, and bytes are released as soon as no
//! remaining sample of the selected track needs them. A file with its index
//! at the front is therefore processed in bounded memory.
//!
//! Only progressive (non-fragmented) files are supported.

use bytes::{Buf, Bytes, BytesMut};
use mp4_atom::{Atom, Codec, Decode, Header, Moov, Stbl, StszSamples, Trak};

use crate::error::FrameServeError;
use crate::metadata::{EncodedSample, MovieInfo, TrackInfo, TrackKind};

/// Upper bound on samples per track, about 150 hours at 30 fps.
const MAX_SAMPLES: usize = 1 << 24;

/// Upper bound on the size of the `moov` box.
const MAX_MOOV_SIZE: u64 = 64 * 1024 * 1024;

/// Output of [`Mp4Demuxer::poll`].
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    /// The container index was parsed. Reported exactly once.
    Ready(MovieInfo),
    /// The next sample of the selected track.
    Sample(EncodedSample),
}

#[derive(Debug, Clone, Copy)]
struct SampleEntry {
    offset: u64,
    /// Exclusive end offset, checked against overflow when the table is built.
    end: u64,
    decode_timestamp: i64,
    timestamp: i64,
    is_sync: bool,
}

#[derive(Debug)]
struct Track {
    info: TrackInfo,
    samples: Vec<SampleEntry>,
}

#[derive(Debug)]
struct Extraction {
    track: usize,
    next_sample: usize,
    /// `retain_from[i]` is the smallest file offset of samples `i..`.
    retain_from: Vec<u64>,
}

/// A top-level box header and where its body starts.
#[derive(Debug)]
struct TopLevelBox {
    header: Header,
    body_start: u64,
}

/// Push-in, pull-out MP4 demuxer.
#[derive(Debug, Default)]
pub struct Mp4Demuxer {
    buffer: BytesMut,
    /// Absolute file offset of `buffer[0]`.
    buffer_start: u64,
    /// Total bytes appended so far.
    received: u64,
    /// Offset of the next top-level box header to inspect.
    scan_offset: u64,
    /// A top-level box runs to end of file; nothing follows it.
    scan_exhausted: bool,
    /// Start of the first `mdat` seen before `moov`, if any.
    early_mdat: Option<u64>,
    movie: Option<MovieInfo>,
    tracks: Vec<Track>,
    ready_reported: bool,
    extraction: Option<Extraction>,
    flushed: bool,
    truncation_reported: bool,
}

impl Mp4Demuxer {
    /// Create an empty demuxer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of bytes appended.
    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    /// Number of bytes currently held.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Parsed container information, once available.
    pub fn movie(&self) -> Option<&MovieInfo> {
        self.movie.as_ref()
    }

    /// Append the next chunk of the file.
    ///
    /// # Errors
    ///
    /// Returns [`FrameServeError::Demux`] if `file_start` does not continue
    /// exactly where the previous chunk ended, or if input was already
    /// flushed.
    pub fn append(&mut self, chunk: Bytes, file_start: u64) -> Result<(), FrameServeError> {
        if self.flushed {
            return Err(FrameServeError::Demux("data appended after end of input".to_string()));
        }
        if file_start != self.received {
            return Err(FrameServeError::Demux(format!(
                "chunk starts at offset {file_start}, expected {}",
                self.received
            )));
        }

        let chunk_end = file_start
            .checked_add(chunk.len() as u64)
            .ok_or_else(|| FrameServeError::Demux("input exceeds the addressable file size".to_string()))?;
        self.received = chunk_end;
        if chunk_end <= self.buffer_start {
            // Entirely inside a region no remaining sample needs.
            return Ok(());
        }
        let skip = self.buffer_start.saturating_sub(file_start) as usize;
        self.buffer.extend_from_slice(&chunk[skip..]);
        Ok(())
    }

    /// Signal end of input. Samples already buffered are still delivered.
    pub fn flush(&mut self) {
        self.flushed = true;
    }

    /// Select the track whose samples [`poll`](Self::poll) delivers.
    ///
    /// # Errors
    ///
    /// Returns [`FrameServeError::Demux`] if the index has not been parsed
    /// yet or no track has the given id.
    pub fn set_extraction_track(&mut self, track_id: u32) -> Result<(), FrameServeError> {
        let track = self
            .tracks
            .iter()
            .position(|track| track.info.id == track_id)
            .ok_or_else(|| FrameServeError::Demux(format!("unknown track id {track_id}")))?;

        let samples = &self.tracks[track].samples;
        let mut retain_from = vec![u64::MAX; samples.len()];
        let mut minimum = u64::MAX;
        for (index, sample) in samples.iter().enumerate().rev() {
            minimum = minimum.min(sample.offset);
            retain_from[index] = minimum;
        }

        log::debug!("Extracting {} samples from track {track_id}", samples.len());
        let first = retain_from.first().copied().unwrap_or(self.received);
        self.extraction = Some(Extraction {
            track,
            next_sample: 0,
            retain_from,
        });
        self.release_before(first);
        Ok(())
    }

    /// Produce the next event, or `None` if more input is needed (or, after
    /// [`flush`](Self::flush), if the selected track is exhausted).
    ///
    /// # Errors
    ///
    /// Returns [`FrameServeError::Demux`] for malformed boxes, or if input
    /// ended without a `moov` box.
    pub fn poll(&mut self) -> Result<Option<DemuxEvent>, FrameServeError> {
        if self.movie.is_none() {
            self.scan()?;
        }

        let Some(movie) = &self.movie else {
            if self.flushed {
                return Err(FrameServeError::Demux(
                    "end of input reached without a moov box".to_string(),
                ));
            }
            return Ok(None);
        };

        if !self.ready_reported {
            self.ready_reported = true;
            return Ok(Some(DemuxEvent::Ready(movie.clone())));
        }

        self.next_sample()
    }

    fn next_sample(&mut self) -> Result<Option<DemuxEvent>, FrameServeError> {
        let Some(extraction) = &self.extraction else {
            return Ok(None);
        };
        let track = &self.tracks[extraction.track];
        let index = extraction.next_sample;
        let Some(entry) = track.samples.get(index).copied() else {
            return Ok(None);
        };
        let track_id = track.info.id;
        let time_base = track.info.time_base;

        if entry.end > self.received {
            if self.flushed && !self.truncation_reported {
                self.truncation_reported = true;
                log::warn!(
                    "Input ended inside sample {index} of track {track_id} ({} of {} bytes received)",
                    self.received,
                    entry.end
                );
            }
            return Ok(None);
        }

        let data = Bytes::copy_from_slice(self.slice(entry.offset, entry.end)?);
        let retain = extraction
            .retain_from
            .get(index + 1)
            .copied()
            .unwrap_or(self.received);
        if let Some(extraction) = self.extraction.as_mut() {
            extraction.next_sample += 1;
        }
        self.release_before(retain);

        Ok(Some(DemuxEvent::Sample(EncodedSample {
            track_id,
            data,
            timestamp: entry.timestamp,
            decode_timestamp: entry.decode_timestamp,
            time_base,
            is_sync: entry.is_sync,
        })))
    }

    /// Walk top-level boxes until `moov` is parsed or more data is needed.
    fn scan(&mut self) -> Result<(), FrameServeError> {
        while self.movie.is_none() && !self.scan_exhausted {
            let Some(top) = self.peek_header(self.scan_offset)? else {
                return Ok(());
            };

            let start = self.scan_offset;
            let is_moov = top.header.kind == b"moov".into();
            let end = match top.header.size {
                Some(size) => top
                    .body_start
                    .checked_add(size as u64)
                    .ok_or_else(|| FrameServeError::Demux(format!(
                        "box at offset {start} overflows the file offset"
                    )))?,
                None if self.flushed => self.received,
                None if is_moov => return Ok(()),
                None => {
                    self.note_mdat(&top.header, start);
                    self.scan_exhausted = true;
                    break;
                }
            };

            if is_moov {
                if end - start > MAX_MOOV_SIZE {
                    return Err(FrameServeError::Demux(format!(
                        "moov box of {} bytes exceeds the {MAX_MOOV_SIZE} byte limit",
                        end - start
                    )));
                }
                if end > self.received {
                    return Ok(());
                }
                let mut atom = self.slice(start, end)?;
                let moov = Moov::decode(&mut atom)
                    .map_err(|error| FrameServeError::Demux(format!("invalid moov box: {error}")))?;
                let (movie, tracks) = index_movie(&moov)?;
                log::debug!(
                    "Parsed moov at offset {start}: {} tracks, time base {}",
                    movie.tracks.len(),
                    movie.time_base
                );
                self.movie = Some(movie);
                self.tracks = tracks;
            } else {
                self.note_mdat(&top.header, start);
            }
            self.scan_offset = end;

            // Before the index is known, media data has to be kept.
            let keep = self.early_mdat.unwrap_or(self.scan_offset);
            self.release_before(keep.min(self.scan_offset));
        }
        Ok(())
    }

    fn note_mdat(&mut self, header: &Header, start: u64) {
        if header.kind == b"mdat".into() && self.movie.is_none() && self.early_mdat.is_none() {
            log::warn!("mdat at offset {start} precedes moov; buffering media data until the index arrives");
            self.early_mdat = Some(start);
        }
    }

    fn peek_header(&self, offset: u64) -> Result<Option<TopLevelBox>, FrameServeError> {
        if offset >= self.received {
            return Ok(None);
        }
        let available = self.slice(offset, self.received)?;
        if available.len() < 8 {
            return Ok(None);
        }
        // A 32-bit size of 1 announces a 64-bit size after the type.
        let mut peek = available;
        let declared = match peek.get_u32() {
            1 if available.len() < 16 => return Ok(None),
            1 => {
                peek.advance(4);
                (peek.get_u64(), 16)
            }
            size => (u64::from(size), 8),
        };
        if let (size @ 1.., header_len) = declared {
            if size < header_len {
                return Err(FrameServeError::Demux(format!(
                    "box at offset {offset} declares {size} bytes, less than its header"
                )));
            }
        }

        let mut cursor = available;
        let header = Header::decode(&mut cursor).map_err(|error| {
            FrameServeError::Demux(format!("invalid box header at offset {offset}: {error}"))
        })?;

        let header_len = (available.len() - cursor.remaining()) as u64;
        Ok(Some(TopLevelBox {
            header,
            body_start: offset + header_len,
        }))
    }

    fn slice(&self, start: u64, end: u64) -> Result<&[u8], FrameServeError> {
        let held_end = self.buffer_start + self.buffer.len() as u64;
        if start < self.buffer_start || end > held_end || start > end {
            return Err(FrameServeError::Demux(format!(
                "bytes {start}..{end} are not buffered (holding {}..{held_end})",
                self.buffer_start
            )));
        }
        let from = (start - self.buffer_start) as usize;
        let to = (end - self.buffer_start) as usize;
        Ok(&self.buffer[from..to])
    }

    fn release_before(&mut self, offset: u64) {
        if offset <= self.buffer_start {
            return;
        }
        let count = (offset - self.buffer_start).min(self.buffer.len() as u64);
        self.buffer.advance(count as usize);
        self.buffer_start = offset;
    }
}

fn fourcc(kind: &mp4_atom::FourCC) -> String {
    let bytes: &[u8; 4] = kind.as_ref();
    String::from_utf8_lossy(bytes).into_owned()
}

fn malformed(message: impl Into<String>) -> FrameServeError {
    FrameServeError::Demux(message.into())
}

fn index_movie(moov: &Moov) -> Result<(MovieInfo, Vec<Track>), FrameServeError> {
    let tracks = moov.trak.iter().map(index_track).collect::<Result<Vec<_>, _>>()?;
    let movie = MovieInfo {
        time_base: moov.mvhd.timescale,
        duration: moov.mvhd.duration.into(),
        tracks: tracks.iter().map(|track| track.info.clone()).collect(),
    };
    Ok((movie, tracks))
}

fn index_track(trak: &Trak) -> Result<Track, FrameServeError> {
    let handler = &trak.mdia.hdlr.handler;
    let kind = match handler.as_ref() {
        b"vide" => TrackKind::Video,
        b"soun" => TrackKind::Audio,
        _ => TrackKind::Other,
    };

    let stbl = &trak.mdia.minf.stbl;
    let entry = sample_entry(stbl)?;
    let samples = sample_table(stbl)?;

    let mut duration: u64 = trak.mdia.mdhd.duration.into();
    if duration == 0 {
        if let Some(last) = samples.iter().map(|sample| sample.decode_timestamp).max() {
            duration = last.max(0) as u64;
        }
    }

    let (width, height) = match entry.visual {
        Some((width, height)) if width > 0 && height > 0 => (width, height),
        _ if kind == TrackKind::Video => (
            trak.tkhd.width.integer() as u32,
            trak.tkhd.height.integer() as u32,
        ),
        _ => (0, 0),
    };

    Ok(Track {
        info: TrackInfo {
            id: trak.tkhd.track_id,
            kind,
            codec: entry.codec,
            width,
            height,
            time_base: trak.mdia.mdhd.timescale,
            duration,
            sample_count: samples.len(),
            decoder_config: entry.config,
        },
        samples,
    })
}

struct SampleDescription {
    codec: String,
    visual: Option<(u32, u32)>,
    config: Option<Bytes>,
}

fn sample_entry(stbl: &Stbl) -> Result<SampleDescription, FrameServeError> {
    let codec = stbl
        .stsd
        .codecs
        .first()
        .ok_or_else(|| malformed("stsd holds no sample entry"))?;

    let (name, visual, config) = match codec {
        Codec::Avc1(avc1) => ("avc1".to_string(), Some(&avc1.visual), Some(decoder_config(&avc1.avcc)?)),
        Codec::Hev1(hev1) => ("hev1".to_string(), Some(&hev1.visual), Some(decoder_config(&hev1.hvcc)?)),
        Codec::Hvc1(hvc1) => ("hvc1".to_string(), Some(&hvc1.visual), Some(decoder_config(&hvc1.hvcc)?)),
        Codec::Vp08(vp08) => ("vp08".to_string(), Some(&vp08.visual), None),
        Codec::Vp09(vp09) => ("vp09".to_string(), Some(&vp09.visual), None),
        Codec::Av01(av01) => ("av01".to_string(), Some(&av01.visual), None),
        Codec::Mp4a(_) => ("mp4a".to_string(), None, None),
        Codec::Opus(_) => ("Opus".to_string(), None, None),
        Codec::Unknown(kind) => (fourcc(kind), None, None),
        _ => ("unsupported".to_string(), None, None),
    };

    Ok(SampleDescription {
        codec: name,
        visual: visual.map(|visual| (u32::from(visual.width), u32::from(visual.height))),
        config,
    })
}

/// The decoder configuration record, without its box header.
fn decoder_config<T: Atom>(atom: &T) -> Result<Bytes, FrameServeError> {
    let mut body = BytesMut::new();
    atom.encode_body(&mut body)
        .map_err(|error| malformed(format!("invalid decoder configuration: {error}")))?;
    Ok(body.freeze())
}

fn sample_count(count: usize) -> Result<usize, FrameServeError> {
    if count > MAX_SAMPLES {
        return Err(malformed(format!("track declares {count} samples")));
    }
    Ok(count)
}

fn sample_table(stbl: &Stbl) -> Result<Vec<SampleEntry>, FrameServeError> {
    let sizes = match &stbl.stsz.samples {
        StszSamples::Identical { count, size } => vec![*size; sample_count(*count as usize)?],
        StszSamples::Different { sizes } => {
            sample_count(sizes.len())?;
            sizes.clone()
        }
    };
    let count = sizes.len();

    let chunk_offsets: Vec<u64> = match (&stbl.stco, &stbl.co64) {
        (Some(stco), _) => stco.entries.iter().map(|&offset| u64::from(offset)).collect(),
        (None, Some(co64)) => co64.entries.clone(),
        (None, None) => return Err(malformed("missing chunk offset table")),
    };

    let offsets = sample_offsets(stbl, &chunk_offsets, &sizes)?;
    let decode_timestamps = expand_stts(stbl, count);
    let composition_offsets = expand_ctts(stbl, count);
    let sync = sync_samples(stbl, count);

    (0..count)
        .map(|index| {
            let offset = offsets[index];
            let end = offset.checked_add(u64::from(sizes[index])).ok_or_else(|| {
                malformed(format!("sample {index} at offset {offset} overflows the file offset"))
            })?;
            Ok(SampleEntry {
                offset,
                end,
                decode_timestamp: decode_timestamps[index],
                timestamp: decode_timestamps[index] + composition_offsets[index],
                is_sync: sync[index],
            })
        })
        .collect()
}

fn sample_offsets(
    stbl: &Stbl,
    chunk_offsets: &[u64],
    sizes: &[u32],
) -> Result<Vec<u64>, FrameServeError> {
    let runs = &stbl.stsc.entries;
    let mut offsets = Vec::with_capacity(sizes.len());

    for (run, entry) in runs.iter().enumerate() {
        if entry.first_chunk == 0 {
            return Err(malformed("stsc references chunk 0"));
        }
        let last_chunk = match runs.get(run + 1) {
            Some(next) => next.first_chunk.saturating_sub(1),
            None => chunk_offsets.len() as u32,
        };

        for chunk in entry.first_chunk..=last_chunk {
            let mut offset = *chunk_offsets.get(chunk as usize - 1).ok_or_else(|| {
                malformed(format!(
                    "stsc references chunk {chunk} but only {} exist",
                    chunk_offsets.len()
                ))
            })?;
            for _ in 0..entry.samples_per_chunk {
                let Some(&size) = sizes.get(offsets.len()) else {
                    return Ok(offsets);
                };
                offsets.push(offset);
                offset = offset.checked_add(u64::from(size)).ok_or_else(|| {
                    malformed(format!("chunk {chunk} overflows the file offset"))
                })?;
            }
        }
    }

    if offsets.len() < sizes.len() {
        return Err(malformed(format!(
            "chunk table covers {} of {} samples",
            offsets.len(),
            sizes.len()
        )));
    }
    Ok(offsets)
}

fn expand_stts(stbl: &Stbl, count: usize) -> Vec<i64> {
    let mut timestamps = Vec::with_capacity(count);
    let mut time: i64 = 0;
    let mut last_delta: i64 = 0;
    for entry in &stbl.stts.entries {
        last_delta = i64::from(entry.sample_delta);
        for _ in 0..entry.sample_count {
            if timestamps.len() == count {
                return timestamps;
            }
            timestamps.push(time);
            time += last_delta;
        }
    }
    // Tables that undercount keep the last delta.
    while timestamps.len() < count {
        timestamps.push(time);
        time += last_delta;
    }
    timestamps
}

fn expand_ctts(stbl: &Stbl, count: usize) -> Vec<i64> {
    let Some(ctts) = &stbl.ctts else {
        return vec![0; count];
    };
    let mut offsets = Vec::with_capacity(count);
    for entry in &ctts.entries {
        for _ in 0..entry.sample_count {
            if offsets.len() == count {
                return offsets;
            }
            offsets.push(i64::from(entry.sample_offset));
        }
    }
    offsets.resize(count, 0);
    offsets
}

fn sync_samples(stbl: &Stbl, count: usize) -> Vec<bool> {
    let Some(stss) = &stbl.stss else {
        return vec![true; count];
    };
    let mut sync = vec![false; count];
    for &number in &stss.entries {
        if let Some(slot) = (number as usize).checked_sub(1).and_then(|index| sync.get_mut(index)) {
            *slot = true;
        }
    }
    sync
}
