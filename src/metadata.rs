//! Track and sample metadata.
//!
//! These are the values the demuxer reports: a [`MovieInfo`] once the
//! container index has been parsed, and one [`EncodedSample`] per compressed
//! frame afterwards.

use bytes::Bytes;

/// Broad category of a track, taken from its handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// `vide` handler.
    Video,
    /// `soun` handler.
    Audio,
    /// Anything else (hints, subtitles, timed metadata).
    Other,
}

/// Video codecs with a decoder behind [`FfmpegDecoder`](crate::FfmpegDecoder).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    /// H.264 / AVC (`avc1`, `avc3`).
    H264,
    /// H.265 / HEVC (`hvc1`, `hev1`).
    H265,
}

impl VideoCodec {
    /// Map a sample entry fourcc to a codec.
    pub fn from_fourcc(fourcc: &str) -> Option<Self> {
        match fourcc {
            "avc1" | "avc3" => Some(VideoCodec::H264),
            "hvc1" | "hev1" => Some(VideoCodec::H265),
            _ => None,
        }
    }
}

/// Description of one track, immutable once the demuxer reports readiness.
#[derive(Debug, Clone)]
#[must_use]
pub struct TrackInfo {
    /// Track identifier from `tkhd`.
    pub id: u32,
    /// Handler category.
    pub kind: TrackKind,
    /// Sample entry fourcc (e.g. `"avc1"`).
    pub codec: String,
    /// Coded width in pixels (0 for non-visual tracks).
    pub width: u32,
    /// Coded height in pixels (0 for non-visual tracks).
    pub height: u32,
    /// Ticks per second.
    pub time_base: u32,
    /// Track duration in ticks.
    pub duration: u64,
    /// Number of samples in the track.
    pub sample_count: usize,
    /// Decoder configuration record (`avcC` / `hvcC` body), if present.
    pub decoder_config: Option<Bytes>,
}

impl TrackInfo {
    /// Track duration in seconds, or `0.0` if the time base is unknown.
    pub fn duration_seconds(&self) -> f64 {
        if self.time_base == 0 {
            return 0.0;
        }
        self.duration as f64 / self.time_base as f64
    }

    /// The decodable video codec of this track, if any.
    pub fn video_codec(&self) -> Option<VideoCodec> {
        VideoCodec::from_fourcc(&self.codec)
    }

    /// Returns `true` if the track can be sampled for frames: a video
    /// track with a time base, a positive duration and non-zero size.
    pub fn is_usable_video(&self) -> bool {
        self.kind == TrackKind::Video
            && self.time_base > 0
            && self.duration > 0
            && self.width > 0
            && self.height > 0
    }
}

/// Container-level information reported once when the index is parsed.
#[derive(Debug, Clone)]
#[must_use]
pub struct MovieInfo {
    /// Movie time scale from `mvhd`.
    pub time_base: u32,
    /// Movie duration in movie ticks.
    pub duration: u64,
    /// Every track in the container, in file order.
    pub tracks: Vec<TrackInfo>,
}

impl MovieInfo {
    /// The first usable video track.
    pub fn video_track(&self) -> Option<&TrackInfo> {
        self.tracks.iter().find(|track| track.is_usable_video())
    }
}

/// One compressed sample handed from the demuxer to the decoder.
///
/// Transient: it is consumed by the decoder and never retained.
#[derive(Debug, Clone)]
pub struct EncodedSample {
    /// Track the sample belongs to.
    pub track_id: u32,
    /// Compressed payload.
    pub data: Bytes,
    /// Composition timestamp in ticks.
    pub timestamp: i64,
    /// Decode timestamp in ticks.
    pub decode_timestamp: i64,
    /// Ticks per second for both timestamps.
    pub time_base: u32,
    /// Whether the sample is a sync (key) sample.
    pub is_sync: bool,
}

impl EncodedSample {
    /// Composition timestamp in seconds.
    pub fn seconds(&self) -> f64 {
        if self.time_base == 0 {
            return 0.0;
        }
        self.timestamp as f64 / self.time_base as f64
    }
}
