//! # frameserve
//!
//! Stream still frames out of a remote MP4 while it downloads.
//!
//! `frameserve` fetches a video over HTTP, demuxes it progressively, decodes
//! one picture per sampling interval (one second by default) and streams
//! each picture back as a PNG part of a `multipart/form-data` response. The
//! first frames reach the client while the rest of the file is still in
//! flight.
//!
//! ## Quick Start
//!
//! ### Run the server
//!
//! ```no_run
//! use frameserve::{FrameServeError, ServerConfig};
//!
//! # async fn example() -> Result<(), FrameServeError> {
//! let config = ServerConfig::new("127.0.0.1:3000".parse().unwrap());
//! frameserve::serve(config).await
//! # }
//! ```
//!
//! ```text
//! curl "http://127.0.0.1:3000/extract-frames?url=https://example.com/clip.mp4"
//! ```
//!
//! ### Compute the sampling targets of a track
//!
//! ```
//! use std::time::Duration;
//!
//! use frameserve::target_timestamps;
//!
//! // 3.5 s at 1000 ticks per second, one frame per second.
//! let targets = target_timestamps(3500, 1000, Duration::from_secs(1));
//! assert_eq!(targets, vec![0, 1000, 2000, 3000]);
//! ```
//!
//! ## Pipeline
//!
//! | Stage | Module |
//! |-------|--------|
//! | Fetch and progressive demux | [`ingest`], [`demux`] |
//! | Target selection | [`schedule`] |
//! | Decode and frame selection | [`decoder`], [`extract`] |
//! | YUV 4:2:0 to RGB | [`conversion`] |
//! | PNG compression | [`encode`] |
//! | Multipart framing | [`multipart`] |
//! | Task wiring and output lifecycle | [`stream`] |
//! | HTTP surface | [`server`] |
//!
//! ## Requirements
//!
//! FFmpeg development libraries must be installed for the H.264/H.265
//! decoder.

pub mod configuration;
pub mod conversion;
pub mod decoder;
pub mod demux;
pub mod encode;
pub mod error;
pub mod extract;
pub mod ffmpeg;
pub mod ingest;
pub mod metadata;
pub mod multipart;
pub mod schedule;
pub mod server;
pub mod stream;

pub use configuration::{DEFAULT_BOUNDARY_PREFIX, DEFAULT_INTERVAL, ServerConfig, StreamOptions};
pub use conversion::yuv420_to_rgb;
pub use decoder::{DecodeStatus, DecodedPicture, FfmpegDecoder, FrameDecoder};
pub use demux::{DemuxEvent, Mp4Demuxer};
pub use encode::{ImageEncoder, PngEncoder};
pub use error::FrameServeError;
pub use extract::DecodeCoordinator;
pub use ffmpeg::{FfmpegLogLevel, set_ffmpeg_log_level};
pub use ingest::{Ingest, SampleSource};
pub use metadata::{EncodedSample, MovieInfo, TrackInfo, TrackKind, VideoCodec};
pub use multipart::{Boundary, FramePackager};
pub use schedule::{FrameSchedule, MatchPolicy, target_timestamps};
pub use server::{router, serve};
pub use stream::{FrameStream, FrameWriter, StreamState, spawn_pipeline};
