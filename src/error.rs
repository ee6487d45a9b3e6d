//! Error types for the `frameserve` crate.
//!
//! This module defines [`FrameServeError`], the unified error type returned by
//! every fallible stage of the frame pipeline. Errors raised before the
//! response starts are rendered as an HTTP status; errors raised after that
//! abort the multipart body instead.

use std::io::Error as IoError;

use axum::http::StatusCode;
use ffmpeg_next::Error as FfmpegError;
use image::ImageError;
use thiserror::Error;

/// The unified error type for all `frameserve` operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FrameServeError {
    /// The request path or query was unusable.
    #[error("Invalid request: {0}")]
    RequestInvalid(String),

    /// The remote video could not be fetched.
    #[error("Failed to fetch video from {url}: {reason}")]
    SourceFetchFailed {
        /// The source URL taken from the request.
        url: String,
        /// Non-success status or transport failure.
        reason: String,
    },

    /// The container was parsed but holds no usable video track.
    #[error("No compatible video track found in the file")]
    NoCompatibleTrack,

    /// The container is malformed or truncated in a way the demuxer cannot
    /// recover from.
    #[error("Demux error: {0}")]
    Demux(String),

    /// The video track uses a codec with no available decoder.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// The bitstream decoder could not be created.
    #[error("Failed to initialise decoder: {0}")]
    DecoderInit(String),

    /// A decoded picture did not have the expected planar layout.
    #[error("Invalid decoded picture: {0}")]
    InvalidPicture(String),

    /// An error from the `image` crate while compressing a frame.
    #[error("Image encoding error: {0}")]
    ImageEncode(#[from] ImageError),

    /// An error originating from the FFmpeg libraries.
    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    /// The consumer of the output stream went away.
    #[error("Output stream closed by consumer")]
    OutputClosed,

    /// A sampling interval of zero, a negative value, or NaN was supplied.
    #[error("Sampling interval must be a positive number of seconds")]
    InvalidInterval,

    /// An I/O error occurred while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),
}

impl FrameServeError {
    /// HTTP status used when the error is reported before streaming starts.
    pub fn status_code(&self) -> StatusCode {
        match self {
            FrameServeError::RequestInvalid(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<FfmpegError> for FrameServeError {
    fn from(error: FfmpegError) -> Self {
        FrameServeError::Ffmpeg(error.to_string())
    }
}
