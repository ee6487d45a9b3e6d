//! Progressive source ingest.
//!
//! [`Ingest`] pulls byte chunks from a stream, appends them to an
//! [`Mp4Demuxer`] at their running file offset and hands the demuxer's
//! events to the caller. [`fetch`] opens the stream for a remote URL with
//! `reqwest`; tests drive the same code with in-memory chunks.
//!
//! ```no_run
//! use frameserve::{DemuxEvent, FrameServeError, SampleSource, ingest};
//!
//! # async fn example() -> Result<(), FrameServeError> {
//! let client = reqwest::Client::new();
//! let mut source = ingest::fetch(&client, "https://example.com/clip.mp4").await?;
//! while let Some(event) = source.next_event().await? {
//!     if let DemuxEvent::Ready(movie) = event {
//!         println!("{} tracks", movie.tracks.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio_stream::{Stream, StreamExt};

use crate::demux::{DemuxEvent, Mp4Demuxer};
use crate::error::FrameServeError;

/// A boxed stream of body chunks as produced by `reqwest`.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// A pull-based producer of demux events.
///
/// The pipeline asks for the next event only when it has room for it, so a
/// slow consumer stops the source from reading further.
pub trait SampleSource: Send + 'static {
    /// The next event, or `None` once the input is exhausted.
    fn next_event(
        &mut self,
    ) -> impl Future<Output = Result<Option<DemuxEvent>, FrameServeError>> + Send;

    /// Restrict [`DemuxEvent::Sample`] events to one track.
    fn select_track(&mut self, track_id: u32) -> Result<(), FrameServeError>;
}

/// Feeds a chunk stream into an [`Mp4Demuxer`].
pub struct Ingest<S> {
    source: String,
    stream: S,
    demuxer: Mp4Demuxer,
    offset: u64,
    ended: bool,
}

impl<S, E> Ingest<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: Display,
{
    /// Wrap `stream`; `source` names the input in error messages.
    pub fn new(source: impl Into<String>, stream: S) -> Self {
        Self {
            source: source.into(),
            stream,
            demuxer: Mp4Demuxer::new(),
            offset: 0,
            ended: false,
        }
    }

    /// Bytes pulled from the stream so far.
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }

    /// The underlying demuxer.
    pub fn demuxer(&self) -> &Mp4Demuxer {
        &self.demuxer
    }

    async fn pull(&mut self) -> Result<Option<DemuxEvent>, FrameServeError> {
        loop {
            if let Some(event) = self.demuxer.poll()? {
                return Ok(Some(event));
            }
            if self.ended {
                return Ok(None);
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    let start = self.offset;
                    self.offset += chunk.len() as u64;
                    self.demuxer.append(chunk, start)?;
                }
                Some(Err(error)) => {
                    return Err(FrameServeError::SourceFetchFailed {
                        url: self.source.clone(),
                        reason: error.to_string(),
                    });
                }
                None => {
                    log::debug!("Source {} ended after {} bytes", self.source, self.offset);
                    self.ended = true;
                    self.demuxer.flush();
                }
            }
        }
    }
}

impl<S, E> SampleSource for Ingest<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: Display + Send,
{
    fn next_event(
        &mut self,
    ) -> impl Future<Output = Result<Option<DemuxEvent>, FrameServeError>> + Send {
        self.pull()
    }

    fn select_track(&mut self, track_id: u32) -> Result<(), FrameServeError> {
        self.demuxer.set_extraction_track(track_id)
    }
}

/// Start fetching `url` and return an ingest over its body.
///
/// # Errors
///
/// Returns [`FrameServeError::SourceFetchFailed`] on transport failure or a
/// non-success status.
pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<Ingest<ByteStream>, FrameServeError> {
    let failed = |reason: String| FrameServeError::SourceFetchFailed {
        url: url.to_string(),
        reason,
    };

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|error| failed(error.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(failed(format!("server responded with {status}")));
    }

    match response.content_length() {
        Some(length) => log::info!("Fetching {url} ({length} bytes)"),
        None => log::info!("Fetching {url}"),
    }

    let stream: ByteStream = Box::pin(response.bytes_stream());
    Ok(Ingest::new(url, stream))
}
