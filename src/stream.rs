//! The per-request frame pipeline.
//!
//! [`spawn_pipeline`] wires one source, one decoder and one image encoder
//! into a [`FrameStream`]. Two tasks run per request:
//!
//! - an async ingest task that pulls demux events from the source and
//!   forwards the selected track's samples through a bounded channel;
//! - a decode worker on `tokio::task::spawn_blocking` that owns the decoder,
//!   the schedule and the packager, and writes framed parts to the output
//!   channel through a [`FrameWriter`].
//!
//! Both channels are bounded, so a slow HTTP consumer stalls decoding, which
//! in turn stalls reading from the network. Dropping the [`FrameStream`]
//! makes the next write fail; the worker then stops and the ingest task
//! drops the source.
//!
//! # Example
//!
//! ```no_run
//! use tokio_stream::StreamExt;
//!
//! use frameserve::{
//!     FfmpegDecoder, FrameServeError, PngEncoder, StreamOptions, ingest, spawn_pipeline,
//! };
//!
//! # async fn example() -> Result<(), FrameServeError> {
//! let client = reqwest::Client::new();
//! let url = "https://example.com/clip.mp4".to_string();
//! let mut stream = spawn_pipeline(
//!     async move { ingest::fetch(&client, &url).await },
//!     FfmpegDecoder::new,
//!     PngEncoder,
//!     &StreamOptions::new(),
//! );
//!
//! while let Some(chunk) = stream.next().await {
//!     let bytes = chunk?;
//!     println!("{} bytes", bytes.len());
//! }
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_stream::Stream;

use crate::configuration::StreamOptions;
use crate::decoder::FrameDecoder;
use crate::demux::DemuxEvent;
use crate::encode::ImageEncoder;
use crate::error::FrameServeError;
use crate::extract::DecodeCoordinator;
use crate::ingest::SampleSource;
use crate::metadata::{EncodedSample, TrackInfo};
use crate::multipart::{Boundary, FramePackager};
use crate::schedule::FrameSchedule;

type Chunk = Result<Bytes, FrameServeError>;

/// Lifecycle of the output channel.
///
/// `Open -> Writing -> Closed`, or `Open | Writing -> Aborted`. Both end
/// states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing written yet.
    Open,
    /// At least one chunk written.
    Writing,
    /// Terminated normally.
    Closed,
    /// Terminated by an error.
    Aborted,
}

impl StreamState {
    /// Returns `true` for [`Closed`](Self::Closed) and
    /// [`Aborted`](Self::Aborted).
    pub fn is_finished(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Aborted)
    }
}

/// Blocking writer for the output channel, owned by the decode worker.
///
/// Every method blocks the calling thread, so it must not be used from
/// async code.
///
/// [`close`](Self::close) and [`abort`](Self::abort) consume the writer, so
/// the stream ends exactly once. A writer dropped while still open aborts
/// the stream.
pub struct FrameWriter {
    sender: Sender<Chunk>,
    state: StreamState,
    bytes_written: u64,
}

impl FrameWriter {
    fn new(sender: Sender<Chunk>) -> Self {
        Self {
            sender,
            state: StreamState::Open,
            bytes_written: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Total bytes handed to the consumer.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write one chunk, blocking while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`FrameServeError::OutputClosed`] if the consumer has gone
    /// away. The writer is then aborted and accepts no further writes.
    pub fn write(&mut self, chunk: Bytes) -> Result<(), FrameServeError> {
        if self.state.is_finished() {
            return Err(FrameServeError::OutputClosed);
        }

        let length = chunk.len() as u64;
        if self.sender.blocking_send(Ok(chunk)).is_err() {
            self.state = StreamState::Aborted;
            return Err(FrameServeError::OutputClosed);
        }
        self.state = StreamState::Writing;
        self.bytes_written += length;
        Ok(())
    }

    /// Write the terminator and end the stream normally.
    pub fn close(mut self, terminator: Bytes) -> Result<(), FrameServeError> {
        let result = self.write(terminator);
        if result.is_ok() {
            self.state = StreamState::Closed;
        }
        result
    }

    /// End the stream with `error`; the consumer sees it instead of a
    /// terminator.
    pub fn abort(mut self, error: FrameServeError) {
        self.send_abort(error);
    }

    fn send_abort(&mut self, error: FrameServeError) {
        if !self.state.is_finished() {
            // The consumer may already be gone.
            let _ = self.sender.blocking_send(Err(error));
            self.state = StreamState::Aborted;
        }
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        if !self.state.is_finished() {
            log::warn!("Frame writer dropped before the stream ended");
            self.send_abort(FrameServeError::Io(std::io::Error::other(
                "frame pipeline stopped unexpectedly",
            )));
        }
    }
}

/// The body of one response: multipart chunks produced in the background.
///
/// Implements [`tokio_stream::Stream`]. The final item is either the
/// terminating boundary (normal end) or an error (abort).
pub struct FrameStream {
    receiver: Receiver<Chunk>,
    boundary: Boundary,
}

impl FrameStream {
    /// The boundary delimiting this stream's parts.
    pub fn boundary(&self) -> &Boundary {
        &self.boundary
    }

    /// Value for the response's `Content-Type` header.
    pub fn content_type(&self) -> String {
        self.boundary.content_type()
    }
}

impl Stream for FrameStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

enum WorkerEvent {
    Track(TrackInfo),
    Sample(EncodedSample),
    End,
}

/// Start a pipeline and return its output stream immediately.
///
/// `open` resolves to the source; it runs inside the ingest task, so a
/// failing fetch surfaces as an aborted stream rather than delaying the
/// caller. `make_decoder` is called on the worker thread once the video
/// track is known.
///
/// Must be called from within a Tokio runtime.
pub fn spawn_pipeline<O, S, F, D, E>(
    open: O,
    make_decoder: F,
    encoder: E,
    options: &StreamOptions,
) -> FrameStream
where
    O: Future<Output = Result<S, FrameServeError>> + Send + 'static,
    S: SampleSource,
    F: FnOnce(&TrackInfo) -> Result<D, FrameServeError> + Send + 'static,
    D: FrameDecoder,
    E: ImageEncoder + Send + 'static,
{
    let boundary = Boundary::generate(&options.boundary_prefix);
    let (events_tx, events_rx) = mpsc::channel(options.sample_queue);
    let (output_tx, output_rx) = mpsc::channel(options.output_queue);

    tokio::spawn(run_ingest(open, events_tx));

    let packager = FramePackager::new(boundary.clone());
    let options = options.clone();
    tokio::task::spawn_blocking(move || {
        let mut writer = FrameWriter::new(output_tx);
        match decode_blocking(events_rx, make_decoder, encoder, &options, packager, &mut writer) {
            Ok(terminator) => {
                if writer.close(terminator).is_err() {
                    log::info!("Consumer disconnected before the terminator");
                }
            }
            Err(FrameServeError::OutputClosed) => {
                log::info!("Consumer disconnected, stopping extraction");
                writer.abort(FrameServeError::OutputClosed);
            }
            Err(error) => {
                log::error!("Frame extraction failed: {error}");
                writer.abort(error);
            }
        }
    });

    FrameStream {
        receiver: output_rx,
        boundary,
    }
}

async fn run_ingest<O, S>(open: O, events: Sender<Result<WorkerEvent, FrameServeError>>)
where
    O: Future<Output = Result<S, FrameServeError>>,
    S: SampleSource,
{
    if let Err(error) = forward_events(open, &events).await {
        // The worker may already have stopped.
        let _ = events.send(Err(error)).await;
    }
}

async fn forward_events<O, S>(
    open: O,
    events: &Sender<Result<WorkerEvent, FrameServeError>>,
) -> Result<(), FrameServeError>
where
    O: Future<Output = Result<S, FrameServeError>>,
    S: SampleSource,
{
    let mut source = open.await?;

    while let Some(event) = source.next_event().await? {
        let event = match event {
            DemuxEvent::Ready(movie) => {
                let track = movie
                    .video_track()
                    .cloned()
                    .ok_or(FrameServeError::NoCompatibleTrack)?;
                log::info!(
                    "Selected track {} ({}, {}x{}, {:.2}s, {} samples)",
                    track.id,
                    track.codec,
                    track.width,
                    track.height,
                    track.duration_seconds(),
                    track.sample_count
                );
                source.select_track(track.id)?;
                WorkerEvent::Track(track)
            }
            DemuxEvent::Sample(sample) => WorkerEvent::Sample(sample),
        };

        if events.send(Ok(event)).await.is_err() {
            log::debug!("Decode worker stopped, releasing source");
            return Ok(());
        }
    }

    let _ = events.send(Ok(WorkerEvent::End)).await;
    Ok(())
}

/// Background decode loop, runs on a blocking thread. Returns the
/// terminator to write on success.
fn decode_blocking<F, D, E>(
    mut events: Receiver<Result<WorkerEvent, FrameServeError>>,
    make_decoder: F,
    encoder: E,
    options: &StreamOptions,
    packager: FramePackager,
    writer: &mut FrameWriter,
) -> Result<Bytes, FrameServeError>
where
    F: FnOnce(&TrackInfo) -> Result<D, FrameServeError>,
    D: FrameDecoder,
    E: ImageEncoder,
{
    let track = match events.blocking_recv() {
        Some(Ok(WorkerEvent::Track(track))) => track,
        Some(Ok(WorkerEvent::Sample(_))) => {
            return Err(FrameServeError::Demux(
                "sample delivered before the track was known".to_string(),
            ));
        }
        Some(Ok(WorkerEvent::End)) => {
            return Err(FrameServeError::Demux(
                "input ended before the container index was found".to_string(),
            ));
        }
        Some(Err(error)) => return Err(error),
        None => return Err(unexpected_stop()),
    };

    let schedule = FrameSchedule::new(
        track.duration,
        track.time_base,
        options.interval,
        options.match_policy,
    );
    log::info!(
        "Sampling {} frames every {:.2}s",
        schedule.len(),
        options.interval_seconds()
    );

    let decoder = make_decoder(&track)?;
    let mut coordinator = DecodeCoordinator::new(decoder, encoder, schedule, packager, track.id);

    loop {
        match events.blocking_recv() {
            Some(Ok(WorkerEvent::Sample(sample))) => {
                if let Some(chunk) = coordinator.process(&sample)? {
                    writer.write(chunk)?;
                }
            }
            Some(Ok(WorkerEvent::Track(_))) => {
                log::warn!("Ignoring repeated track announcement");
            }
            Some(Ok(WorkerEvent::End)) => break,
            Some(Err(error)) => return Err(error),
            None => return Err(unexpected_stop()),
        }
    }

    log::info!(
        "Extracted {} frames from {} samples ({} of {} targets)",
        coordinator.frames_emitted(),
        coordinator.samples_decoded(),
        coordinator.schedule().claimed_count(),
        coordinator.schedule().len()
    );
    Ok(coordinator.terminator())
}

fn unexpected_stop() -> FrameServeError {
    FrameServeError::Io(std::io::Error::other("ingest task stopped unexpectedly"))
}
