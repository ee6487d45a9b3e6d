//! Pipeline and server configuration.
//!
//! [`StreamOptions`] is a builder that carries the tuning knobs of one frame
//! pipeline (sampling interval, queue sizes, boundary prefix) without
//! threading each of them through every function signature.
//! [`ServerConfig`] adds the listen address for the HTTP surface.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use frameserve::StreamOptions;
//!
//! let options = StreamOptions::new()
//!     .with_interval(Duration::from_millis(500))
//!     .with_sample_queue(16);
//! assert_eq!(options.interval_seconds(), 0.5);
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::FrameServeError;
use crate::schedule::MatchPolicy;

/// Default distance between two extracted frames.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Fixed part of the multipart boundary; a random suffix is appended per
/// request.
pub const DEFAULT_BOUNDARY_PREFIX: &str = "----VideoFrameBoundary";

const DEFAULT_SAMPLE_QUEUE: usize = 8;
const DEFAULT_OUTPUT_QUEUE: usize = 4;

/// Settings for one frame-extraction pipeline.
///
/// All fields have sensible defaults; a default-constructed value samples one
/// frame per second.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub(crate) interval: Duration,
    pub(crate) sample_queue: usize,
    pub(crate) output_queue: usize,
    pub(crate) boundary_prefix: String,
    pub(crate) match_policy: MatchPolicy,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            sample_queue: DEFAULT_SAMPLE_QUEUE,
            output_queue: DEFAULT_OUTPUT_QUEUE,
            boundary_prefix: DEFAULT_BOUNDARY_PREFIX.to_string(),
            match_policy: MatchPolicy::default(),
        }
    }

    /// Set the sampling interval.
    ///
    /// A zero interval is rejected later by [`validate`](Self::validate).
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the sampling interval from fractional seconds.
    ///
    /// # Errors
    ///
    /// Returns [`FrameServeError::InvalidInterval`] for zero, negative,
    /// non-finite, or unrepresentable values.
    pub fn with_interval_seconds(self, seconds: f64) -> Result<Self, FrameServeError> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(FrameServeError::InvalidInterval);
        }
        let interval =
            Duration::try_from_secs_f64(seconds).map_err(|_| FrameServeError::InvalidInterval)?;
        Ok(self.with_interval(interval))
    }

    /// Number of encoded samples buffered between ingest and decode.
    /// Clamped to a minimum of 1.
    #[must_use]
    pub fn with_sample_queue(mut self, capacity: usize) -> Self {
        self.sample_queue = capacity.max(1);
        self
    }

    /// Number of framed parts buffered ahead of the HTTP consumer.
    /// Clamped to a minimum of 1.
    #[must_use]
    pub fn with_output_queue(mut self, capacity: usize) -> Self {
        self.output_queue = capacity.max(1);
        self
    }

    /// Replace the fixed boundary prefix.
    #[must_use]
    pub fn with_boundary_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.boundary_prefix = prefix.into();
        self
    }

    /// Choose whether a target may emit more than one frame.
    #[must_use]
    pub fn with_match_policy(mut self, policy: MatchPolicy) -> Self {
        self.match_policy = policy;
        self
    }

    /// The sampling interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The sampling interval in seconds.
    pub fn interval_seconds(&self) -> f64 {
        self.interval.as_secs_f64()
    }

    /// The boundary prefix.
    pub fn boundary_prefix(&self) -> &str {
        &self.boundary_prefix
    }

    /// The duplicate-match policy.
    pub fn match_policy(&self) -> MatchPolicy {
        self.match_policy
    }

    /// Check that the options describe a runnable pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`FrameServeError::InvalidInterval`] if the interval is zero.
    pub fn validate(&self) -> Result<(), FrameServeError> {
        if self.interval.is_zero() {
            return Err(FrameServeError::InvalidInterval);
        }
        Ok(())
    }
}

/// Settings for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub bind: SocketAddr,
    /// Options applied to every request's pipeline.
    pub stream: StreamOptions,
}

impl ServerConfig {
    /// Create a server configuration with default stream options.
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            stream: StreamOptions::default(),
        }
    }

    /// Replace the per-request stream options.
    #[must_use]
    pub fn with_stream_options(mut self, stream: StreamOptions) -> Self {
        self.stream = stream;
        self
    }
}
