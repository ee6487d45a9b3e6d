//! Multipart framing of extracted frames.
//!
//! Each frame travels as one self-delimited part:
//!
//! ```text
//! --<boundary>\r\n
//! Content-Disposition: form-data; name="frame"; filename="frame_<index>_<seconds>s.png"\r\n
//! Content-Type: image/png\r\n
//! \r\n
//! <image bytes>\r\n
//! ```
//!
//! and the stream ends with `--<boundary>--\r\n`. Payload bytes are never
//! escaped; the boundary carries 122 random bits so a collision with image
//! data is not a practical concern.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

const CRLF: &[u8] = b"\r\n";

/// A per-request multipart boundary token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary(String);

impl Boundary {
    /// Generate a fresh boundary: `prefix` followed by a random v4 UUID in
    /// hex.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}{}", Uuid::new_v4().simple()))
    }

    /// Use a fixed boundary token.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The bare token, without leading dashes.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value of the response `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.0)
    }
}

/// Format a presentation time in seconds for use in a part label.
pub fn format_seconds(seconds: f64) -> String {
    format!("{seconds:.2}")
}

/// Frame one payload as a multipart part.
pub fn encode_part(
    boundary: &Boundary,
    index: u64,
    seconds: f64,
    content_type: &str,
    extension: &str,
    payload: &[u8],
) -> Bytes {
    let headers = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"frame\"; filename=\"frame_{index}_{label}s.{extension}\"\r\n\
         Content-Type: {content_type}\r\n\
         \r\n",
        boundary = boundary.as_str(),
        label = format_seconds(seconds),
    );

    let mut part = BytesMut::with_capacity(headers.len() + payload.len() + CRLF.len());
    part.put_slice(headers.as_bytes());
    part.put_slice(payload);
    part.put_slice(CRLF);
    part.freeze()
}

/// The closing delimiter written once after the last part.
pub fn encode_terminator(boundary: &Boundary) -> Bytes {
    Bytes::from(format!("--{}--\r\n", boundary.as_str()))
}

/// Assigns sequential frame indices and frames encoded images.
///
/// One packager exists per request; the frame counter is never shared.
#[derive(Debug)]
pub struct FramePackager {
    boundary: Boundary,
    next_index: u64,
}

impl FramePackager {
    /// Create a packager that frames parts with `boundary`.
    pub fn new(boundary: Boundary) -> Self {
        Self {
            boundary,
            next_index: 0,
        }
    }

    /// The request's boundary.
    pub fn boundary(&self) -> &Boundary {
        &self.boundary
    }

    /// Number of parts produced so far.
    pub fn frames_packaged(&self) -> u64 {
        self.next_index
    }

    /// Frame an encoded image presented at `seconds`, consuming the next
    /// frame index.
    pub fn package(
        &mut self,
        seconds: f64,
        content_type: &str,
        extension: &str,
        image: &[u8],
    ) -> Bytes {
        let index = self.next_index;
        self.next_index += 1;
        encode_part(&self.boundary, index, seconds, content_type, extension, image)
    }

    /// The terminating marker.
    pub fn terminator(&self) -> Bytes {
        encode_terminator(&self.boundary)
    }
}
