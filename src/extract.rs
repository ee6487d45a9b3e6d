//! Per-sample decode and frame selection.
//!
//! [`DecodeCoordinator`] sits between the demuxer and the output stream. It
//! feeds every sample of the selected track to the decoder, and whenever a
//! picture is ready for a sample that falls inside a target window it runs
//! colour conversion, image compression and multipart framing.

use bytes::Bytes;

use crate::conversion::yuv420_to_rgb;
use crate::decoder::{DecodeStatus, FrameDecoder};
use crate::encode::ImageEncoder;
use crate::error::FrameServeError;
use crate::metadata::EncodedSample;
use crate::multipart::FramePackager;
use crate::schedule::FrameSchedule;

/// Drives one decoder for one request.
///
/// Owns the request's [`FramePackager`], so the frame counter and boundary
/// never leak between requests.
pub struct DecodeCoordinator<D, E> {
    decoder: D,
    encoder: E,
    schedule: FrameSchedule,
    packager: FramePackager,
    track_id: u32,
    samples_decoded: u64,
}

impl<D: FrameDecoder, E: ImageEncoder> DecodeCoordinator<D, E> {
    /// Create a coordinator for samples of `track_id`.
    pub fn new(
        decoder: D,
        encoder: E,
        schedule: FrameSchedule,
        packager: FramePackager,
        track_id: u32,
    ) -> Self {
        Self {
            decoder,
            encoder,
            schedule,
            packager,
            track_id,
            samples_decoded: 0,
        }
    }

    /// The target schedule.
    pub fn schedule(&self) -> &FrameSchedule {
        &self.schedule
    }

    /// Number of samples fed to the decoder.
    pub fn samples_decoded(&self) -> u64 {
        self.samples_decoded
    }

    /// Number of multipart parts produced.
    pub fn frames_emitted(&self) -> u64 {
        self.packager.frames_packaged()
    }

    /// Feed one sample and return the framed part it produced, if any.
    ///
    /// Samples of other tracks are ignored. Every sample of the selected
    /// track reaches the decoder, matched or not, because later pictures
    /// depend on it.
    ///
    /// # Errors
    ///
    /// Decoder, conversion and encoding failures are fatal for the request.
    pub fn process(&mut self, sample: &EncodedSample) -> Result<Option<Bytes>, FrameServeError> {
        if sample.track_id != self.track_id {
            return Ok(None);
        }

        let target = self.schedule.match_target(sample.timestamp);
        let status = self.decoder.decode(sample)?;
        self.samples_decoded += 1;

        let Some(target) = target else {
            return Ok(None);
        };
        if status != DecodeStatus::PictureReady {
            log::debug!(
                "No picture for sample at {:.3}s, target {target} left open",
                sample.seconds()
            );
            return Ok(None);
        }
        let Some(picture) = self.decoder.picture() else {
            return Ok(None);
        };

        let (width, height) = (picture.width, picture.height);
        let rgb = yuv420_to_rgb(picture.planar, width, height)?;
        let image = self.encoder.encode(rgb, width, height)?;

        self.schedule.claim(target);
        let chunk = self.packager.package(
            sample.seconds(),
            self.encoder.content_type(),
            self.encoder.extension(),
            &image,
        );
        log::debug!(
            "Emitted frame {} at {:.3}s ({} bytes)",
            self.packager.frames_packaged() - 1,
            sample.seconds(),
            chunk.len()
        );
        Ok(Some(chunk))
    }

    /// The terminating multipart marker for this request.
    pub fn terminator(&self) -> Bytes {
        self.packager.terminator()
    }
}
