//! Bitstream decoding.
//!
//! [`FrameDecoder`] is the narrow contract the decode coordinator relies on:
//! feed one compressed sample at a time, in stream order, and learn whether
//! a picture is ready. [`FfmpegDecoder`] implements it for H.264 and H.265
//! with `ffmpeg-next`.

use ffmpeg_next::{
    Packet,
    codec::{self, context::Context as CodecContext},
    decoder::Video as VideoDecoder,
    format::Pixel,
    frame::Video as VideoFrame,
    software::scaling::{Context as ScalingContext, Flags as ScalingFlags},
};

use crate::conversion::pack_planes;
use crate::error::FrameServeError;
use crate::metadata::{EncodedSample, TrackInfo, VideoCodec};

/// Result of feeding one sample to a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// A complete picture is available via [`FrameDecoder::picture`].
    PictureReady,
    /// The decoder needs more input before it can produce a picture.
    NeedMoreInput,
}

/// A decoded picture in tight planar 4:2:0 layout.
///
/// Borrowed from the decoder and superseded by the next call to
/// [`FrameDecoder::decode`].
#[derive(Debug, Clone, Copy)]
pub struct DecodedPicture<'a> {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// `[Y][U][V]` planes, see [`planar_len`](crate::conversion::planar_len).
    pub planar: &'a [u8],
}

/// A stateful decoder fed one sample at a time.
///
/// Implementations keep reference-frame state between calls, so every
/// sample of the track must be fed in decode order, whether or not its
/// picture is wanted.
pub trait FrameDecoder {
    /// Feed one compressed sample.
    ///
    /// A sample the decoder cannot use is not an error; it reports
    /// [`DecodeStatus::NeedMoreInput`].
    fn decode(&mut self, sample: &EncodedSample) -> Result<DecodeStatus, FrameServeError>;

    /// The picture produced by the most recent [`decode`](Self::decode)
    /// call, if it returned [`DecodeStatus::PictureReady`].
    fn picture(&self) -> Option<DecodedPicture<'_>>;
}

struct Scaler {
    context: ScalingContext,
    format: Pixel,
    width: u32,
    height: u32,
}

/// FFmpeg-backed H.264 / H.265 decoder.
///
/// Runs single-threaded in low-delay mode so each picture belongs to the
/// sample that was just fed. Pictures in formats other than 4:2:0 planar are
/// converted with `swscale` first.
pub struct FfmpegDecoder {
    decoder: VideoDecoder,
    decoded: VideoFrame,
    converted: VideoFrame,
    scaler: Option<Scaler>,
    planar: Vec<u8>,
    width: u32,
    height: u32,
    ready: bool,
}

impl FfmpegDecoder {
    /// Create a decoder for a video track.
    ///
    /// # Errors
    ///
    /// - [`FrameServeError::UnsupportedCodec`] if the track's codec has no
    ///   decoder.
    /// - [`FrameServeError::DecoderInit`] if FFmpeg cannot be initialised or
    ///   the decoder cannot be opened.
    pub fn new(track: &TrackInfo) -> Result<Self, FrameServeError> {
        let codec = track
            .video_codec()
            .ok_or_else(|| FrameServeError::UnsupportedCodec(track.codec.clone()))?;

        ffmpeg_next::init().map_err(|error| {
            FrameServeError::DecoderInit(format!("FFmpeg initialisation failed: {error}"))
        })?;

        let codec_id = match codec {
            VideoCodec::H264 => codec::Id::H264,
            VideoCodec::H265 => codec::Id::HEVC,
        };
        let ffmpeg_codec = codec::decoder::find(codec_id)
            .ok_or_else(|| FrameServeError::UnsupportedCodec(format!("{codec_id:?}")))?;

        let mut context = CodecContext::new_with_codec(ffmpeg_codec);
        context.set_flags(codec::Flags::LOW_DELAY);

        // Extradata must be in place before the decoder is opened.
        unsafe {
            let raw = context.as_mut_ptr();
            (*raw).thread_count = 1;

            if let Some(config) = &track.decoder_config {
                let size = extradata_size(config.len())?;
                let padded = config.len() + ffmpeg_sys_next::AV_INPUT_BUFFER_PADDING_SIZE as usize;
                let extradata = ffmpeg_sys_next::av_mallocz(padded) as *mut u8;
                if extradata.is_null() {
                    return Err(FrameServeError::DecoderInit(
                        "could not allocate codec extradata".to_string(),
                    ));
                }
                std::ptr::copy_nonoverlapping(config.as_ptr(), extradata, config.len());
                (*raw).extradata = extradata;
                (*raw).extradata_size = size;
            }
        }

        let decoder = context
            .decoder()
            .video()
            .map_err(|error| FrameServeError::DecoderInit(error.to_string()))?;

        log::debug!(
            "Opened {codec:?} decoder for track {} ({}x{})",
            track.id,
            track.width,
            track.height
        );

        Ok(Self {
            decoder,
            decoded: VideoFrame::empty(),
            converted: VideoFrame::empty(),
            scaler: None,
            planar: Vec::new(),
            width: 0,
            height: 0,
            ready: false,
        })
    }

    fn store_picture(&mut self) -> Result<(), FrameServeError> {
        let width = self.decoded.width();
        let height = self.decoded.height();
        let format = self.decoded.format();

        let frame = if matches!(format, Pixel::YUV420P | Pixel::YUVJ420P) {
            &self.decoded
        } else {
            self.ensure_scaler(format, width, height)?;
            if let Some(scaler) = self.scaler.as_mut() {
                scaler.context.run(&self.decoded, &mut self.converted)?;
            }
            &self.converted
        };

        self.planar = pack_planes(
            [
                (frame.data(0), frame.stride(0)),
                (frame.data(1), frame.stride(1)),
                (frame.data(2), frame.stride(2)),
            ],
            width,
            height,
        )?;
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn ensure_scaler(&mut self, format: Pixel, width: u32, height: u32) -> Result<(), FrameServeError> {
        let current = self
            .scaler
            .as_ref()
            .is_some_and(|s| s.format == format && s.width == width && s.height == height);
        if current {
            return Ok(());
        }

        log::debug!("Converting decoded {format:?} pictures to YUV420P");
        let context = ScalingContext::get(
            format,
            width,
            height,
            Pixel::YUV420P,
            width,
            height,
            ScalingFlags::BILINEAR,
        )?;
        self.scaler = Some(Scaler {
            context,
            format,
            width,
            height,
        });
        Ok(())
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn decode(&mut self, sample: &EncodedSample) -> Result<DecodeStatus, FrameServeError> {
        self.ready = false;

        let mut packet = Packet::copy(&sample.data);
        packet.set_pts(Some(sample.timestamp));
        packet.set_dts(Some(sample.decode_timestamp));

        if let Err(error) = self.decoder.send_packet(&packet) {
            log::warn!("Decoder rejected sample at tick {}: {error}", sample.timestamp);
            return Ok(DecodeStatus::NeedMoreInput);
        }

        while self.decoder.receive_frame(&mut self.decoded).is_ok() {
            self.store_picture()?;
            self.ready = true;
        }

        Ok(if self.ready {
            DecodeStatus::PictureReady
        } else {
            DecodeStatus::NeedMoreInput
        })
    }

    fn picture(&self) -> Option<DecodedPicture<'_>> {
        self.ready.then(|| DecodedPicture {
            width: self.width,
            height: self.height,
            planar: &self.planar,
        })
    }
}

/// FFmpeg stores the extradata length as a C `int`.
fn extradata_size(len: usize) -> Result<i32, FrameServeError> {
    i32::try_from(len).map_err(|_| {
        FrameServeError::DecoderInit(format!("decoder configuration of {len} bytes is too large"))
    })
}
