//! Software decode engines
//!
//! MJPEG is decoded in-process with `zune-jpeg`. H.264 and HEVC go through
//! FFmpeg's software decoders when the `ffmpeg` feature is enabled.

use tracing::{debug, info, instrument};
use zune_jpeg::JpegDecoder;

use super::{Capabilities, Codec, DecodeEngine, EngineSettings, Picture, PictureStatus};
use crate::error::{DecodeError, SetupError};

/// Open a software engine for `settings.codec`.
pub fn open(settings: &EngineSettings) -> Result<Box<dyn DecodeEngine>, SetupError> {
    match settings.codec {
        Codec::Mjpeg => Ok(Box::new(MjpegEngine::new(settings)?)),
        #[cfg(feature = "ffmpeg")]
        Codec::H264 | Codec::H265 => Ok(Box::new(super::ffmpeg::FfmpegEngine::open_software(
            settings,
        )?)),
        #[cfg(not(feature = "ffmpeg"))]
        codec => Err(SetupError::UnsupportedCodec {
            codec,
            backend: "software",
        }),
    }
}

/// Intra-only MJPEG engine.
///
/// Every coded picture decodes to exactly one picture, so `submit` decodes
/// into a packed scratch buffer and the following `try_take_picture`
/// converts it into the slot.
pub struct MjpegEngine {
    /// Packed RGB (or gray) output of the last decode
    scratch: Vec<u8>,
    pending: Option<PendingPicture>,
    /// Session size; larger frame headers are rejected before decoding
    max_width: usize,
    max_height: usize,
}

#[derive(Debug, Clone, Copy)]
struct PendingPicture {
    width: u32,
    height: u32,
    components: usize,
}

impl MjpegEngine {
    pub fn new(settings: &EngineSettings) -> Result<Self, SetupError> {
        let len = settings.width as usize * settings.height as usize * 3;
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(len)
            .map_err(|e| SetupError::EngineAllocationFailure {
                what: "mjpeg scratch buffer",
                reason: e.to_string(),
            })?;
        scratch.resize(len, 0);

        info!(
            "MJPEG software engine ready ({}x{} @ {}fps)",
            settings.width, settings.height, settings.frame_rate
        );

        Ok(Self {
            scratch,
            pending: None,
            max_width: settings.width as usize,
            max_height: settings.height as usize,
        })
    }

    fn rejected(reason: impl ToString) -> DecodeError {
        DecodeError::Rejected {
            engine: "mjpeg",
            reason: reason.to_string(),
        }
    }
}

impl DecodeEngine for MjpegEngine {
    fn name(&self) -> &'static str {
        "mjpeg"
    }

    #[instrument(skip_all, fields(len = coded.len()))]
    fn submit(&mut self, coded: &[u8]) -> Result<(), DecodeError> {
        // A picture nobody drained is replaced by the newer one
        self.pending = None;

        let mut decoder = JpegDecoder::new(coded);
        decoder.decode_headers().map_err(Self::rejected)?;

        let (width, height) = decoder
            .dimensions()
            .ok_or_else(|| Self::rejected("missing frame header"))?;
        if width > self.max_width || height > self.max_height {
            return Err(Self::rejected(format!(
                "{width}x{height} exceeds session size {}x{}",
                self.max_width, self.max_height
            )));
        }
        let size = decoder
            .output_buffer_size()
            .ok_or_else(|| Self::rejected("unknown output size"))?;
        let pixels = width * height;
        if pixels == 0 || size % pixels != 0 {
            return Err(Self::rejected(format!(
                "unexpected output size {size} for {width}x{height}"
            )));
        }

        if self.scratch.len() < size {
            debug!("Growing MJPEG scratch buffer to {} bytes", size);
            self.scratch
                .try_reserve_exact(size - self.scratch.len())
                .map_err(Self::rejected)?;
            self.scratch.resize(size, 0);
        }
        decoder
            .decode_into(&mut self.scratch[..size])
            .map_err(Self::rejected)?;

        self.pending = Some(PendingPicture {
            width: width as u32,
            height: height as u32,
            components: size / pixels,
        });
        Ok(())
    }

    fn try_take_picture(&mut self, slot: &mut Picture) -> Result<PictureStatus, DecodeError> {
        let Some(pending) = self.pending.take() else {
            return Ok(PictureStatus::NotReady);
        };

        slot.try_resize(pending.width, pending.height)
            .map_err(|e| DecodeError::Receive {
                engine: "mjpeg",
                reason: e.to_string(),
            })?;
        slot.fill_from_packed(&self.scratch, pending.components);
        Ok(PictureStatus::Ready)
    }

    fn capabilities(&self) -> Capabilities {
        // Intra-only: no reference frames to invalidate
        Capabilities::DIRECT_SUBMIT
    }
}

#[cfg(test)]
mod tests {
    use image::codecs::jpeg::JpegEncoder;
    use image::ExtendedColorType;

    use super::*;
    use crate::decode::PerformanceFlags;

    fn settings() -> EngineSettings {
        EngineSettings {
            codec: Codec::Mjpeg,
            width: 32,
            height: 16,
            frame_rate: 30,
            flags: PerformanceFlags::empty(),
            threads: 1,
        }
    }

    fn gray_jpeg(width: u32, height: u32, level: u8) -> Vec<u8> {
        let rgb = vec![level; (width * height * 3) as usize];
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 95)
            .encode(&rgb, width, height, ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn one_picture_per_submission() {
        let mut engine = MjpegEngine::new(&settings()).unwrap();
        let mut slot = Picture::allocate(32, 16);

        assert_eq!(
            engine.try_take_picture(&mut slot).unwrap(),
            PictureStatus::NotReady
        );

        engine.submit(&gray_jpeg(32, 16, 128)).unwrap();
        assert_eq!(
            engine.try_take_picture(&mut slot).unwrap(),
            PictureStatus::Ready
        );
        assert_eq!(
            engine.try_take_picture(&mut slot).unwrap(),
            PictureStatus::NotReady
        );

        assert_eq!((slot.width(), slot.height()), (32, 16));
        // Mid gray lands near the middle of limited-range luma
        assert!(slot.plane(0).iter().all(|&y| (120..=132).contains(&y)));
        assert!(slot.plane(1).iter().all(|&u| (124..=132).contains(&u)));
    }

    #[test]
    fn picture_takes_stream_dimensions() {
        let mut engine = MjpegEngine::new(&settings()).unwrap();
        let mut slot = Picture::allocate(32, 16);

        engine.submit(&gray_jpeg(16, 8, 10)).unwrap();
        engine.try_take_picture(&mut slot).unwrap();
        assert_eq!((slot.width(), slot.height()), (16, 8));
    }

    /// Rewrite the baseline frame header to claim `width` x `height`
    fn patch_frame_size(jpeg: &mut [u8], width: u16, height: u16) {
        let sof = jpeg
            .windows(2)
            .position(|w| w == [0xFF, 0xC0])
            .expect("baseline frame header");
        // marker(2) length(2) precision(1) height(2) width(2)
        jpeg[sof + 5..sof + 7].copy_from_slice(&height.to_be_bytes());
        jpeg[sof + 7..sof + 9].copy_from_slice(&width.to_be_bytes());
    }

    #[test]
    fn oversized_frame_header_is_rejected_without_growing() {
        let mut engine = MjpegEngine::new(&settings()).unwrap();
        let mut slot = Picture::allocate(32, 16);
        let scratch_len = engine.scratch.len();

        let mut jpeg = gray_jpeg(16, 16, 50);
        patch_frame_size(&mut jpeg, 8000, 8000);

        let err = engine.submit(&jpeg).unwrap_err();
        assert!(matches!(err, DecodeError::Rejected { engine: "mjpeg", .. }));
        assert_eq!(engine.scratch.len(), scratch_len);
        assert_eq!(
            engine.try_take_picture(&mut slot).unwrap(),
            PictureStatus::NotReady
        );
        assert_eq!((slot.width(), slot.height()), (32, 16));

        // Either axis alone is enough to reject
        let mut wide = gray_jpeg(16, 16, 50);
        patch_frame_size(&mut wide, 33, 16);
        assert!(engine.submit(&wide).is_err());
    }

    #[test]
    fn garbage_is_rejected_without_output() {
        let mut engine = MjpegEngine::new(&settings()).unwrap();
        let mut slot = Picture::allocate(32, 16);

        let err = engine.submit(&[0x00, 0x01, 0x02, 0x03]).unwrap_err();
        assert!(matches!(err, DecodeError::Rejected { engine: "mjpeg", .. }));
        assert_eq!(
            engine.try_take_picture(&mut slot).unwrap(),
            PictureStatus::NotReady
        );
    }
}
