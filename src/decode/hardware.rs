//! Hardware-accelerated decode engines.
//!
//! Accelerated decoders are probed by name (CUDA, QSV, V4L2 mem2mem) and the
//! first one FFmpeg knows about wins. Without the `ffmpeg` feature there is
//! no accelerated backend and every codec is unsupported.

use super::{Codec, DecodeEngine, EngineSettings};
use crate::error::SetupError;

/// Accelerated decoder names to probe for `codec`, in preference order
pub fn accelerated_decoder_names(codec: Codec) -> &'static [&'static str] {
    match codec {
        Codec::H264 => &["h264_cuvid", "h264_qsv", "h264_v4l2m2m"],
        Codec::H265 => &["hevc_cuvid", "hevc_qsv", "hevc_v4l2m2m"],
        Codec::Mjpeg => &["mjpeg_cuvid", "mjpeg_qsv"],
    }
}

/// Open the first available accelerated engine for `settings.codec`.
#[cfg(feature = "ffmpeg")]
pub fn open(settings: &EngineSettings) -> Result<Box<dyn DecodeEngine>, SetupError> {
    Ok(Box::new(super::ffmpeg::FfmpegEngine::open_hardware(
        settings,
        accelerated_decoder_names(settings.codec),
    )?))
}

#[cfg(not(feature = "ffmpeg"))]
pub fn open(settings: &EngineSettings) -> Result<Box<dyn DecodeEngine>, SetupError> {
    tracing::debug!(
        "No accelerated decoders compiled in, candidates were {:?}",
        accelerated_decoder_names(settings.codec)
    );
    Err(SetupError::UnsupportedCodec {
        codec: settings.codec,
        backend: "hardware",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_codec_has_candidates() {
        for codec in [Codec::H264, Codec::H265, Codec::Mjpeg] {
            let names = accelerated_decoder_names(codec);
            assert!(!names.is_empty());
            assert!(names.iter().all(|n| !n.contains("nvenc")));
        }
    }
}
