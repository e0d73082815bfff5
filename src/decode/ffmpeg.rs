//! FFmpeg-backed decode session shared by the software and hardware engines

use ffmpeg_next as ff;
use ff::codec::{self, threading};
use ff::format::Pixel;
use once_cell::sync::OnceCell;
use tracing::{info, instrument, warn};

use super::{
    Capabilities, Codec, DecodeEngine, EngineSettings, PerformanceFlags, Picture, PictureStatus,
};
use crate::error::{DecodeError, SetupError};

static RUNTIME: OnceCell<Result<(), String>> = OnceCell::new();

/// Registers FFmpeg once per process and silences its own logging.
fn init_runtime() -> Result<(), SetupError> {
    RUNTIME
        .get_or_init(|| {
            ff::init().map_err(|e| e.to_string())?;
            ff::util::log::set_level(ff::util::log::Level::Quiet);
            Ok(())
        })
        .clone()
        .map_err(|reason| SetupError::EngineAllocationFailure {
            what: "ffmpeg runtime",
            reason,
        })
}

fn software_decoder_name(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "h264",
        Codec::H265 => "hevc",
        Codec::Mjpeg => "mjpeg",
    }
}

pub struct FfmpegEngine {
    decoder: ff::decoder::Video,
    /// Engine-owned picture the decoder writes into before it is copied to a slot
    frame: ff::frame::Video,
    name: &'static str,
}

impl FfmpegEngine {
    pub fn open_software(settings: &EngineSettings) -> Result<Self, SetupError> {
        init_runtime()?;

        let codec = ff::decoder::find_by_name(software_decoder_name(settings.codec)).ok_or(
            SetupError::UnsupportedCodec {
                codec: settings.codec,
                backend: "software",
            },
        )?;
        Self::open_with(codec, settings, "ffmpeg-software")
    }

    pub fn open_hardware(settings: &EngineSettings, candidates: &[&str]) -> Result<Self, SetupError> {
        init_runtime()?;

        for name in candidates {
            let Some(codec) = ff::decoder::find_by_name(name) else {
                continue;
            };
            info!("Found hardware decoder: {}", name);
            match Self::open_with(codec, settings, "ffmpeg-hardware") {
                Ok(engine) => return Ok(engine),
                Err(e) => warn!("Hardware decoder {} failed to open: {}", name, e),
            }
        }

        Err(SetupError::UnsupportedCodec {
            codec: settings.codec,
            backend: "hardware",
        })
    }

    fn open_with(
        codec: ff::Codec,
        settings: &EngineSettings,
        name: &'static str,
    ) -> Result<Self, SetupError> {
        let flags = settings.flags;
        let mut context = codec::Context::new_with_codec(codec);

        unsafe {
            let raw = context.as_mut_ptr();
            (*raw).width = settings.width as i32;
            (*raw).height = settings.height as i32;
            (*raw).pix_fmt = ff::ffi::AVPixelFormat::AV_PIX_FMT_YUV420P;
            if flags.contains(PerformanceFlags::DISABLE_LOOP_FILTER) {
                (*raw).skip_loop_filter = ff::ffi::AVDiscard::AVDISCARD_ALL;
            }
            if flags.contains(PerformanceFlags::FAST_DECODE) {
                (*raw).flags2 |= ff::ffi::AV_CODEC_FLAG2_FAST as i32;
            }
        }

        if flags.contains(PerformanceFlags::LOW_LATENCY_DECODE) {
            context.set_flags(codec::Flags::LOW_DELAY);
        }
        let kind = if flags.contains(PerformanceFlags::SLICE_THREADING) {
            threading::Type::Slice
        } else {
            threading::Type::Frame
        };
        context.set_threading(threading::Config {
            kind,
            count: settings.effective_threads(),
            ..Default::default()
        });

        let decoder = context
            .decoder()
            .open_as(codec)
            .and_then(|opened| opened.video())
            .map_err(|e| SetupError::EngineAllocationFailure {
                what: "decoder session",
                reason: e.to_string(),
            })?;

        info!(
            "{} engine ready: {:?} {}x{} @ {}fps, {:?}, {} thread(s)",
            name,
            settings.codec,
            settings.width,
            settings.height,
            settings.frame_rate,
            flags,
            settings.effective_threads()
        );

        Ok(Self {
            decoder,
            frame: ff::frame::Video::empty(),
            name,
        })
    }

    fn write_slot(&self, slot: &mut Picture) -> Result<(), DecodeError> {
        let frame = &self.frame;
        slot.try_resize(frame.width(), frame.height())
            .map_err(|e| DecodeError::Receive {
                engine: self.name,
                reason: e.to_string(),
            })?;

        match frame.format() {
            Pixel::YUV420P | Pixel::YUVJ420P => {
                for plane in 0..3 {
                    slot.copy_plane_from(plane, frame.data(plane), frame.stride(plane));
                }
            }
            // Accelerated decoders commonly hand back NV12
            Pixel::NV12 => {
                slot.copy_plane_from(0, frame.data(0), frame.stride(0));
                slot.copy_interleaved_chroma_from(frame.data(1), frame.stride(1));
            }
            other => {
                return Err(DecodeError::Receive {
                    engine: self.name,
                    reason: format!("unsupported output format {other:?}"),
                })
            }
        }
        Ok(())
    }
}

impl DecodeEngine for FfmpegEngine {
    fn name(&self) -> &'static str {
        self.name
    }

    #[instrument(skip_all, fields(len = coded.len()))]
    fn submit(&mut self, coded: &[u8]) -> Result<(), DecodeError> {
        let packet = ff::Packet::copy(coded);
        self.decoder
            .send_packet(&packet)
            .map_err(|e| DecodeError::Rejected {
                engine: self.name,
                reason: e.to_string(),
            })
    }

    fn try_take_picture(&mut self, slot: &mut Picture) -> Result<PictureStatus, DecodeError> {
        match self.decoder.receive_frame(&mut self.frame) {
            Ok(()) => {
                self.write_slot(slot)?;
                Ok(PictureStatus::Ready)
            }
            Err(ff::Error::Eof) => Ok(PictureStatus::NotReady),
            Err(ff::Error::Other { errno }) if errno == ff::util::error::EAGAIN => {
                Ok(PictureStatus::NotReady)
            }
            Err(e) => Err(DecodeError::Receive {
                engine: self.name,
                reason: e.to_string(),
            }),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::slices_per_frame(4)
            | Capabilities::REFERENCE_FRAME_INVALIDATION_AVC
            | Capabilities::REFERENCE_FRAME_INVALIDATION_HEVC
            | Capabilities::DIRECT_SUBMIT
    }
}
