pub mod adapter;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod hardware;
pub mod picture;
pub mod software;

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DecodeError, SetupError};

pub use adapter::DecodeAdapter;
pub use picture::{Picture, PictureMetadata, PixelFormat};

/// Codecs a decode engine can be asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
    /// Intra-only motion JPEG
    Mjpeg,
}

/// Which decode engine variant to bring up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Software,
    Hardware,
    /// Hardware when available, software otherwise
    Auto,
}

/// Decode policy knobs, fixed at setup
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerformanceFlags(u32);

impl PerformanceFlags {
    /// Skip the in-loop deblocking filter (speed over quality)
    pub const DISABLE_LOOP_FILTER: Self = Self(0x1);
    /// One picture in, one picture out; disables decoder threading
    pub const LOW_LATENCY_DECODE: Self = Self(0x2);
    /// Threads work on slices rather than whole frames
    pub const SLICE_THREADING: Self = Self(0x4);
    /// Nonstandard speedup tricks
    pub const FAST_DECODE: Self = Self(0x8);
    /// Renderer should scale with bilinear instead of bicubic
    pub const BILINEAR_FILTERING: Self = Self(0x10);
    /// Cheaper bilinear scaling at lower quality
    pub const FAST_BILINEAR_FILTERING: Self = Self(0x20);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PerformanceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PerformanceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PerformanceFlags, &str); 6] = [
            (PerformanceFlags::DISABLE_LOOP_FILTER, "DISABLE_LOOP_FILTER"),
            (PerformanceFlags::LOW_LATENCY_DECODE, "LOW_LATENCY_DECODE"),
            (PerformanceFlags::SLICE_THREADING, "SLICE_THREADING"),
            (PerformanceFlags::FAST_DECODE, "FAST_DECODE"),
            (PerformanceFlags::BILINEAR_FILTERING, "BILINEAR_FILTERING"),
            (
                PerformanceFlags::FAST_BILINEAR_FILTERING,
                "FAST_BILINEAR_FILTERING",
            ),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "PerformanceFlags({})", set.join(" | "))
    }
}

/// What submission granularity and recovery features an engine supports.
/// The data source reads this once after setup to shape decode units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities(u32);

impl Capabilities {
    /// Decode units may be submitted straight from the receive path
    pub const DIRECT_SUBMIT: Self = Self(0x1);
    pub const REFERENCE_FRAME_INVALIDATION_AVC: Self = Self(0x2);
    pub const REFERENCE_FRAME_INVALIDATION_HEVC: Self = Self(0x4);

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Encoder may split each picture into `slices` slices
    pub const fn slices_per_frame(slices: u8) -> Self {
        Self((slices as u32) << 24)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn slices(self) -> u8 {
        (self.0 >> 24) as u8
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Everything an engine needs to open a session
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub flags: PerformanceFlags,
    pub threads: usize,
}

impl EngineSettings {
    /// Decoder thread count after applying the low latency policy
    pub fn effective_threads(&self) -> usize {
        if self.flags.contains(PerformanceFlags::LOW_LATENCY_DECODE) {
            1
        } else {
            self.threads.max(1)
        }
    }
}

/// Outcome of a non-blocking poll for decoded output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureStatus {
    /// A picture was written into the provided slot
    Ready,
    /// The engine needs more input first
    NotReady,
}

/// The contract every decode engine variant implements.
///
/// Engines are driven from a single decode thread; `Send` lets the owning
/// pipeline move to that thread after setup. Dropping the engine releases
/// its session.
pub trait DecodeEngine: Send {
    fn name(&self) -> &'static str;

    /// Hand one contiguous coded picture to the engine.
    fn submit(&mut self, coded: &[u8]) -> Result<(), DecodeError>;

    /// Write the next decoded picture into `slot` if one is available.
    fn try_take_picture(&mut self, slot: &mut Picture) -> Result<PictureStatus, DecodeError>;

    fn capabilities(&self) -> Capabilities;
}

/// Open an engine session for `settings` on the requested backend.
pub fn open_engine(
    settings: &EngineSettings,
    backend: Backend,
) -> Result<Box<dyn DecodeEngine>, SetupError> {
    match backend {
        Backend::Software => software::open(settings),
        Backend::Hardware => hardware::open(settings),
        Backend::Auto => match hardware::open(settings) {
            Ok(engine) => Ok(engine),
            Err(e) => {
                info!("Hardware decode unavailable ({}), falling back to software", e);
                software::open(settings)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(codec: Codec) -> EngineSettings {
        EngineSettings {
            codec,
            width: 64,
            height: 32,
            frame_rate: 60,
            flags: PerformanceFlags::SLICE_THREADING,
            threads: 2,
        }
    }

    #[test]
    fn capability_layout_matches_wire_bits() {
        let caps = Capabilities::slices_per_frame(4)
            | Capabilities::REFERENCE_FRAME_INVALIDATION_AVC
            | Capabilities::REFERENCE_FRAME_INVALIDATION_HEVC
            | Capabilities::DIRECT_SUBMIT;
        assert_eq!(caps.bits(), 0x0400_0007);
        assert_eq!(caps.slices(), 4);
        assert!(caps.contains(Capabilities::DIRECT_SUBMIT));
    }

    #[test]
    fn low_latency_forces_single_thread() {
        let mut s = settings(Codec::H264);
        assert_eq!(s.effective_threads(), 2);
        s.flags = s.flags | PerformanceFlags::LOW_LATENCY_DECODE;
        assert_eq!(s.effective_threads(), 1);
    }

    #[test]
    fn flags_debug_lists_names() {
        let flags = PerformanceFlags::DISABLE_LOOP_FILTER | PerformanceFlags::FAST_DECODE;
        assert_eq!(
            format!("{flags:?}"),
            "PerformanceFlags(DISABLE_LOOP_FILTER | FAST_DECODE)"
        );
    }

    #[cfg(not(feature = "ffmpeg"))]
    #[test]
    fn auto_falls_back_to_software_mjpeg() {
        let engine = open_engine(&settings(Codec::Mjpeg), Backend::Auto).unwrap();
        assert_eq!(engine.name(), "mjpeg");
    }

    #[cfg(not(feature = "ffmpeg"))]
    #[test]
    fn h264_is_unsupported_without_ffmpeg() {
        for backend in [Backend::Software, Backend::Hardware, Backend::Auto] {
            let err = open_engine(&settings(Codec::H264), backend).err().unwrap();
            assert!(matches!(err, SetupError::UnsupportedCodec { codec: Codec::H264, .. }));
        }
    }
}
