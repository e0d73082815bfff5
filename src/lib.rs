pub mod decode;
pub mod error;
pub mod pipeline;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::decode::{Backend, Codec, EngineSettings, PerformanceFlags};
use crate::pipeline::assembler::DEFAULT_STAGING_CAPACITY;

pub use crate::decode::{Capabilities, Picture};
pub use crate::error::{PipelineError, SetupError, STATUS_OK};
pub use crate::pipeline::{DecodeUnit, FrameReader, Pipeline, PipelineState};

/// Prefix for environment overrides, e.g. `STREAM_DECODE__STREAM__FPS=30`
pub const ENV_PREFIX: &str = "STREAM_DECODE";

/// System configuration, read once at setup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub decoder: DecoderConfig,
    pub pipeline: PipelineConfig,
}

/// What the session negotiates with the host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: Codec,
    /// Passed through to the host untouched
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub backend: Backend,
    pub flags: PerformanceFlags,
    pub threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Decoded picture slots; at least 2
    pub frame_slots: usize,
    /// Largest coded picture accepted, in bytes
    pub staging_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 60,
            codec: Codec::H264,
            bitrate_kbps: 10_000,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            flags: PerformanceFlags::SLICE_THREADING,
            threads: 2,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_slots: 2,
            staging_capacity: DEFAULT_STAGING_CAPACITY,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then environment
    /// variables under [`ENV_PREFIX`].
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Engine parameters for [`Pipeline::setup`]
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            codec: self.stream.codec,
            width: self.stream.width,
            height: self.stream.height,
            frame_rate: self.stream.fps,
            flags: self.decoder.flags,
            threads: self.decoder.threads,
        }
    }
}

/// Point-in-time pipeline counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub units_submitted: u64,
    pub units_rejected: u64,
    pub decode_errors: u64,
    pub pictures_published: u64,
    pub render_reads: u64,
    /// Slots moved to fresh storage because the render side still held them
    pub slot_replacements: u64,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_baseline_design() {
        let config = Config::default();
        assert_eq!(config.pipeline.frame_slots, 2);
        assert_eq!(config.pipeline.staging_capacity, 92 * 1024);
        assert_eq!(config.decoder.flags, PerformanceFlags::SLICE_THREADING);

        let settings = config.engine_settings();
        assert_eq!((settings.width, settings.height, settings.frame_rate), (1280, 720, 60));
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!(
            "stream-decode-config-{}.toml",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[stream]\ncodec = \"mjpeg\"\nwidth = 640\n\n[decoder]\nbackend = \"software\"\nflags = 3\n\n[pipeline]\nframe_slots = 3"
        )
        .unwrap();
        drop(file);

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.stream.codec, Codec::Mjpeg);
        assert_eq!(config.stream.width, 640);
        assert_eq!(config.stream.height, 720);
        assert_eq!(config.decoder.backend, Backend::Software);
        assert!(config
            .decoder
            .flags
            .contains(PerformanceFlags::DISABLE_LOOP_FILTER | PerformanceFlags::LOW_LATENCY_DECODE));
        assert_eq!(config.pipeline.frame_slots, 3);
    }
}
