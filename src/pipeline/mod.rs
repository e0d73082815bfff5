pub mod assembler;
pub mod controller;
pub mod ring;

pub use assembler::{DecodeUnit, StagingBuffer};
pub use controller::{Pipeline, PipelineState};
pub use ring::{FrameReader, FrameRing};
