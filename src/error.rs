//! Error taxonomy for the decode pipeline.
//!
//! Engine-level failures are converted into these kinds at the adapter
//! boundary. The data source only ever sees a [`PipelineError`] or, through
//! [`PipelineError::status_code`], a negative status.

use thiserror::Error;

use crate::decode::Codec;

/// Status returned to the data source on success
pub const STATUS_OK: i32 = 0;

/// Engine session could not be brought up. Fatal for the pipeline instance.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no {backend} decode engine available for {codec:?}")]
    UnsupportedCodec { codec: Codec, backend: &'static str },

    #[error("failed to allocate {what}: {reason}")]
    EngineAllocationFailure { what: &'static str, reason: String },
}

/// The engine refused a coded picture or failed while emitting one.
/// Transient: the pipeline stays ready.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{engine} rejected coded picture: {reason}")]
    Rejected { engine: &'static str, reason: String },

    #[error("{engine} failed to emit picture: {reason}")]
    Receive { engine: &'static str, reason: String },
}

/// A decode unit could not be laid out in the staging buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("decode unit of {len} bytes exceeds staging capacity of {capacity} bytes")]
    TooLarge { len: usize, capacity: usize },

    #[error("fragments sum to {actual} bytes but decode unit declares {declared}")]
    LengthMismatch { declared: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("decode unit dropped: {0}")]
    AssemblyRejected(#[from] AssemblyError),

    #[error("pipeline is not initialized")]
    NotInitialized,
}

impl PipelineError {
    /// Negative status code for the decoder-registration style interface.
    pub fn status_code(&self) -> i32 {
        match self {
            PipelineError::Setup(SetupError::UnsupportedCodec { .. }) => -1,
            PipelineError::Setup(SetupError::EngineAllocationFailure { .. }) => -2,
            PipelineError::Decode(_) => -3,
            PipelineError::AssemblyRejected(_) => -4,
            PipelineError::NotInitialized => -5,
        }
    }

    /// Whether the pipeline can keep accepting decode units after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Decode(_) | PipelineError::AssemblyRejected(_)
        )
    }
}

/// Collapse a pipeline result into a status code.
pub fn status_of<T>(result: &Result<T, PipelineError>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(e) => e.status_code(),
    }
}
