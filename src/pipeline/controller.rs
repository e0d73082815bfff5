//! Pipeline controller: assemble, submit, drain, publish

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use super::assembler::{DecodeUnit, StagingBuffer};
use super::ring::{FrameReader, FrameRing};
use crate::decode::adapter::EngineOpener;
use crate::decode::{Capabilities, DecodeAdapter, EngineSettings, PerformanceFlags, Picture};
use crate::error::{DecodeError, PipelineError, SetupError};
use crate::{Config, PipelineConfig};

/// Upper bound on pictures drained for one decode unit. Engines normally
/// emit at most one; this only guards against an engine that never reports
/// `NotReady`.
const MAX_PICTURES_PER_UNIT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Ready,
    /// Setup failed; stays here until the next teardown or setup
    Failed,
}

/// Resources that only exist while the pipeline is ready
struct Session {
    staging: StagingBuffer,
    ring: FrameRing,
    flags: PerformanceFlags,
}

/// Drives one decode engine from the data source's decode thread and
/// publishes its output for the render thread.
///
/// All methods except [`Pipeline::current_picture`] belong to the decode
/// thread; the render thread should hold a [`FrameReader`] from
/// [`Pipeline::reader`] instead of the pipeline itself.
pub struct Pipeline {
    config: PipelineConfig,
    state: PipelineState,
    adapter: DecodeAdapter,
    session: Option<Session>,
    reader: FrameReader,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, adapter: DecodeAdapter) -> Self {
        Self {
            config,
            state: PipelineState::Uninitialized,
            adapter,
            session: None,
            reader: FrameReader::new(),
        }
    }

    /// Pipeline using the configured backend
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.pipeline.clone(),
            DecodeAdapter::new(config.decoder.backend),
        )
    }

    /// Pipeline whose engines come from `opener`
    pub fn with_engine_opener(config: PipelineConfig, opener: EngineOpener) -> Self {
        Self::new(config, DecodeAdapter::with_opener(opener))
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Bring up the engine session, staging buffer and frame slots.
    ///
    /// Any existing session is torn down first. On failure everything
    /// allocated so far is released and the pipeline is left `Failed`.
    #[instrument(skip(self), fields(codec = ?settings.codec))]
    pub fn setup(&mut self, settings: &EngineSettings) -> Result<Capabilities, PipelineError> {
        self.teardown();

        match self.try_setup(settings) {
            Ok(capabilities) => {
                self.state = PipelineState::Ready;
                info!(
                    "Pipeline ready on {}: {}x{} @ {}fps, {} slots, {} byte staging",
                    self.adapter.engine_name().unwrap_or("no engine"),
                    settings.width,
                    settings.height,
                    settings.frame_rate,
                    self.config.frame_slots,
                    self.config.staging_capacity
                );
                Ok(capabilities)
            }
            Err(e) => {
                error!("Pipeline setup failed: {}", e);
                self.release();
                self.state = PipelineState::Failed;
                Err(e.into())
            }
        }
    }

    fn try_setup(&mut self, settings: &EngineSettings) -> Result<Capabilities, SetupError> {
        let capabilities = self.adapter.setup(settings)?;

        let staging = StagingBuffer::try_new(self.config.staging_capacity)?;
        let ring = FrameRing::try_attach(
            &self.reader,
            self.config.frame_slots,
            settings.width,
            settings.height,
        )
        .map_err(|e| SetupError::EngineAllocationFailure {
            what: "frame slots",
            reason: e.to_string(),
        })?;

        self.session = Some(Session {
            staging,
            ring,
            flags: settings.flags,
        });
        Ok(capabilities)
    }

    /// Assemble, submit and drain one decode unit. Returns how many pictures
    /// were published.
    ///
    /// Decode and assembly failures are per unit: the pipeline stays ready
    /// and the render thread keeps showing the last good picture.
    #[instrument(skip_all, fields(frame = unit.frame_number, len = unit.total_len))]
    pub fn submit_decode_unit(&mut self, unit: &DecodeUnit) -> Result<usize, PipelineError> {
        if self.state != PipelineState::Ready {
            return Err(PipelineError::NotInitialized);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(PipelineError::NotInitialized);
        };
        let stats = self.reader.counters();

        let coded = match session.staging.assemble(unit) {
            Ok(coded) => coded,
            Err(e) => {
                warn!("Dropping decode unit {}: {}", unit.frame_number, e);
                stats.unit_rejected();
                metrics::counter!("decode_units_rejected").increment(1);
                return Err(e.into());
            }
        };

        stats.unit_submitted();
        metrics::counter!("decode_units_submitted").increment(1);

        let decode_start = Instant::now();
        // Output the engine already holds is still drained after a rejected submit
        let mut failure: Option<DecodeError> = self.adapter.submit(coded).err();

        let mut published = 0;
        while published < MAX_PICTURES_PER_UNIT {
            match self.adapter.try_take_picture(&mut session.ring) {
                Ok(Some(slot)) => {
                    let picture = session.ring.publish(slot);
                    published += 1;
                    debug!(
                        "Published picture {} in slot {} ({}x{})",
                        picture.sequence(),
                        slot,
                        picture.width(),
                        picture.height()
                    );
                }
                Ok(None) => break,
                Err(e) => {
                    failure.get_or_insert(e);
                    break;
                }
            }
        }
        if published == MAX_PICTURES_PER_UNIT {
            warn!(
                "Engine still producing after {} pictures, deferring the rest",
                MAX_PICTURES_PER_UNIT
            );
        }

        metrics::histogram!("decode_time_us").record(decode_start.elapsed().as_micros() as f64);

        match failure {
            Some(e) => {
                stats.decode_error();
                metrics::counter!("decode_errors").increment(1);
                Err(e.into())
            }
            None => Ok(published),
        }
    }

    /// Capability bit-set of the live engine session
    pub fn capabilities(&self) -> Result<Capabilities, PipelineError> {
        match self.state {
            PipelineState::Ready => self
                .adapter
                .capabilities()
                .ok_or(PipelineError::NotInitialized),
            _ => Err(PipelineError::NotInitialized),
        }
    }

    /// Performance flags the live session was set up with
    pub fn performance_flags(&self) -> Option<PerformanceFlags> {
        self.session.as_ref().map(|s| s.flags)
    }

    /// Largest decode unit the live session accepts
    pub fn staging_capacity(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.staging.capacity())
    }

    /// Newest decoded picture, or `None` before the first decode.
    pub fn current_picture(&self) -> Option<Arc<Picture>> {
        self.reader.current()
    }

    /// Handle for the render thread. Stays valid across teardown and setup.
    pub fn reader(&self) -> FrameReader {
        self.reader.clone()
    }

    /// Release every session resource and return to `Uninitialized`.
    /// Valid from any state. The decode thread must be quiesced first.
    pub fn teardown(&mut self) {
        if self.state != PipelineState::Uninitialized {
            info!("Tearing down pipeline from {:?}", self.state);
        }
        self.release();
        self.state = PipelineState::Uninitialized;
    }

    fn release(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.ring.reset();
        }
        self.adapter.teardown();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.release();
    }
}
