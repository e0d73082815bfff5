//! Codec-agnostic front for one decode engine session

use tracing::{debug, info, warn};

use super::{open_engine, Backend, Capabilities, DecodeEngine, EngineSettings, PictureStatus};
use crate::error::{DecodeError, SetupError};
use crate::pipeline::FrameRing;

/// Opens an engine session; swapped out in tests for scripted engines.
pub type EngineOpener =
    Box<dyn FnMut(&EngineSettings) -> Result<Box<dyn DecodeEngine>, SetupError> + Send>;

/// Owns at most one engine session and presents submit / poll / teardown
/// over it, whichever variant was selected at setup.
pub struct DecodeAdapter {
    opener: EngineOpener,
    engine: Option<Box<dyn DecodeEngine>>,
    capabilities: Capabilities,
}

impl DecodeAdapter {
    /// Adapter that opens engines on `backend`
    pub fn new(backend: Backend) -> Self {
        Self::with_opener(Box::new(move |settings: &EngineSettings| {
            open_engine(settings, backend)
        }))
    }

    pub fn with_opener(opener: EngineOpener) -> Self {
        Self {
            opener,
            engine: None,
            capabilities: Capabilities::empty(),
        }
    }

    /// Bring up an engine session. Any previous session is torn down first.
    pub fn setup(&mut self, settings: &EngineSettings) -> Result<Capabilities, SetupError> {
        self.teardown();

        let engine = (self.opener)(settings)?;
        self.capabilities = engine.capabilities();
        info!(
            "Decode engine {} up, capabilities {:#010x}",
            engine.name(),
            self.capabilities.bits()
        );
        self.engine = Some(engine);
        Ok(self.capabilities)
    }

    /// Hand a contiguous coded picture to the engine. Failures are logged
    /// here and returned; they never tear the session down.
    pub fn submit(&mut self, coded: &[u8]) -> Result<(), DecodeError> {
        let engine = self.engine.as_mut().ok_or_else(|| DecodeError::Rejected {
            engine: "none",
            reason: "no engine session".into(),
        })?;

        engine.submit(coded).inspect_err(|e| {
            warn!("Decode failed - {}", e);
        })
    }

    /// Poll the engine once. On success the picture sits in the ring's next
    /// slot, whose index is returned for publishing.
    pub fn try_take_picture(&mut self, ring: &mut FrameRing) -> Result<Option<usize>, DecodeError> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(None);
        };

        let slot = ring.next_slot();
        let picture = ring.slot_mut(slot).map_err(|e| DecodeError::Receive {
            engine: "frame ring",
            reason: e.to_string(),
        })?;
        match engine.try_take_picture(picture) {
            Ok(PictureStatus::Ready) => Ok(Some(slot)),
            Ok(PictureStatus::NotReady) => Ok(None),
            Err(e) => {
                warn!("Receive failed - {}", e);
                Err(e)
            }
        }
    }

    /// Release the engine session. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        if let Some(engine) = self.engine.take() {
            debug!("Releasing decode engine {}", engine.name());
        }
        self.capabilities = Capabilities::empty();
    }

    /// Capabilities of the live session, if any
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.engine.as_ref().map(|_| self.capabilities)
    }

    pub fn engine_name(&self) -> Option<&'static str> {
        self.engine.as_ref().map(|e| e.name())
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_some()
    }
}
