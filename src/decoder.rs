//! Decode backend selection

use crate::resource::ResourceSample;
use crate::types::DecodeBackend;

/// Picks the decode path for a worker at creation time.
///
/// The choice is made once; a worker never migrates between backends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderSelector {
    software_fallback_percent: f64,
}

impl DecoderSelector {
    pub fn new(software_fallback_percent: f64) -> Self {
        Self {
            software_fallback_percent,
        }
    }

    /// Software once the decode hardware reports more than the fallback threshold
    pub fn select(&self, sample: &ResourceSample) -> DecodeBackend {
        if sample.decoder_percent() > self.software_fallback_percent {
            DecodeBackend::Software
        } else {
            DecodeBackend::Hardware
        }
    }

    pub fn software_fallback_percent(&self) -> f64 {
        self.software_fallback_percent
    }
}

impl Default for DecoderSelector {
    fn default() -> Self {
        Self::new(99.0)
    }
}
