//! Per-worker ingestion bin: file source, parser, decoder, normalizer

use crate::continuity::{new_continuity_handle, ContinuityProbe};
use crate::error::{Error, Result};
use crate::pipeline::common::PipelineCommon;
use crate::pipeline::probe::{attach_continuity_probe, DecoderSeekRestart};
use crate::scheduler::{BuiltWorker, WorkerFactory};
use crate::types::{DecodeBackend, SourceConfig, WorkerId};
use gstreamer::prelude::*;
use gstreamer::{Bin, GhostPad};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Builds one looping worker per call
pub struct SourceWorkerFactory {
    config: SourceConfig,
    restart_delay: Duration,
}

impl SourceWorkerFactory {
    pub fn new(config: SourceConfig, restart_delay: Duration) -> Self {
        Self {
            config,
            restart_delay,
        }
    }

    fn assemble(&self, bin: &Bin, id: WorkerId, location: &str, backend: DecodeBackend) -> Result<BuiltWorker<Bin>> {
        let source = PipelineCommon::create_element(&self.config.source_element, "file-source")?;
        if !PipelineCommon::set_property_if_present(&source, "location", location) {
            return Err(Error::configuration(format!(
                "{} has no location property",
                self.config.source_element
            )));
        }

        let parser = PipelineCommon::create_element(&self.config.parser_element, "h264-parser")?;

        let decoder_factory = self.config.decoder_element(backend);
        let decoder = PipelineCommon::create_element(decoder_factory, decoder_factory)?;

        let normalizer =
            PipelineCommon::create_element(&self.config.normalizer_element, "normalizer")?;
        let capsfilter =
            PipelineCommon::create_capsfilter("caps-filter", self.config.caps_for(backend))?;

        let gpu_id = self.config.gpu_id.to_string();
        if backend == DecodeBackend::Hardware {
            PipelineCommon::set_property_if_present(&decoder, "gpu-id", &gpu_id);
        }
        PipelineCommon::set_property_if_present(&normalizer, "gpu-id", &gpu_id);

        // Probe goes in before anything can flow
        let continuity = new_continuity_handle();
        let restarter = Arc::new(DecoderSeekRestart::new(decoder.clone(), self.restart_delay));
        let probe = ContinuityProbe::new(id, continuity.clone(), restarter);
        attach_continuity_probe(&decoder, Arc::new(probe))?;

        bin.add_many([&source, &parser, &decoder, &normalizer, &capsfilter])?;
        PipelineCommon::link_chain(&[&source, &parser, &decoder, &normalizer, &capsfilter])?;

        let target = capsfilter
            .static_pad("src")
            .ok_or_else(|| Error::port_missing(capsfilter.name(), "src"))?;
        let ghost = GhostPad::builder_with_target(&target)?.name("src").build();
        bin.add_pad(&ghost)?;

        Ok(BuiltWorker {
            handle: bin.clone(),
            continuity,
        })
    }
}

impl WorkerFactory for SourceWorkerFactory {
    type Handle = Bin;

    fn build(&mut self, id: WorkerId, uri: &str, backend: DecodeBackend) -> Result<BuiltWorker<Bin>> {
        let bin = Bin::builder().name(id.bin_name()).build();
        debug!("[{}] Building {} worker from {}", bin.name(), backend, uri);

        // A failed build drops the bin here; it never reached the pipeline
        let built = self.assemble(&bin, id, uri, backend)?;

        info!(
            "[{}] Built with {} decoder",
            bin.name(),
            self.config.decoder_element(backend)
        );
        Ok(built)
    }
}
