//! Shared batching pipeline that every worker feeds

use crate::error::{Error, Result};
use crate::pipeline::common::PipelineCommon;
use crate::scheduler::WorkerHost;
use crate::types::{MuxerConfig, WorkerId};
use gstreamer::prelude::*;
use gstreamer::{Bin, Element, Pad, Pipeline, State};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Muxer → identity → sink, with request pads handed out per worker
pub struct BatchPipeline {
    pipeline: Pipeline,
    muxer: Element,
    pipeline_id: String,
}

impl BatchPipeline {
    /// Create the shared pipeline; workers are attached later
    pub fn new(config: &MuxerConfig) -> Result<Self> {
        let pipeline_id = format!("batch_pipeline_{}", Uuid::new_v4());
        let pipeline = Pipeline::builder().name(format!("admission-pipeline-{}", pipeline_id)).build();

        let muxer = PipelineCommon::create_element(&config.muxer_element, "stream-muxer")?;
        for (property, value) in [
            ("batched-push-timeout", config.batched_push_timeout_us.to_string()),
            ("batch-size", config.batch_size.to_string()),
            ("gpu-id", config.gpu_id.to_string()),
            ("live-source", config.live_source.to_string()),
            ("width", config.width.to_string()),
            ("height", config.height.to_string()),
        ] {
            PipelineCommon::set_property_if_present(&muxer, property, &value);
        }

        let identity = PipelineCommon::create_element("identity", "identity")?;
        identity.set_property("silent", false);

        let sink = PipelineCommon::create_element(&config.sink_element, "sink")?;
        PipelineCommon::set_property_if_present(&sink, "sync", "false");
        PipelineCommon::set_property_if_present(&sink, "qos", "false");

        pipeline.add_many([&muxer, &identity, &sink])?;
        PipelineCommon::link_chain(&[&muxer, &identity, &sink])?;

        info!("[{}] Batch pipeline created", pipeline_id);
        Ok(Self {
            pipeline,
            muxer,
            pipeline_id,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Host that attaches workers to this pipeline's muxer
    pub fn host(&self) -> MuxerHost {
        MuxerHost::new(self.pipeline.clone(), self.muxer.clone())
    }

    /// Pre-roll, then go to playing
    pub fn play(&self) -> Result<()> {
        let element = self.pipeline.upcast_ref::<Element>();
        PipelineCommon::set_element_state(element, State::Paused)?;
        PipelineCommon::set_element_state(element, State::Playing)?;
        info!("[{}] Pipeline playing", self.pipeline_id);
        Ok(())
    }

    /// Tear everything down, workers included
    pub fn shutdown(&self) -> Result<()> {
        info!("[{}] Stopping pipeline", self.pipeline_id);
        PipelineCommon::set_element_state(self.pipeline.upcast_ref(), State::Null)?;
        Ok(())
    }
}

/// Adds worker bins to the shared pipeline and links them to the muxer
pub struct MuxerHost {
    pipeline: Pipeline,
    muxer: Element,
}

impl MuxerHost {
    /// `muxer` must already be inside `pipeline` and hand out `sink_%u` request pads
    pub fn new(pipeline: Pipeline, muxer: Element) -> Self {
        Self { pipeline, muxer }
    }

    fn connect(&self, id: WorkerId, bin: &Bin, muxer_pad: &Pad) -> Result<()> {
        let src = bin
            .static_pad("src")
            .ok_or_else(|| Error::port_missing(bin.name(), "src"))?;
        src.link(muxer_pad).map_err(|e| {
            Error::element_linking(
                bin.name(),
                format!("{}:{}", self.muxer.name(), muxer_pad.name()),
                format!("{:?}", e),
            )
        })?;
        debug!("[{}] Linked to {}", bin.name(), muxer_pad.name());

        if self.pipeline.current_state() == State::Playing {
            // Block until this bin is up so the next tick sees a settled graph
            let result = PipelineCommon::set_element_state_blocking(bin.upcast_ref(), State::Playing)?;
            info!("[{}] Worker {} started: {:?}", bin.name(), id, result);
        } else {
            bin.sync_state_with_parent()?;
        }
        Ok(())
    }

    fn discard(&self, bin: &Bin, muxer_pad: Option<&Pad>) {
        let _ = bin.set_state(State::Null);
        if let Some(pad) = muxer_pad {
            self.muxer.release_request_pad(pad);
        }
        if let Err(e) = self.pipeline.remove(bin) {
            warn!("[{}] Could not remove failed worker: {}", bin.name(), e);
        }
    }
}

impl WorkerHost<Bin> for MuxerHost {
    fn attach(&mut self, id: WorkerId, bin: &Bin) -> Result<()> {
        self.pipeline.add(bin)?;

        let pad_name = id.muxer_pad_name();
        let Some(muxer_pad) = self.muxer.request_pad_simple(&pad_name) else {
            self.discard(bin, None);
            return Err(Error::port_missing(self.muxer.name(), pad_name));
        };

        if let Err(e) = self.connect(id, bin, &muxer_pad) {
            self.discard(bin, Some(&muxer_pad));
            return Err(e);
        }
        Ok(())
    }

    fn detach(&mut self, id: WorkerId, bin: &Bin) -> Result<()> {
        PipelineCommon::set_element_state(bin.upcast_ref(), State::Null)?;
        if let Some(muxer_pad) = self.muxer.static_pad(&id.muxer_pad_name()) {
            self.muxer.release_request_pad(&muxer_pad);
        }
        self.pipeline.remove(bin)?;
        debug!("[{}] Detached from {}", bin.name(), self.muxer.name());
        Ok(())
    }
}
