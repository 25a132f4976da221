//! GStreamer side of the admission controller

pub mod batch;
pub mod common;
pub mod probe;
pub mod source;

pub use batch::{BatchPipeline, MuxerHost};
pub use common::*;
pub use probe::{attach_continuity_probe, DecoderSeekRestart};
pub use source::SourceWorkerFactory;
