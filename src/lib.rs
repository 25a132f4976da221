//! Stream Admission GStreamer - load-aware admission of looping file sources
//!
//! This crate provides functionality for:
//! - Sampling CPU and hardware decoder utilization
//! - Choosing a hardware or software decoder per stream
//! - Admitting new looping streams into a shared batching muxer while load allows
//! - Keeping each looping stream's timestamps continuous across restarts

pub mod continuity;
pub mod decoder;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod types;


pub use error::{Error, Result};
pub use types::*;
