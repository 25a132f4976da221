//! Error types and result handling for the stream admission controller

use thiserror::Error;

/// Main error type for the stream admission controller
#[derive(Error, Debug)]
pub enum Error {
    #[error("GStreamer error: {0}")]
    GStreamer(#[from] gstreamer::glib::Error),

    #[error("GLib error: {0}")]
    GlibBool(#[from] gstreamer::glib::BoolError),

    #[error("Element creation error: {element_name} - {message}")]
    ElementCreation { element_name: String, message: String },

    #[error("Element linking error: {from} -> {to} - {message}")]
    ElementLinking { from: String, to: String, message: String },

    #[error("Pad missing: {element_name} has no pad {pad_name}")]
    PortMissing { element_name: String, pad_name: String },

    #[error("State change error: {element_name} - {message}")]
    StateChange { element_name: String, message: String },

    #[error("Seek failed on {element_name}: {message}")]
    SeekFailed { element_name: String, message: String },

    #[error("Resource sample degraded ({resource}): {message}")]
    ResourceSampleDegraded { resource: String, message: String },

    #[error("Fatal pipeline error from {source_name}: {message}")]
    PipelineFatal { source_name: String, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the stream admission controller
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new element creation error
    pub fn element_creation(element_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ElementCreation {
            element_name: element_name.into(),
            message: message.into(),
        }
    }

    /// Create a new element linking error
    pub fn element_linking(
        from: impl Into<String>,
        to: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ElementLinking {
            from: from.into(),
            to: to.into(),
            message: message.into(),
        }
    }

    /// Create a new missing pad error
    pub fn port_missing(element_name: impl Into<String>, pad_name: impl Into<String>) -> Self {
        Self::PortMissing {
            element_name: element_name.into(),
            pad_name: pad_name.into(),
        }
    }

    /// Create a new state change error
    pub fn state_change(element_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StateChange {
            element_name: element_name.into(),
            message: message.into(),
        }
    }

    /// Create a new seek error
    pub fn seek_failed(element_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SeekFailed {
            element_name: element_name.into(),
            message: message.into(),
        }
    }

    pub fn resource_degraded(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceSampleDegraded {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a new fatal pipeline error
    pub fn pipeline_fatal(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PipelineFatal {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
