//! Common pipeline utilities and helper functions

use crate::error::{Error, Result};
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer::bus::BusWatchGuard;
use gstreamer::*;
use std::str::FromStr;
use tracing::{debug, error, info, warn};

/// What the bus watch saw that matters to the control loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Unrecoverable error from any element
    Fatal { source_name: String, message: String },
    /// End of stream for the whole pipeline
    Eos,
}

/// Common pipeline operations and utilities
pub struct PipelineCommon;

impl PipelineCommon {
    /// Create a GStreamer element with error handling
    pub fn create_element(factory_name: &str, name: &str) -> Result<Element> {
        let element = ElementFactory::make(factory_name)
            .name(name)
            .build()
            .map_err(|e| Error::element_creation(factory_name, e.to_string()))?;

        debug!("Created element: {} ({})", name, factory_name);
        Ok(element)
    }

    /// Link two GStreamer elements with error handling
    pub fn link_elements(from: &Element, to: &Element) -> Result<()> {
        from.link(to)
            .map_err(|e| Error::element_linking(from.name(), to.name(), e.to_string()))?;

        debug!("Linked elements: {} -> {}", from.name(), to.name());
        Ok(())
    }

    /// Link a chain of elements in order
    pub fn link_chain(elements: &[&Element]) -> Result<()> {
        for pair in elements.windows(2) {
            Self::link_elements(pair[0], pair[1])?;
        }
        Ok(())
    }

    /// Set element state with error handling
    pub fn set_element_state(element: &Element, state: State) -> Result<StateChangeSuccess> {
        let result = element
            .set_state(state)
            .map_err(|e| Error::state_change(element.name(), e.to_string()))?;

        debug!("Set element {} state to {:?}: {:?}", element.name(), state, result);
        Ok(result)
    }

    /// Set the state and, if the change completes asynchronously, block
    /// until it has resolved one way or the other
    pub fn set_element_state_blocking(element: &Element, state: State) -> Result<StateChangeSuccess> {
        match Self::set_element_state(element, state)? {
            StateChangeSuccess::Async => {
                debug!("State change of {} is async, waiting", element.name());
                let (result, current, _pending) = element.state(ClockTime::NONE);
                let success =
                    result.map_err(|e| Error::state_change(element.name(), e.to_string()))?;
                debug!("{} settled in {:?} ({:?})", element.name(), current, success);
                Ok(success)
            }
            other => Ok(other),
        }
    }

    /// Create a capsfilter with the specified caps
    pub fn create_capsfilter(name: &str, caps_str: Option<&str>) -> Result<Element> {
        let capsfilter = Self::create_element("capsfilter", name)?;
        if let Some(caps_str) = caps_str {
            let caps = Caps::from_str(caps_str)
                .map_err(|e| Error::element_creation("capsfilter", e.to_string()))?;
            capsfilter.set_property("caps", &caps);
        }
        Ok(capsfilter)
    }

    /// Set a property from its string form when the element exposes it.
    ///
    /// Vendor elements differ in which knobs they have and in their exact
    /// types, so values go through the property's own parser.
    pub fn set_property_if_present(element: &Element, property: &str, value: &str) -> bool {
        if element.find_property(property).is_none() {
            debug!("{} has no property {}, skipping", element.name(), property);
            return false;
        }
        element.set_property_from_str(property, value);
        true
    }

    /// Ask `main_loop` to quit from any thread.
    ///
    /// The quit is dispatched by the loop's own context, so a request made
    /// before `run()` starts still ends the loop once it does.
    pub fn post_quit(main_loop: &glib::MainLoop) {
        let target = main_loop.clone();
        main_loop.context().invoke(move || target.quit());
    }

    /// Watch the pipeline bus on the current main context.
    ///
    /// Errors and pipeline EOS are handed to `on_event`; warnings and
    /// per-stream EOS notifications are only logged.
    pub fn setup_bus_handler(
        pipeline: &Pipeline,
        pipeline_id: &str,
        on_event: impl Fn(BusEvent) + 'static,
    ) -> Result<BusWatchGuard> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| Error::configuration("pipeline has no bus"))?;
        let pipeline_id = pipeline_id.to_string();

        let guard = bus.add_watch_local(move |_, msg| {
            match msg.view() {
                MessageView::Error(err) => {
                    let source_name = msg
                        .src()
                        .map(|s| s.path_string().to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    error!("[{}] Error from {}: {}", pipeline_id, source_name, err.error());
                    if let Some(details) = err.debug() {
                        error!("[{}] Error details: {}", pipeline_id, details);
                    }
                    on_event(BusEvent::Fatal {
                        source_name,
                        message: err.error().to_string(),
                    });
                }
                MessageView::Warning(w) => {
                    warn!("[{}] Pipeline warning: {}", pipeline_id, w.error());
                }
                MessageView::Eos(_) => {
                    info!("[{}] Pipeline reached end of stream", pipeline_id);
                    on_event(BusEvent::Eos);
                }
                MessageView::Element(element_msg) => {
                    if let Some(structure) = element_msg.structure() {
                        if structure.name() == "stream-eos" {
                            let stream_id = structure.get::<u32>("stream-id").ok();
                            info!("[{}] Got EOS from stream {:?}", pipeline_id, stream_id);
                        }
                    }
                }
                _ => {}
            }
            glib::ControlFlow::Continue
        })?;

        Ok(guard)
    }
}
