//! Pad probe adapter for the continuity interceptor and the seek-based restart

use crate::continuity::{EventAction, Interceptor, LoopSignal, RestartCallback, RestartScheduler};
use crate::error::{Error, Result};
use crate::pipeline::common::PipelineCommon;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer::{ClockTime, Element, Event, EventType, EventView, PadProbeData, PadProbeInfo};
use gstreamer::{PadProbeReturn, PadProbeType, SeekFlags, SeekType, Seqnum, State};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Install `interceptor` on the sink pad of `decoder`.
///
/// Buffers, events in both directions and flush events are all routed
/// through it. A segment carrying the sequence number of the last one
/// handled is a re-delivery of the same sticky event and is dropped without
/// reaching the interceptor.
pub fn attach_continuity_probe(
    decoder: &Element,
    interceptor: Arc<dyn Interceptor>,
) -> Result<gstreamer::PadProbeId> {
    let pad = decoder
        .static_pad("sink")
        .ok_or_else(|| Error::port_missing(decoder.name(), "sink"))?;

    let mask = PadProbeType::BUFFER | PadProbeType::EVENT_BOTH | PadProbeType::EVENT_FLUSH;
    let last_segment = Mutex::new(None);
    pad.add_probe(mask, move |_pad, info| {
        intercept(interceptor.as_ref(), &last_segment, info)
    })
    .ok_or_else(|| Error::port_missing(decoder.name(), "sink (probe rejected)"))
}

fn intercept(
    interceptor: &dyn Interceptor,
    last_segment: &Mutex<Option<Seqnum>>,
    info: &mut PadProbeInfo,
) -> PadProbeReturn {
    match info.data {
        Some(PadProbeData::Buffer(ref mut buffer)) => {
            let pts = buffer.pts();
            let rebased = interceptor.on_buffer(pts, buffer.duration());
            if rebased != pts {
                buffer.make_mut().set_pts(rebased);
            }
            PadProbeReturn::Ok
        }
        Some(PadProbeData::Event(ref mut event)) => {
            if event.type_() == EventType::Segment {
                let mut last = last_segment.lock().unwrap_or_else(PoisonError::into_inner);
                if *last == Some(event.seqnum()) {
                    return PadProbeReturn::Drop;
                }
                *last = Some(event.seqnum());
            }
            match interceptor.on_event(loop_signal(event)) {
                EventAction::Forward => PadProbeReturn::Ok,
                EventAction::Drop => PadProbeReturn::Drop,
                EventAction::RebaseAndDrop(base) => {
                    if let Some(rebased) = rebased_segment(event, base) {
                        *event = rebased;
                    }
                    PadProbeReturn::Drop
                }
            }
        }
        _ => PadProbeReturn::Ok,
    }
}

/// Classify a runtime event for the interceptor
pub fn loop_signal(event: &Event) -> LoopSignal {
    match event.type_() {
        EventType::Eos => LoopSignal::Eos,
        EventType::Qos => LoopSignal::Qos,
        EventType::FlushStart => LoopSignal::FlushStart,
        EventType::FlushStop => LoopSignal::FlushStop,
        EventType::Segment => LoopSignal::Segment {
            stop: segment_stop(event),
        },
        _ => LoopSignal::Other,
    }
}

/// Stop of a time segment; byte or default-format segments report none
fn segment_stop(event: &Event) -> Option<ClockTime> {
    match event.view() {
        EventView::Segment(segment) => segment
            .segment()
            .downcast_ref::<ClockTime>()
            .and_then(|time_segment| time_segment.stop()),
        _ => None,
    }
}

fn rebased_segment(event: &Event, base: ClockTime) -> Option<Event> {
    let EventView::Segment(segment) = event.view() else {
        return None;
    };
    let mut time_segment = segment.segment().downcast_ref::<ClockTime>()?.clone();
    time_segment.set_base(base);
    Some(gstreamer::event::Segment::new(&time_segment))
}

/// Loops a worker by seeking its decoder back to the start from a GLib
/// timeout on the main context, after the end-of-stream event has drained.
pub struct DecoderSeekRestart {
    decoder: Element,
    delay: Duration,
}

impl DecoderSeekRestart {
    pub fn new(decoder: Element, delay: Duration) -> Self {
        Self { decoder, delay }
    }
}

impl RestartScheduler for DecoderSeekRestart {
    fn schedule_restart(&self, on_issued: RestartCallback) {
        let decoder = self.decoder.clone();
        glib::timeout_add_once(self.delay, move || {
            on_issued(seek_to_start(&decoder));
        });
    }
}

/// Pause, flush-seek to zero, resume. The seek result is what gets reported;
/// the element is resumed regardless.
pub fn seek_to_start(element: &Element) -> Result<()> {
    PipelineCommon::set_element_state(element, State::Paused)?;

    debug!("Seeking {} to start", element.name());
    let seek = element
        .seek(
            1.0,
            SeekFlags::FLUSH | SeekFlags::KEY_UNIT,
            SeekType::Set,
            ClockTime::ZERO,
            SeekType::None,
            ClockTime::NONE,
        )
        .map_err(|e| Error::seek_failed(element.name(), e.to_string()));

    PipelineCommon::set_element_state(element, State::Playing)?;
    seek
}
