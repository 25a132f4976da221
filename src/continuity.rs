//! Seamless looping for file-backed workers
//!
//! Every worker restarts its file when it reaches the end. Downstream must
//! never notice: timestamps keep increasing across restarts, and the
//! end-of-stream, segment, flush and QoS traffic a restart produces is
//! swallowed at the decoder input.
//!
//! [`ContinuityState`] is the pure state machine. [`ContinuityProbe`] wraps
//! it as an [`Interceptor`] and asks a [`RestartScheduler`] for the deferred
//! seek-to-start once a loop ends.

use crate::error::Result;
use crate::types::WorkerId;
use gstreamer::ClockTime;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Where a worker is in its loop cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuityPhase {
    /// Buffers flow and get rebased
    Streaming,
    /// End of file seen, restart not yet requested
    EosPending,
    /// Seek-to-start requested, not yet issued
    Restarting,
}

/// Stream signals the probe cares about, decoupled from the runtime's event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    /// New playback segment; `stop` is unknown for streams without a duration
    Segment { stop: Option<ClockTime> },
    Eos,
    Qos,
    FlushStart,
    FlushStop,
    Other,
}

/// What to do with an intercepted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Forward,
    Drop,
    /// Rewrite the segment base to the given value, then drop it
    RebaseAndDrop(ClockTime),
}

/// Per-worker timestamp bookkeeping
#[derive(Debug, Clone)]
pub struct ContinuityState {
    phase: ContinuityPhase,
    accumulated_base: ClockTime,
    previous_accumulated_base: ClockTime,
    /// The current segment had no stop, so its span is learned from buffers
    open_span: bool,
    /// Last file-local timestamp seen in the current segment
    last_local_pts: Option<ClockTime>,
    /// Spacing between the last two timestamps, standing in for a missing duration
    frame_step: Option<ClockTime>,
    loops_completed: u64,
    restart_failures: u64,
}

impl Default for ContinuityState {
    fn default() -> Self {
        Self::new()
    }
}

impl ContinuityState {
    pub fn new() -> Self {
        Self {
            phase: ContinuityPhase::Streaming,
            accumulated_base: ClockTime::ZERO,
            previous_accumulated_base: ClockTime::ZERO,
            open_span: false,
            last_local_pts: None,
            frame_step: None,
            loops_completed: 0,
            restart_failures: 0,
        }
    }

    pub fn phase(&self) -> ContinuityPhase {
        self.phase
    }

    pub fn accumulated_base(&self) -> ClockTime {
        self.accumulated_base
    }

    /// Offset currently added to buffer timestamps
    pub fn previous_accumulated_base(&self) -> ClockTime {
        self.previous_accumulated_base
    }

    pub fn loops_completed(&self) -> u64 {
        self.loops_completed
    }

    pub fn restart_failures(&self) -> u64 {
        self.restart_failures
    }

    /// Timestamp to stamp on a buffer carrying `pts` local to the file.
    ///
    /// Only rebased while streaming; buffers without a timestamp pass as-is.
    pub fn rebase_buffer(
        &mut self,
        pts: Option<ClockTime>,
        duration: Option<ClockTime>,
    ) -> Option<ClockTime> {
        if self.phase != ContinuityPhase::Streaming {
            return pts;
        }
        let local = pts?;
        let rebased = local.saturating_add(self.previous_accumulated_base);

        if let Some(last) = self.last_local_pts {
            if local > last {
                self.frame_step = Some(local - last);
            }
        }
        self.last_local_pts = Some(local);

        if self.open_span {
            // The span must reach past the last frame or the next loop repeats its timestamp
            let length = duration.or(self.frame_step).unwrap_or(ClockTime::ZERO);
            let end = rebased.saturating_add(length);
            if end > self.accumulated_base {
                self.accumulated_base = end;
            }
        }

        Some(rebased)
    }

    /// Account for a new segment and return the base to write into it.
    ///
    /// The base in effect so far becomes the offset for upcoming buffers and
    /// the running total grows by the segment's stop.
    pub fn apply_segment(&mut self, stop: Option<ClockTime>) -> ClockTime {
        self.previous_accumulated_base = self.accumulated_base;
        self.last_local_pts = None;
        match stop {
            Some(stop) => {
                self.accumulated_base = self.accumulated_base.saturating_add(stop);
                self.open_span = false;
            }
            None => self.open_span = true,
        }

        if self.phase != ContinuityPhase::Streaming {
            // The segment of the next loop overtook the restart bookkeeping
            self.phase = ContinuityPhase::Streaming;
        }

        self.accumulated_base
    }

    /// End of file reached. Returns true when a restart has to be scheduled.
    pub fn enter_eos(&mut self) -> bool {
        if self.phase == ContinuityPhase::Streaming {
            self.phase = ContinuityPhase::EosPending;
            true
        } else {
            false
        }
    }

    /// The restart has been handed to the scheduler
    pub fn mark_restarting(&mut self) {
        if self.phase == ContinuityPhase::EosPending {
            self.phase = ContinuityPhase::Restarting;
        }
    }

    /// The seek has been sent, successfully or not. Either way the worker
    /// streams again; a failed seek is retried on the next end-of-stream.
    pub fn restart_issued(&mut self, seek_ok: bool) {
        if seek_ok {
            self.loops_completed += 1;
        } else {
            self.restart_failures += 1;
        }
        self.phase = ContinuityPhase::Streaming;
    }
}

/// Shared handle to one worker's continuity state
pub type ContinuityHandle = Arc<Mutex<ContinuityState>>;

pub fn new_continuity_handle() -> ContinuityHandle {
    Arc::new(Mutex::new(ContinuityState::new()))
}

/// Lock a continuity handle; a panicked holder leaves consistent numbers behind
pub fn lock_state(handle: &ContinuityHandle) -> MutexGuard<'_, ContinuityState> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Called once the deferred seek has been issued
pub type RestartCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Runs the seek-to-start of a finished worker somewhere other than the
/// streaming thread. Fire-and-forget: completion of the seek is not awaited.
pub trait RestartScheduler: Send + Sync {
    fn schedule_restart(&self, on_issued: RestartCallback);
}

/// Handler installed on a worker's decoder input
pub trait Interceptor: Send + Sync {
    /// Returns the timestamp the buffer should carry downstream
    fn on_buffer(&self, pts: Option<ClockTime>, duration: Option<ClockTime>) -> Option<ClockTime>;

    fn on_event(&self, signal: LoopSignal) -> EventAction;
}

/// Continuity interceptor for a single worker
pub struct ContinuityProbe {
    worker_id: WorkerId,
    state: ContinuityHandle,
    restarter: Arc<dyn RestartScheduler>,
}

impl ContinuityProbe {
    pub fn new(
        worker_id: WorkerId,
        state: ContinuityHandle,
        restarter: Arc<dyn RestartScheduler>,
    ) -> Self {
        Self {
            worker_id,
            state,
            restarter,
        }
    }

    pub fn state(&self) -> &ContinuityHandle {
        &self.state
    }

    fn request_restart(&self) {
        let worker_id = self.worker_id;
        let state = self.state.clone();

        self.restarter.schedule_restart(Box::new(move |result| {
            let mut guard = lock_state(&state);
            match result {
                Ok(()) => {
                    guard.restart_issued(true);
                    debug!(
                        "[worker {}] Restarted from the beginning, loop {}",
                        worker_id,
                        guard.loops_completed()
                    );
                }
                Err(e) => {
                    guard.restart_issued(false);
                    warn!(
                        "[worker {}] Restart failed ({} so far), retrying on next end of stream: {}",
                        worker_id,
                        guard.restart_failures(),
                        e
                    );
                }
            }
        }));
    }
}

impl Interceptor for ContinuityProbe {
    fn on_buffer(&self, pts: Option<ClockTime>, duration: Option<ClockTime>) -> Option<ClockTime> {
        lock_state(&self.state).rebase_buffer(pts, duration)
    }

    fn on_event(&self, signal: LoopSignal) -> EventAction {
        match signal {
            LoopSignal::Segment { stop } => {
                let base = lock_state(&self.state).apply_segment(stop);
                debug!(
                    "[worker {}] Segment stop={:?} accumulated base now {}",
                    self.worker_id,
                    stop,
                    base
                );
                EventAction::RebaseAndDrop(base)
            }
            LoopSignal::Eos => {
                let schedule = {
                    let mut guard = lock_state(&self.state);
                    let schedule = guard.enter_eos();
                    if schedule {
                        guard.mark_restarting();
                    }
                    schedule
                };
                if schedule {
                    info!("[worker {}] End of file, looping", self.worker_id);
                    self.request_restart();
                }
                EventAction::Drop
            }
            LoopSignal::Qos | LoopSignal::FlushStart | LoopSignal::FlushStop => EventAction::Drop,
            LoopSignal::Other => EventAction::Forward,
        }
    }
}
