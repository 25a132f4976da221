//! Bookkeeping for admitted workers

use crate::continuity::{lock_state, ContinuityHandle, ContinuityState};
use crate::types::{DecodeBackend, WorkerId};
use chrono::{DateTime, Utc};
use gstreamer::ClockTime;

/// One admitted, looping stream.
///
/// `H` is the runtime handle for the worker's sub-graph.
#[derive(Debug)]
pub struct StreamWorker<H> {
    id: WorkerId,
    backend: DecodeBackend,
    continuity: ContinuityHandle,
    handle: H,
    admitted_at: DateTime<Utc>,
}

impl<H> StreamWorker<H> {
    pub fn new(id: WorkerId, backend: DecodeBackend, continuity: ContinuityHandle, handle: H) -> Self {
        Self {
            id,
            backend,
            continuity,
            handle,
            admitted_at: Utc::now(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn backend(&self) -> DecodeBackend {
        self.backend
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }

    pub fn accumulated_base(&self) -> ClockTime {
        lock_state(&self.continuity).accumulated_base()
    }

    pub fn previous_accumulated_base(&self) -> ClockTime {
        lock_state(&self.continuity).previous_accumulated_base()
    }

    /// Copy of the continuity state at this instant
    pub fn continuity_snapshot(&self) -> ContinuityState {
        lock_state(&self.continuity).clone()
    }
}

/// Hardware/software split across admitted workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCounts {
    pub hardware: usize,
    pub software: usize,
}

/// Admitted workers in admission order
#[derive(Debug)]
pub struct WorkerRegistry<H> {
    workers: Vec<StreamWorker<H>>,
}

impl<H> WorkerRegistry<H> {
    /// Registry with `capacity` slots reserved up front. The reservation is
    /// not a limit; admission control happens at the gate.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            workers: Vec::with_capacity(capacity),
        }
    }

    /// Append a worker. Ids must arrive in increasing order.
    pub fn register(&mut self, worker: StreamWorker<H>) -> &StreamWorker<H> {
        debug_assert!(
            self.workers.last().map_or(true, |last| last.id < worker.id),
            "worker ids must be strictly increasing"
        );
        self.workers.push(worker);
        &self.workers[self.workers.len() - 1]
    }

    pub fn get(&self, id: WorkerId) -> Option<&StreamWorker<H>> {
        self.workers
            .binary_search_by_key(&id, |worker| worker.id)
            .ok()
            .map(|idx| &self.workers[idx])
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.workers.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamWorker<H>> {
        self.workers.iter()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|worker| worker.id).collect()
    }

    pub fn backend_counts(&self) -> BackendCounts {
        self.workers
            .iter()
            .fold(BackendCounts::default(), |mut counts, worker| {
                match worker.backend {
                    DecodeBackend::Hardware => counts.hardware += 1,
                    DecodeBackend::Software => counts.software += 1,
                }
                counts
            })
    }

    /// Hand every worker back, in admission order, for teardown
    pub fn drain(&mut self) -> impl Iterator<Item = StreamWorker<H>> + '_ {
        self.workers.drain(..)
    }
}
