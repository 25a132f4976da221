//! Admission scheduler: adds looping workers while the machine has headroom

use crate::continuity::ContinuityHandle;
use crate::decoder::DecoderSelector;
use crate::error::{Error, Result};
use crate::registry::{StreamWorker, WorkerRegistry};
use crate::resource::{Reading, ResourceSample, ResourceSampler};
use crate::types::{AdmissionConfig, DecodeBackend, WorkerId};
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A freshly built worker sub-graph, not yet attached anywhere
pub struct BuiltWorker<H> {
    pub handle: H,
    pub continuity: ContinuityHandle,
}

/// Builds the ingestion sub-graph of one worker
pub trait WorkerFactory {
    type Handle;

    /// Build atomically: on error nothing of the worker survives
    fn build(&mut self, id: WorkerId, uri: &str, backend: DecodeBackend) -> Result<BuiltWorker<Self::Handle>>;
}

/// Connects built workers to the shared multiplexer
pub trait WorkerHost<H> {
    /// Attach to the next muxer input and bring the worker up. On error the
    /// host removes whatever it added.
    fn attach(&mut self, id: WorkerId, handle: &H) -> Result<()>;

    /// Stop the worker and remove it along with its muxer input
    fn detach(&mut self, id: WorkerId, handle: &H) -> Result<()>;
}

/// Closed when both the decoder and the CPU are busy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionGate {
    pub decoder_percent: f64,
    pub cpu_percent: f64,
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self {
            decoder_percent: 90.0,
            cpu_percent: 75.0,
        }
    }
}

impl AdmissionGate {
    pub fn is_open(&self, sample: &ResourceSample) -> bool {
        !(sample.decoder_percent() > self.decoder_percent && sample.cpu_percent() > self.cpu_percent)
    }
}

/// Process-wide admission counters
#[derive(Debug, Clone)]
pub struct AdmissionState {
    next_worker_id: u32,
    target_uri: String,
    total_requested: u32,
    admitted: u32,
}

impl AdmissionState {
    pub fn new(target_uri: impl Into<String>, total_requested: u32) -> Self {
        Self {
            next_worker_id: 0,
            target_uri: target_uri.into(),
            total_requested,
            admitted: 0,
        }
    }

    /// Hand out the next id. Ids are consumed even when admission fails.
    fn allocate_id(&mut self) -> WorkerId {
        let id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;
        id
    }

    pub fn next_worker_id(&self) -> WorkerId {
        WorkerId(self.next_worker_id)
    }

    pub fn target_uri(&self) -> &str {
        &self.target_uri
    }

    pub fn total_requested(&self) -> u32 {
        self.total_requested
    }

    pub fn admitted(&self) -> u32 {
        self.admitted
    }
}

/// Result of one admission tick
#[derive(Debug)]
pub enum TickOutcome {
    Admitted { id: WorkerId, backend: DecodeBackend },
    /// Gate closed, nothing built
    Deferred { sample: ResourceSample },
    /// Configured hard ceiling reached
    AtCapacity { admitted: u32 },
    /// Build or attach failed; the id is retired
    Failed { id: WorkerId, error: Error },
}

impl TickOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, TickOutcome::Admitted { .. })
    }
}

/// Timer-driven admission loop body.
///
/// Owns the registry and the admission counters; all methods run on the
/// control thread.
pub struct AdmissionScheduler<S, F, W>
where
    F: WorkerFactory,
{
    scheduler_id: String,
    state: AdmissionState,
    gate: AdmissionGate,
    selector: DecoderSelector,
    max_workers: Option<u32>,
    sampler: S,
    factory: F,
    host: W,
    registry: WorkerRegistry<F::Handle>,
}

impl<S, F, W> AdmissionScheduler<S, F, W>
where
    S: ResourceSampler,
    F: WorkerFactory,
    W: WorkerHost<F::Handle>,
{
    pub fn new(config: &AdmissionConfig, sampler: S, factory: F, host: W) -> Self {
        let scheduler_id = format!("admission_{}", Uuid::new_v4());
        Self {
            scheduler_id,
            state: AdmissionState::new(config.uri.clone(), config.initial_workers),
            gate: AdmissionGate {
                decoder_percent: config.decoder_gate_percent,
                cpu_percent: config.cpu_gate_percent,
            },
            selector: DecoderSelector::new(config.software_fallback_percent),
            max_workers: config.max_workers,
            sampler,
            factory,
            host,
            registry: WorkerRegistry::with_capacity(config.registry_capacity()),
        }
    }

    /// Admit the startup workers without consulting the gate. Each one gets
    /// its own load sample for the backend choice. Stops at the first failure.
    pub fn admit_initial(&mut self) -> Result<Vec<WorkerId>> {
        let requested = self.state.total_requested;
        info!("[{}] Admitting {} initial workers", self.scheduler_id, requested);

        let mut admitted = Vec::with_capacity(requested as usize);
        for _ in 0..requested {
            let sample = self.take_sample();
            let backend = self.selector.select(&sample);
            let id = self.state.allocate_id();
            self.admit(id, backend)?;
            admitted.push(id);
        }
        Ok(admitted)
    }

    /// One admission tick
    pub fn tick(&mut self) -> TickOutcome {
        let sample = self.take_sample();

        if !self.gate.is_open(&sample) {
            info!(
                "[{}] Load too high, deferring admission: decoder={:.0}% cpu={:.0}%",
                self.scheduler_id,
                sample.decoder_percent(),
                sample.cpu_percent()
            );
            return TickOutcome::Deferred { sample };
        }

        if let Some(max) = self.max_workers {
            if self.state.admitted >= max {
                return TickOutcome::AtCapacity {
                    admitted: self.state.admitted,
                };
            }
        }

        let backend = self.selector.select(&sample);
        let id = self.state.allocate_id();
        match self.admit(id, backend) {
            Ok(()) => TickOutcome::Admitted { id, backend },
            Err(e) => {
                error!("[{}] Failed to admit worker {}: {}", self.scheduler_id, id, e);
                TickOutcome::Failed { id, error: e }
            }
        }
    }

    /// Detach every admitted worker in admission order and empty the
    /// registry. Returns the ids that came off cleanly.
    pub fn shutdown(&mut self) -> Vec<WorkerId> {
        let workers: Vec<StreamWorker<F::Handle>> = self.registry.drain().collect();
        info!("[{}] Detaching {} workers", self.scheduler_id, workers.len());

        let mut detached = Vec::with_capacity(workers.len());
        for worker in workers {
            let continuity = worker.continuity_snapshot();
            let uptime = Utc::now().signed_duration_since(worker.admitted_at());
            info!(
                "[{}] Worker {} ({}) ran {}s, {} loops, {} failed restarts",
                self.scheduler_id,
                worker.id(),
                worker.backend(),
                uptime.num_seconds(),
                continuity.loops_completed(),
                continuity.restart_failures()
            );

            match self.host.detach(worker.id(), worker.handle()) {
                Ok(()) => detached.push(worker.id()),
                Err(e) => warn!("[{}] Failed to detach worker {}: {}", self.scheduler_id, worker.id(), e),
            }
        }
        detached
    }

    fn take_sample(&mut self) -> ResourceSample {
        let sample = self.sampler.sample();
        if let Reading::Degraded { fallback, reason } = &sample.cpu {
            warn!(
                "[{}] CPU sample degraded, using {:.0}%: {}",
                self.scheduler_id, fallback, reason
            );
        }
        if let Reading::Degraded { fallback, reason } = &sample.decoder {
            warn!(
                "[{}] Decoder sample degraded, using {:.0}%: {}",
                self.scheduler_id, fallback, reason
            );
        }
        sample
    }

    fn admit(&mut self, id: WorkerId, backend: DecodeBackend) -> Result<()> {
        info!(
            "[{}] Adding worker {} with {} decoding",
            self.scheduler_id, id, backend
        );

        let built = self.factory.build(id, &self.state.target_uri, backend)?;
        self.host.attach(id, &built.handle)?;

        self.registry
            .register(StreamWorker::new(id, backend, built.continuity, built.handle));
        self.state.admitted += 1;

        let counts = self.registry.backend_counts();
        info!(
            "[{}] Worker {} running; hardware decoders={} software decoders={}",
            self.scheduler_id, id, counts.hardware, counts.software
        );
        Ok(())
    }

    pub fn scheduler_id(&self) -> &str {
        &self.scheduler_id
    }

    pub fn state(&self) -> &AdmissionState {
        &self.state
    }

    pub fn registry(&self) -> &WorkerRegistry<F::Handle> {
        &self.registry
    }

    pub fn host(&self) -> &W {
        &self.host
    }
}
