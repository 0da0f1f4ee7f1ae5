//! Worker registry: connected provers, their capacity and liveness.
//!
//! Mutations (register, acquire, release, evict) need exclusive access and
//! are serialized by the coordinator. Heartbeats only need shared access.

pub mod link;
pub mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::time::Instant;

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::store::JobId;

pub use link::{mailbox, Dispatch, LinkClosed, Mailbox, MailboxLink, WorkerLink};
pub use worker::{Worker, WorkerHandle, WorkerId, WorkerInfo, WorkerState};

#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, Worker>,
    epoch: Instant,
    next_seq: u64,
    heartbeat_timeout_ms: u64,
    default_capacity: usize,
    max_id_len: usize,
}

impl WorkerRegistry {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            workers: HashMap::new(),
            epoch: Instant::now(),
            next_seq: 0,
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
            default_capacity: config.default_worker_capacity,
            max_id_len: config.max_id_len,
        }
    }

    /// Register a worker. Fails if the id is already active.
    pub fn register(
        &mut self,
        worker_id: WorkerId,
        address: Option<String>,
        capacity: Option<usize>,
        link: Arc<dyn WorkerLink>,
    ) -> Result<WorkerHandle> {
        let len = worker_id.as_str().len();
        if len == 0 || len > self.max_id_len {
            return Err(CoordinatorError::InvalidWorker(format!(
                "worker id length must be between 1 and {}, found {len}",
                self.max_id_len
            )));
        }
        let capacity = capacity.unwrap_or(self.default_capacity);
        if capacity == 0 {
            return Err(CoordinatorError::InvalidWorker(
                "capacity must be at least 1".to_string(),
            ));
        }
        if self.workers.contains_key(&worker_id) {
            return Err(CoordinatorError::DuplicateWorker(worker_id));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let worker = Worker::new(worker_id.clone(), address, capacity, seq, self.now_ms(), link);
        let handle = worker.handle();
        tracing::info!(worker_id = %worker_id, capacity, "Worker registered");
        self.workers.insert(worker_id, worker);
        Ok(handle)
    }

    pub fn heartbeat(&self, worker_id: &WorkerId) -> Result<()> {
        let worker = self
            .workers
            .get(worker_id)
            .ok_or_else(|| CoordinatorError::UnknownWorker(worker_id.clone()))?;
        worker.touch(self.now_ms());
        Ok(())
    }

    /// Reserve a slot for `job_id` on a live worker with free capacity.
    ///
    /// Least-loaded workers are preferred; ties go to the worker that
    /// registered first. Returns `None` when no worker can take the job.
    pub fn acquire_idle_worker(&mut self, job_id: &JobId) -> Option<WorkerHandle> {
        let now_ms = self.now_ms();
        let timeout_ms = self.heartbeat_timeout_ms;

        let worker = self
            .workers
            .values_mut()
            .filter(|w| matches!(w.state, WorkerState::Idle | WorkerState::Busy))
            .filter(|w| w.has_free_slot() && w.is_alive(now_ms, timeout_ms))
            .min_by_key(|w| (w.load(), w.seq))?;

        worker.assignments.insert(job_id.clone());
        worker.refresh_state();
        debug_assert!(worker.assignments.len() <= worker.capacity);
        Some(worker.handle())
    }

    /// Free the slot held by `job_id`. Returns false if the worker is gone
    /// or did not hold the job.
    pub fn release(&mut self, worker_id: &WorkerId, job_id: &JobId) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };
        let released = worker.assignments.remove(job_id);
        worker.refresh_state();
        released
    }

    /// Remove a worker and return the jobs it was holding.
    pub fn evict(&mut self, worker_id: &WorkerId) -> Result<HashSet<JobId>> {
        let worker = self
            .workers
            .remove(worker_id)
            .ok_or_else(|| CoordinatorError::UnknownWorker(worker_id.clone()))?;
        tracing::info!(
            worker_id = %worker_id,
            state = %worker.state,
            in_flight = worker.assignments.len(),
            "Worker removed"
        );
        Ok(worker.assignments)
    }

    /// Mark workers whose heartbeat is older than the timeout, or whose link
    /// has died, as Unresponsive and return their ids.
    pub fn mark_unresponsive(&mut self) -> Vec<WorkerId> {
        let now_ms = self.now_ms();
        let timeout_ms = self.heartbeat_timeout_ms;

        let mut expired: Vec<&mut Worker> = self
            .workers
            .values_mut()
            .filter(|w| !w.is_alive(now_ms, timeout_ms))
            .collect();
        expired.sort_by_key(|w| w.seq);

        expired
            .into_iter()
            .map(|w| {
                w.state = WorkerState::Unresponsive;
                tracing::warn!(
                    worker_id = %w.id,
                    silent_ms = now_ms.saturating_sub(w.last_heartbeat_ms()),
                    "Worker unresponsive"
                );
                w.id.clone()
            })
            .collect()
    }

    /// Flag a worker as going away so no new work is handed to it.
    pub fn mark_disconnected(&mut self, worker_id: &WorkerId) -> Result<()> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| CoordinatorError::UnknownWorker(worker_id.clone()))?;
        worker.state = WorkerState::Disconnected;
        Ok(())
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<&Worker> {
        self.workers.get(worker_id)
    }

    /// Whether `handle` still belongs to the registered worker with its id.
    /// A handle taken before the id was evicted and registered again is not.
    pub fn is_current(&self, handle: &WorkerHandle) -> bool {
        self.workers
            .get(&handle.id)
            .is_some_and(|w| Arc::ptr_eq(&w.link, &handle.link))
    }

    pub fn holds(&self, worker_id: &WorkerId, job_id: &JobId) -> bool {
        self.workers
            .get(worker_id)
            .is_some_and(|w| w.holds(job_id))
    }

    /// Workers ordered by registration.
    pub fn all_workers(&self) -> Vec<&Worker> {
        let mut workers: Vec<&Worker> = self.workers.values().collect();
        workers.sort_by_key(|w| w.seq);
        workers
    }

    pub fn infos(&self) -> Vec<WorkerInfo> {
        let now_ms = self.now_ms();
        self.all_workers()
            .into_iter()
            .map(|w| w.info(now_ms))
            .collect()
    }

    /// Number of workers currently able to take another job.
    pub fn available_slots(&self) -> usize {
        let now_ms = self.now_ms();
        self.workers
            .values()
            .filter(|w| matches!(w.state, WorkerState::Idle | WorkerState::Busy))
            .filter(|w| w.is_alive(now_ms, self.heartbeat_timeout_ms))
            .map(|w| w.capacity - w.load())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn now_ms(&self) -> u64 {
        Instant::now().saturating_duration_since(self.epoch).as_millis() as u64
    }
}
