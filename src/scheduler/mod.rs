//! Scheduler: pairs pending jobs with idle workers and recycles jobs whose
//! assignment was invalidated.
//!
//! The scheduler never touches a worker or job directly. It goes through
//! [`WorkerRegistry`] and [`JobStore`] operations, and the caller is
//! expected to hold exclusive access to both for the duration of a call so
//! that assignment and eviction are atomic with respect to each other.

pub mod queue;

use tokio::time::Instant;

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::registry::{Dispatch, WorkerHandle, WorkerId, WorkerRegistry};
use crate::store::{JobId, JobStatus, JobStore};

pub use queue::PendingQueue;

/// Where a recycled job ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recycled {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// A dispatch that still has to be sent through the worker's link.
#[derive(Debug, Clone)]
pub struct PendingDispatch {
    pub worker: WorkerHandle,
    pub dispatch: Dispatch,
}

/// An assignment that missed its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub worker_id: WorkerId,
    pub recycled: Recycled,
}

#[derive(Debug)]
pub struct Scheduler {
    queue: PendingQueue,
    max_pending: usize,
}

impl Scheduler {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            queue: PendingQueue::new(),
            max_pending: config.max_pending_jobs,
        }
    }

    /// Reject new submissions once the pending queue is full.
    pub fn check_capacity(&self) -> Result<()> {
        if self.queue.len() >= self.max_pending {
            return Err(CoordinatorError::CoordinatorBusy {
                depth: self.queue.len(),
                limit: self.max_pending,
            });
        }
        Ok(())
    }

    /// Append a freshly submitted job.
    pub fn enqueue(&mut self, job_id: JobId) {
        self.queue.push_back(job_id);
    }

    /// Assign queued jobs, head first, until the queue is empty or no worker
    /// has a free slot. Returned dispatches must be sent by the caller once
    /// it has released its lock.
    pub fn schedule(
        &mut self,
        registry: &mut WorkerRegistry,
        store: &mut JobStore,
    ) -> Vec<PendingDispatch> {
        std::iter::from_fn(|| self.schedule_next(registry, store)).collect()
    }

    /// Assign the job at the head of the queue, if some worker has a free
    /// slot. Entries that can no longer be assigned are dropped on the way.
    pub fn schedule_next(
        &mut self,
        registry: &mut WorkerRegistry,
        store: &mut JobStore,
    ) -> Option<PendingDispatch> {
        while let Some(job_id) = self.queue.front().cloned() {
            let worker = registry.acquire_idle_worker(&job_id)?;
            self.queue.pop_front();

            let Some(job) = store.get(&job_id) else {
                tracing::warn!(job_id = %job_id, "Queued job missing from store");
                registry.release(&worker.id, &job_id);
                continue;
            };
            let payload = job.payload.clone();
            let attempt = job.failures + 1;
            let timeout = job.assignment_timeout;

            if let Err(e) = store.mark_assigned(&job_id, &worker.id, Instant::now() + timeout) {
                tracing::warn!(job_id = %job_id, error = %e, "Skipping queued job");
                registry.release(&worker.id, &job_id);
                continue;
            }

            tracing::info!(job_id = %job_id, worker_id = %worker.id, attempt, "Job assigned");
            return Some(PendingDispatch {
                dispatch: Dispatch {
                    job_id,
                    payload,
                    attempt,
                    timeout_ms: timeout.as_millis() as u64,
                },
                worker,
            });
        }
        None
    }

    /// Return assigned jobs to the queue, consuming one retry each. Jobs
    /// that are out of retries become Failed instead.
    ///
    /// Requeued jobs go to the head of the queue, keeping their relative
    /// submission order.
    pub fn recycle(
        &mut self,
        store: &mut JobStore,
        jobs: impl IntoIterator<Item = JobId>,
        reason: &str,
    ) -> Vec<Recycled> {
        let mut jobs: Vec<(u64, JobId)> = jobs
            .into_iter()
            .filter_map(|id| match store.get(&id) {
                Some(job) => Some((job.seq, id)),
                None => {
                    tracing::warn!(job_id = %id, "Cannot recycle unknown job");
                    None
                }
            })
            .collect();
        jobs.sort_by_key(|(seq, _)| *seq);

        let mut recycled = Vec::with_capacity(jobs.len());
        for (_, job_id) in jobs.into_iter().rev() {
            match store.mark_failed(&job_id, reason) {
                Ok(status) => {
                    if status == JobStatus::Pending {
                        self.queue.push_front(job_id.clone());
                    }
                    recycled.push(Recycled { job_id, status });
                }
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Cannot recycle job"),
            }
        }
        recycled.reverse();
        recycled
    }

    /// Evict a worker and recycle everything it was holding.
    pub fn reclaim_worker(
        &mut self,
        registry: &mut WorkerRegistry,
        store: &mut JobStore,
        worker_id: &WorkerId,
        reason: &str,
    ) -> Result<Vec<Recycled>> {
        let in_flight = registry.evict(worker_id)?;
        Ok(self.recycle(store, in_flight, reason))
    }

    /// Release and recycle every assignment whose deadline has passed. The
    /// worker itself stays registered.
    pub fn expire_assignments(
        &mut self,
        registry: &mut WorkerRegistry,
        store: &mut JobStore,
        now: Instant,
    ) -> Vec<Expired> {
        store
            .overdue_assignments(now)
            .into_iter()
            .filter_map(|(job_id, worker_id)| {
                self.expire_assignment(registry, store, &job_id, &worker_id, now)
            })
            .collect()
    }

    /// Recycle one assignment if it is still held by `worker_id` and its
    /// deadline has passed by `now`. Returns `None` when the job has moved on.
    pub fn expire_assignment(
        &mut self,
        registry: &mut WorkerRegistry,
        store: &mut JobStore,
        job_id: &JobId,
        worker_id: &WorkerId,
        now: Instant,
    ) -> Option<Expired> {
        let overdue = store
            .get(job_id)
            .and_then(|job| job.assignment())
            .is_some_and(|a| &a.worker_id == worker_id && a.deadline <= now);
        if !overdue {
            return None;
        }

        registry.release(worker_id, job_id);
        tracing::warn!(job_id = %job_id, worker_id = %worker_id, "Assignment timed out");
        let reason = format!("assignment to worker {worker_id} timed out");
        self.recycle(store, [job_id.clone()], &reason)
            .into_iter()
            .next()
            .map(|recycled| Expired {
                worker_id: worker_id.clone(),
                recycled,
            })
    }

    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    /// Pending job ids in dispatch order.
    pub fn queued(&self) -> Vec<JobId> {
        self.queue.iter().cloned().collect()
    }
}
