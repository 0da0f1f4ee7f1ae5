//! Result collector: accepts worker reports and settles the matching job.

use bytes::Bytes;
use serde::Serialize;

use crate::error::{CoordinatorError, Result};
use crate::registry::{WorkerId, WorkerRegistry};
use crate::scheduler::Scheduler;
use crate::store::{JobId, JobState, JobStatus, JobStore};

/// What a worker reports for a job it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Proven(Bytes),
    Failed(String),
}

/// Effect of an accepted report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Collected {
    Proven,
    /// The attempt failed and the job went back to the queue.
    Retrying,
    /// The attempt failed and the job is out of retries.
    Failed,
    /// Repeat of an already recorded proof.
    Duplicate,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ResultCollector;

impl ResultCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record `outcome` for `job_id` as reported by `worker_id`.
    ///
    /// The job must currently be assigned to that worker. Reports for jobs
    /// that were reassigned in the meantime are rejected as stale and leave
    /// the job untouched.
    pub fn submit_result(
        &self,
        registry: &mut WorkerRegistry,
        store: &mut JobStore,
        scheduler: &mut Scheduler,
        worker_id: &WorkerId,
        job_id: &JobId,
        outcome: Outcome,
    ) -> Result<Collected> {
        let job = store
            .get(job_id)
            .ok_or_else(|| CoordinatorError::JobNotFound(job_id.clone()))?;

        if job.assigned_worker() != Some(worker_id) {
            let duplicate = matches!(
                (&job.state, &outcome),
                (JobState::Done { proof: recorded }, Outcome::Proven(proof)) if recorded == proof
            );
            if duplicate {
                if let Outcome::Proven(proof) = outcome {
                    store.mark_done(job_id, proof)?;
                }
                return Ok(Collected::Duplicate);
            }
            tracing::debug!(
                job_id = %job_id,
                worker_id = %worker_id,
                status = %job.status(),
                "Ignoring stale result"
            );
            return Err(CoordinatorError::StaleResult {
                job_id: job_id.clone(),
                worker_id: worker_id.clone(),
            });
        }

        let released = registry.release(worker_id, job_id);
        debug_assert!(released, "assigned job missing from worker's assignment set");

        match outcome {
            Outcome::Proven(proof) if proof.is_empty() => {
                Ok(self.fail(store, scheduler, job_id, "worker returned an empty proof"))
            }
            Outcome::Proven(proof) => {
                store.mark_done(job_id, proof)?;
                Ok(Collected::Proven)
            }
            Outcome::Failed(error) => Ok(self.fail(store, scheduler, job_id, &error)),
        }
    }

    fn fail(
        &self,
        store: &mut JobStore,
        scheduler: &mut Scheduler,
        job_id: &JobId,
        reason: &str,
    ) -> Collected {
        let recycled = scheduler.recycle(store, [job_id.clone()], reason);
        match recycled.first().map(|r| r.status) {
            Some(JobStatus::Pending) => Collected::Retrying,
            _ => Collected::Failed,
        }
    }
}
