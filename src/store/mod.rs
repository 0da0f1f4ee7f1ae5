//! Job store: owns every submitted job and its lifecycle state.
//!
//! Transitions:
//!
//! ```text
//! Pending --mark_assigned--> Assigned --mark_done--> Done
//!                               |
//!                               +--mark_failed--> Pending (retry) | Failed
//! ```
//!
//! Done and Failed are terminal. Callers blocked on a job register a
//! oneshot waiter which is signalled exactly once, on the terminal
//! transition.

pub mod job;

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::registry::WorkerId;

pub use job::{Assignment, Completion, Job, JobId, JobState, JobStatus, SubmitOptions};

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub assigned: usize,
    pub done: usize,
    pub failed: usize,
}

/// Outcome of registering interest in a job's result.
#[derive(Debug)]
pub enum Waiter {
    /// The job was already terminal.
    Ready(Completion),
    Waiting(oneshot::Receiver<Completion>),
}

#[derive(Debug)]
pub struct JobStore {
    jobs: HashMap<JobId, Job>,
    waiters: HashMap<JobId, Vec<oneshot::Sender<Completion>>>,
    next_seq: u64,
    config: CoordinatorConfig,
}

impl JobStore {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            jobs: HashMap::new(),
            waiters: HashMap::new(),
            next_seq: 0,
            config,
        }
    }

    /// Check a submission without touching the store.
    pub fn validate(&self, payload: &[u8], options: &SubmitOptions) -> Result<()> {
        if payload.is_empty() {
            return Err(CoordinatorError::InvalidPayload(
                "payload cannot be empty".to_string(),
            ));
        }
        if payload.len() > self.config.max_payload_bytes {
            return Err(CoordinatorError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_payload_bytes,
            });
        }
        if let Some(id) = &options.job_id {
            let len = id.as_str().len();
            if len == 0 || len > self.config.max_id_len {
                return Err(CoordinatorError::InvalidJobId(format!(
                    "length must be between 1 and {}, found {len}",
                    self.config.max_id_len
                )));
            }
            if id.as_str().chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(CoordinatorError::InvalidJobId(
                    "id cannot contain whitespace or control characters".to_string(),
                ));
            }
            if self.jobs.contains_key(id) {
                return Err(CoordinatorError::DuplicateJob(id.clone()));
            }
        }
        Ok(())
    }

    /// Create a Pending job and return its id.
    pub fn submit(&mut self, payload: Bytes, options: SubmitOptions) -> Result<JobId> {
        self.validate(&payload, &options)?;

        let id = options.job_id.unwrap_or_else(JobId::generate);
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let timeout = self.config.assignment_timeout(options.assignment_timeout_ms);

        let seq = self.next_seq;
        self.next_seq += 1;

        let job = Job::new(id.clone(), payload, seq, max_retries, timeout);
        tracing::info!(job_id = %id, bytes = job.payload.len(), max_retries, "Job submitted");
        self.jobs.insert(id.clone(), job);
        Ok(id)
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Pending -> Assigned. Rejects any other source state, which protects
    /// against handing the same job to two workers.
    pub fn mark_assigned(
        &mut self,
        id: &JobId,
        worker_id: &WorkerId,
        deadline: Instant,
    ) -> Result<()> {
        let job = self.job_mut(id)?;
        if !matches!(job.state, JobState::Pending) {
            return Err(invalid_transition(job, JobStatus::Assigned));
        }
        job.state = JobState::Assigned(Assignment {
            worker_id: worker_id.clone(),
            assigned_at: Utc::now(),
            deadline,
        });
        Ok(())
    }

    /// Assigned -> Done. Reporting the same proof for a job that is already
    /// Done is a no-op.
    pub fn mark_done(&mut self, id: &JobId, proof: Bytes) -> Result<()> {
        let job = self.job_mut(id)?;
        match &job.state {
            JobState::Assigned(_) => {}
            JobState::Done { proof: existing } if *existing == proof => {
                tracing::debug!(job_id = %id, "Duplicate completion ignored");
                return Ok(());
            }
            _ => return Err(invalid_transition(job, JobStatus::Done)),
        }

        job.state = JobState::Done { proof };
        job.completed_at = Some(Utc::now());
        job.finished = Some(Instant::now());
        tracing::info!(job_id = %id, attempts = job.failures + 1, "Job proven");
        self.notify(id);
        Ok(())
    }

    /// Assigned -> Pending while the job has retries left, otherwise
    /// Assigned -> Failed. Returns the resulting status.
    pub fn mark_failed(&mut self, id: &JobId, reason: &str) -> Result<JobStatus> {
        let job = self.job_mut(id)?;
        if !matches!(job.state, JobState::Assigned(_)) {
            return Err(invalid_transition(job, JobStatus::Failed));
        }

        job.failures += 1;
        job.last_error = Some(reason.to_string());

        if job.failures <= job.max_retries {
            job.state = JobState::Pending;
            tracing::info!(
                job_id = %id,
                failures = job.failures,
                retries_left = job.retries_left(),
                reason,
                "Job attempt failed, retrying"
            );
            return Ok(JobStatus::Pending);
        }

        job.state = JobState::Failed {
            reason: format!("retries exhausted after {} attempts: {reason}", job.failures),
        };
        job.completed_at = Some(Utc::now());
        job.finished = Some(Instant::now());
        tracing::warn!(job_id = %id, failures = job.failures, reason, "Job failed");
        self.notify(id);
        Ok(JobStatus::Failed)
    }

    /// Register interest in a job's terminal result.
    pub fn subscribe(&mut self, id: &JobId) -> Result<Waiter> {
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| CoordinatorError::JobNotFound(id.clone()))?;
        if let Some(completion) = job.completion() {
            return Ok(Waiter::Ready(completion));
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.entry(id.clone()).or_default().push(tx);
        Ok(Waiter::Waiting(rx))
    }

    /// Remove a terminal job on explicit acknowledgement.
    pub fn acknowledge(&mut self, id: &JobId) -> Result<Job> {
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| CoordinatorError::JobNotFound(id.clone()))?;
        if !job.is_terminal() {
            return Err(CoordinatorError::InvalidTransition {
                job_id: id.clone(),
                from: job.status().as_str(),
                to: "acknowledged",
            });
        }
        self.waiters.remove(id);
        self.jobs
            .remove(id)
            .ok_or_else(|| CoordinatorError::JobNotFound(id.clone()))
    }

    /// Drop terminal jobs that finished more than `retention` before `now`.
    pub fn purge_expired(&mut self, now: Instant, retention: Duration) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| match job.finished {
            Some(finished) => now.saturating_duration_since(finished) < retention,
            None => true,
        });
        before - self.jobs.len()
    }

    /// Forget waiters whose callers gave up.
    pub fn prune_waiters(&mut self) {
        self.waiters.retain(|_, senders| {
            senders.retain(|tx| !tx.is_closed());
            !senders.is_empty()
        });
    }

    /// Assignments whose deadline is at or before `now`.
    pub fn overdue_assignments(&self, now: Instant) -> Vec<(JobId, WorkerId)> {
        let mut overdue: Vec<&Job> = self
            .jobs
            .values()
            .filter(|job| job.assignment().is_some_and(|a| a.deadline <= now))
            .collect();
        overdue.sort_by_key(|job| job.seq);
        overdue
            .into_iter()
            .filter_map(|job| job.assigned_worker().map(|w| (job.id.clone(), w.clone())))
            .collect()
    }

    /// All jobs ordered by submission.
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|job| job.seq);
        jobs
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.jobs.values() {
            match job.status() {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Assigned => counts.assigned += 1,
                JobStatus::Done => counts.done += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn waiter_count(&self, id: &JobId) -> usize {
        self.waiters.get(id).map_or(0, Vec::len)
    }

    fn job_mut(&mut self, id: &JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::JobNotFound(id.clone()))
    }

    fn notify(&mut self, id: &JobId) {
        let Some(completion) = self.jobs.get(id).and_then(Job::completion) else {
            return;
        };
        for tx in self.waiters.remove(id).unwrap_or_default() {
            // A closed receiver means that caller stopped waiting.
            let _ = tx.send(completion.clone());
        }
    }
}

fn invalid_transition(job: &Job, to: JobStatus) -> CoordinatorError {
    CoordinatorError::InvalidTransition {
        job_id: job.id.clone(),
        from: job.status().as_str(),
        to: to.as_str(),
    }
}
