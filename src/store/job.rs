use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::registry::WorkerId;

/// Job identifier. Either supplied by the caller or a generated UUIDv4.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Assigned,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Assigned => "assigned",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live binding of a job to a worker.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub worker_id: WorkerId,
    pub assigned_at: DateTime<Utc>,
    pub deadline: Instant,
}

/// Lifecycle state of a job. Data that only exists in one state lives in
/// that variant, so an assigned job always carries its worker and timestamp.
#[derive(Debug, Clone)]
pub enum JobState {
    Pending,
    Assigned(Assignment),
    Done { proof: Bytes },
    Failed { reason: String },
}

/// Terminal result handed to callers waiting on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Proven(Bytes),
    Failed(String),
}

/// Caller-controlled knobs for a single submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub job_id: Option<JobId>,
    /// Overrides the configured retry budget for this job.
    pub max_retries: Option<u32>,
    /// Overrides the configured assignment deadline, in milliseconds.
    pub assignment_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub payload: Bytes,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Submission order, used to keep recycled jobs in FIFO order.
    pub seq: u64,
    /// Failed attempts so far (worker errors, timeouts, evictions).
    pub failures: u32,
    pub max_retries: u32,
    pub assignment_timeout: Duration,
    /// Reason of the most recent failed attempt, kept across retries.
    pub last_error: Option<String>,
    pub(crate) finished: Option<Instant>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        payload: Bytes,
        seq: u64,
        max_retries: u32,
        assignment_timeout: Duration,
    ) -> Self {
        Self {
            id,
            payload,
            state: JobState::Pending,
            submitted_at: Utc::now(),
            completed_at: None,
            seq,
            failures: 0,
            max_retries,
            assignment_timeout,
            last_error: None,
            finished: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Assigned(_) => JobStatus::Assigned,
            JobState::Done { .. } => JobStatus::Done,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn assignment(&self) -> Option<&Assignment> {
        match &self.state {
            JobState::Assigned(assignment) => Some(assignment),
            _ => None,
        }
    }

    pub fn assigned_worker(&self) -> Option<&WorkerId> {
        self.assignment().map(|a| &a.worker_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Retries this job may still consume before failing terminally.
    pub fn retries_left(&self) -> u32 {
        self.max_retries.saturating_sub(self.failures)
    }

    pub fn completion(&self) -> Option<Completion> {
        match &self.state {
            JobState::Done { proof } => Some(Completion::Proven(proof.clone())),
            JobState::Failed { reason } => Some(Completion::Failed(reason.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            JobId::from("j"),
            Bytes::from_static(b"witness"),
            0,
            3,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn new_job_is_pending() {
        let job = job();
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.assigned_worker().is_none());
        assert!(job.completion().is_none());
        assert_eq!(job.retries_left(), 3);
    }

    #[test]
    fn assigned_state_carries_worker() {
        let mut job = job();
        job.state = JobState::Assigned(Assignment {
            worker_id: WorkerId::from("w1"),
            assigned_at: Utc::now(),
            deadline: Instant::now(),
        });
        assert_eq!(job.status(), JobStatus::Assigned);
        assert_eq!(job.assigned_worker(), Some(&WorkerId::from("w1")));
        assert!(!job.is_terminal());
    }

    #[test]
    fn terminal_states_produce_completion() {
        let mut job = job();
        job.state = JobState::Done {
            proof: Bytes::from_static(b"proof"),
        };
        assert_eq!(
            job.completion(),
            Some(Completion::Proven(Bytes::from_static(b"proof")))
        );

        job.state = JobState::Failed {
            reason: "boom".to_string(),
        };
        assert_eq!(job.completion(), Some(Completion::Failed("boom".to_string())));
        assert!(job.is_terminal());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(JobId::generate(), JobId::generate());
    }

    #[test]
    fn status_display() {
        assert_eq!(JobStatus::Assigned.to_string(), "assigned");
        assert_eq!(
            serde_json::to_string(&JobStatus::Failed).unwrap(),
            "\"failed\""
        );
    }
}
