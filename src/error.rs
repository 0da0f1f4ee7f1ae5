use thiserror::Error;

use crate::store::JobId;
use crate::registry::WorkerId;

/// Coarse error classes reported to callers alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad payload, ids or configuration. No side effect.
    Validation,
    /// Unknown job or worker.
    NotFound,
    /// Duplicate registration, stale result or invalid transition. Ignored.
    Conflict,
    /// Queue depth exceeded. The request was rejected.
    ResourceExhausted,
    /// A caller-side deadline elapsed. The job is unaffected.
    Timeout,
    /// A worker could not be reached. Handled by recycling its jobs.
    WorkerFault,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::ResourceExhausted => write!(f, "resource_exhausted"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::WorkerFault => write!(f, "worker_fault"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Payload too large: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Invalid job id: {0}")]
    InvalidJobId(String),

    #[error("Invalid worker registration: {0}")]
    InvalidWorker(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(WorkerId),

    #[error("Job id already in use: {0}")]
    DuplicateJob(JobId),

    #[error("Stale result for job {job_id} from worker {worker_id}")]
    StaleResult { job_id: JobId, worker_id: WorkerId },

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Coordinator busy: {depth} jobs pending (limit {limit})")]
    CoordinatorBusy { depth: usize, limit: usize },

    #[error("Timed out waiting for job {0}")]
    Timeout(JobId),

    #[error("Worker unreachable: {0}")]
    WorkerUnreachable(WorkerId),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::InvalidPayload(_)
            | CoordinatorError::PayloadTooLarge { .. }
            | CoordinatorError::InvalidJobId(_)
            | CoordinatorError::InvalidWorker(_)
            | CoordinatorError::InvalidConfig(_) => ErrorKind::Validation,
            CoordinatorError::JobNotFound(_) | CoordinatorError::UnknownWorker(_) => {
                ErrorKind::NotFound
            }
            CoordinatorError::DuplicateWorker(_)
            | CoordinatorError::DuplicateJob(_)
            | CoordinatorError::StaleResult { .. }
            | CoordinatorError::InvalidTransition { .. } => ErrorKind::Conflict,
            CoordinatorError::CoordinatorBusy { .. } => ErrorKind::ResourceExhausted,
            CoordinatorError::Timeout(_) => ErrorKind::Timeout,
            CoordinatorError::WorkerUnreachable(_) => ErrorKind::WorkerFault,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let job = JobId::from("job-1");
        let worker = WorkerId::from("w1");

        assert_eq!(
            CoordinatorError::PayloadTooLarge { size: 10, limit: 5 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            CoordinatorError::StaleResult {
                job_id: job.clone(),
                worker_id: worker.clone()
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            CoordinatorError::CoordinatorBusy { depth: 1, limit: 1 }.kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(CoordinatorError::Timeout(job.clone()).kind(), ErrorKind::Timeout);
        assert_eq!(CoordinatorError::JobNotFound(job).kind(), ErrorKind::NotFound);
        assert_eq!(
            CoordinatorError::WorkerUnreachable(worker).kind(),
            ErrorKind::WorkerFault
        );
    }

    #[test]
    fn messages_name_the_entity() {
        let err = CoordinatorError::InvalidTransition {
            job_id: JobId::from("abc"),
            from: "pending",
            to: "done",
        };
        assert_eq!(err.to_string(), "Invalid transition for job abc: pending -> done");
    }
}
