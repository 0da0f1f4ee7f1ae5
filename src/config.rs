use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{CoordinatorError, Result};

/// Scheduling and supervision policy for the coordinator.
///
/// Timeouts are kept in milliseconds so they map one-to-one onto the
/// command line flags of the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// A worker that has not sent a heartbeat for this long is evicted.
    pub heartbeat_timeout_ms: u64,
    /// Default deadline for a single assignment when the job does not set one.
    pub assignment_timeout_ms: u64,
    /// Upper bound for job-specific assignment deadlines.
    pub max_assignment_timeout_ms: u64,
    /// Default number of retries after the first failed attempt.
    pub max_retries: u32,
    /// Submissions are rejected once this many jobs are pending.
    pub max_pending_jobs: usize,
    /// Capacity used when a worker registers without declaring one.
    pub default_worker_capacity: usize,
    pub max_payload_bytes: usize,
    /// Maximum length of caller-supplied job ids and worker ids.
    pub max_id_len: usize,
    /// How long Done/Failed jobs stay queryable before being purged.
    pub result_retention_ms: u64,
    /// Number of events kept per worker in the stats log.
    pub worker_history_len: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 10_000,
            assignment_timeout_ms: 60_000,
            max_assignment_timeout_ms: 300_000,
            max_retries: 3,
            max_pending_jobs: 10_000,
            default_worker_capacity: 1,
            max_payload_bytes: 16 * 1024 * 1024,
            max_id_len: 100,
            result_retention_ms: 3_600_000,
            worker_history_len: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = ms;
        self
    }

    pub fn with_assignment_timeout_ms(mut self, ms: u64) -> Self {
        self.assignment_timeout_ms = ms;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_pending_jobs(mut self, depth: usize) -> Self {
        self.max_pending_jobs = depth;
        self
    }

    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    pub fn with_result_retention_ms(mut self, ms: u64) -> Self {
        self.result_retention_ms = ms;
        self
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Interval of the liveness sweep: half the heartbeat timeout, so a dead
    /// worker is evicted at most 1.5 timeouts after its last heartbeat.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis((self.heartbeat_timeout_ms / 2).max(1))
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_millis(self.result_retention_ms)
    }

    /// Resolve a job-specific assignment deadline, falling back to the
    /// default and clamping to the configured maximum.
    pub fn assignment_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.assignment_timeout_ms)
            .min(self.max_assignment_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(CoordinatorError::InvalidConfig(msg.to_string()));

        if self.heartbeat_timeout_ms == 0 {
            return invalid("heartbeat timeout must be positive");
        }
        if self.assignment_timeout_ms == 0 {
            return invalid("assignment timeout must be positive");
        }
        if self.max_assignment_timeout_ms < self.assignment_timeout_ms {
            return invalid("max assignment timeout is below the default assignment timeout");
        }
        if self.max_pending_jobs == 0 {
            return invalid("max pending jobs must be positive");
        }
        if self.default_worker_capacity == 0 {
            return invalid("default worker capacity must be positive");
        }
        if self.max_payload_bytes == 0 || self.max_id_len == 0 {
            return invalid("payload and id limits must be positive");
        }
        Ok(())
    }
}

/// Process-level configuration for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, coordinator: CoordinatorConfig) -> Self {
        Self {
            listen_addr,
            coordinator,
        }
    }
}
