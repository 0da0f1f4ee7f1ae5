use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::link::WorkerLink;
use crate::store::JobId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Busy,
    Unresponsive,
    Disconnected,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Busy => write!(f, "busy"),
            WorkerState::Unresponsive => write!(f, "unresponsive"),
            WorkerState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Cheap handle to a registered worker, used to dispatch outside the
/// registry's critical section.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub link: Arc<dyn WorkerLink>,
}

/// Serializable view of a worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub address: Option<String>,
    pub capacity: usize,
    pub state: WorkerState,
    pub assignments: Vec<JobId>,
    pub last_heartbeat_ms_ago: u64,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Worker {
    pub id: WorkerId,
    pub address: Option<String>,
    pub capacity: usize,
    pub state: WorkerState,
    pub registered_at: DateTime<Utc>,
    pub(crate) assignments: HashSet<JobId>,
    /// Milliseconds since the registry epoch. Atomic so heartbeats only
    /// need shared access to the registry.
    last_heartbeat_ms: AtomicU64,
    /// Registration order, used as the tie-breaker when picking workers.
    pub(crate) seq: u64,
    pub(crate) link: Arc<dyn WorkerLink>,
}

impl Worker {
    pub(crate) fn new(
        id: WorkerId,
        address: Option<String>,
        capacity: usize,
        seq: u64,
        now_ms: u64,
        link: Arc<dyn WorkerLink>,
    ) -> Self {
        Self {
            id,
            address,
            capacity,
            state: WorkerState::Idle,
            registered_at: Utc::now(),
            assignments: HashSet::new(),
            last_heartbeat_ms: AtomicU64::new(now_ms),
            seq,
            link,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            id: self.id.clone(),
            link: self.link.clone(),
        }
    }

    pub(crate) fn touch(&self, now_ms: u64) {
        self.last_heartbeat_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    pub fn is_alive(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_ms()) < timeout_ms && self.link.is_alive()
    }

    pub fn load(&self) -> usize {
        self.assignments.len()
    }

    pub fn has_free_slot(&self) -> bool {
        self.assignments.len() < self.capacity
    }

    pub fn holds(&self, job_id: &JobId) -> bool {
        self.assignments.contains(job_id)
    }

    /// Recompute Idle/Busy from the assignment set. Unresponsive and
    /// Disconnected are sticky.
    pub(crate) fn refresh_state(&mut self) {
        if matches!(self.state, WorkerState::Idle | WorkerState::Busy) {
            self.state = if self.assignments.is_empty() {
                WorkerState::Idle
            } else {
                WorkerState::Busy
            };
        }
    }

    pub fn info(&self, now_ms: u64) -> WorkerInfo {
        let mut assignments: Vec<JobId> = self.assignments.iter().cloned().collect();
        assignments.sort();
        WorkerInfo {
            worker_id: self.id.clone(),
            address: self.address.clone(),
            capacity: self.capacity,
            state: self.state,
            assignments,
            last_heartbeat_ms_ago: now_ms.saturating_sub(self.last_heartbeat_ms()),
            registered_at: self.registered_at,
        }
    }
}
