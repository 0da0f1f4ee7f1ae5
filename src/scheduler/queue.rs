use std::collections::VecDeque;

use crate::store::JobId;

/// Ordered queue of pending job ids.
///
/// Fresh submissions join at the back. Recycled jobs rejoin at the front so
/// a job that already lost an attempt is not starved by new work.
#[derive(Debug, Default)]
pub struct PendingQueue {
    jobs: VecDeque<JobId>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, job_id: JobId) {
        self.jobs.push_back(job_id);
    }

    pub fn push_front(&mut self, job_id: JobId) {
        self.jobs.push_front(job_id);
    }

    pub fn front(&self) -> Option<&JobId> {
        self.jobs.front()
    }

    pub fn pop_front(&mut self) -> Option<JobId> {
        self.jobs.pop_front()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.jobs.contains(job_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobId> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
