use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::collector::{Collected, Outcome, ResultCollector};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::registry::{Dispatch, WorkerHandle, WorkerId, WorkerInfo, WorkerLink, WorkerRegistry};
use crate::scheduler::{PendingDispatch, Recycled, Scheduler};
use crate::stats::{StatsQuery, WorkerEvent, WorkerEventKind, WorkerStats};
use crate::store::{Completion, Job, JobCounts, JobId, JobStatus, JobStore, SubmitOptions, Waiter};

/// Result section of a job view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobResult {
    Proven {
        #[serde(serialize_with = "hex::serde::serialize")]
        proof: Bytes,
    },
    Failed {
        error: String,
    },
}

impl From<Completion> for JobResult {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::Proven(proof) => JobResult::Proven { proof },
            Completion::Failed(error) => JobResult::Failed { error },
        }
    }
}

/// Point-in-time snapshot of a job, as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub state: JobStatus,
    pub assigned_worker: Option<WorkerId>,
    pub submitted_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failures: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            state: job.status(),
            assigned_worker: job.assigned_worker().cloned(),
            submitted_at: job.submitted_at,
            assigned_at: job.assignment().map(|a| a.assigned_at),
            completed_at: job.completed_at,
            failures: job.failures,
            max_retries: job.max_retries,
            last_error: job.last_error.clone(),
            result: job.completion().map(JobResult::from),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub jobs: JobCounts,
    pub queue_depth: usize,
    pub workers: usize,
    pub available_slots: usize,
}

/// What a maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<WorkerId>,
    pub recycled: Vec<Recycled>,
    pub timed_out: usize,
    pub purged: usize,
}

/// State shared by all coordinator operations. Always accessed through the
/// coordinator's lock; each exclusive hold covers one worker/job update.
#[derive(Debug)]
struct Core {
    registry: WorkerRegistry,
    store: JobStore,
    scheduler: Scheduler,
    collector: ResultCollector,
    stats: WorkerStats,
}

impl Core {
    fn schedule_next(&mut self) -> Option<PendingDispatch> {
        let pending = self
            .scheduler
            .schedule_next(&mut self.registry, &mut self.store)?;
        self.stats.record(
            &pending.worker.id,
            WorkerEventKind::Assigned {
                job_id: pending.dispatch.job_id.clone(),
                attempt: pending.dispatch.attempt,
            },
        );
        Some(pending)
    }

    fn reclaim(
        &mut self,
        worker_id: &WorkerId,
        reason: &str,
        event: fn(usize) -> WorkerEventKind,
    ) -> Result<Vec<Recycled>> {
        let recycled =
            self.scheduler
                .reclaim_worker(&mut self.registry, &mut self.store, worker_id, reason)?;
        self.stats.record(worker_id, event(recycled.len()));
        Ok(recycled)
    }
}

/// Entry point for every boundary operation.
///
/// One coordinator is created at process start, shared as
/// `Arc<Coordinator>` with the transport, and driven by [`Coordinator::run`]
/// until its cancellation token fires. All state lives behind a single
/// async lock. Heartbeats only take it shared. Every exclusive hold covers
/// one entity pair (a job and its worker, or a worker and its in-flight
/// jobs), no operation awaits while holding it, and dispatches to workers
/// are sent after it is released.
#[derive(Debug)]
pub struct Coordinator {
    config: CoordinatorConfig,
    core: RwLock<Core>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let core = Core {
            registry: WorkerRegistry::new(&config),
            store: JobStore::new(config.clone()),
            scheduler: Scheduler::new(&config),
            collector: ResultCollector::new(),
            stats: WorkerStats::new(config.worker_history_len),
        };
        Ok(Self {
            config,
            core: RwLock::new(core),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Accept a new job. Rejected with `CoordinatorBusy` when the pending
    /// queue is full; the store is left untouched in that case.
    pub async fn submit(&self, payload: Bytes, options: SubmitOptions) -> Result<JobId> {
        let job_id = {
            let mut core = self.core.write().await;
            core.store.validate(&payload, &options)?;
            if let Err(e) = core.scheduler.check_capacity() {
                tracing::warn!(error = %e, "Rejecting submission");
                return Err(e);
            }
            let job_id = core.store.submit(payload, options)?;
            core.scheduler.enqueue(job_id.clone());
            job_id
        };
        self.schedule().await;
        Ok(job_id)
    }

    pub async fn status(&self, job_id: &JobId) -> Result<JobView> {
        let core = self.core.read().await;
        core.store
            .get(job_id)
            .map(JobView::from)
            .ok_or_else(|| CoordinatorError::JobNotFound(job_id.clone()))
    }

    /// Wait until the job is Done or Failed, for at most `wait`.
    ///
    /// Timing out (or dropping the returned future) only detaches this
    /// caller; the job keeps running.
    pub async fn await_result(&self, job_id: &JobId, wait: Duration) -> Result<Completion> {
        let waiter = self.core.write().await.store.subscribe(job_id)?;
        let rx = match waiter {
            Waiter::Ready(completion) => return Ok(completion),
            Waiter::Waiting(rx) => rx,
        };
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(_)) => Err(CoordinatorError::JobNotFound(job_id.clone())),
            Err(_) => Err(CoordinatorError::Timeout(job_id.clone())),
        }
    }

    /// Remove a finished job once the caller has its result.
    pub async fn acknowledge(&self, job_id: &JobId) -> Result<()> {
        self.core.write().await.store.acknowledge(job_id)?;
        tracing::debug!(job_id = %job_id, "Job acknowledged");
        Ok(())
    }

    pub async fn list_jobs(&self) -> Vec<JobView> {
        let core = self.core.read().await;
        core.store.all_jobs().into_iter().map(JobView::from).collect()
    }

    /// Pending job ids in the order they will be dispatched.
    pub async fn queued_jobs(&self) -> Vec<JobId> {
        self.core.read().await.scheduler.queued()
    }

    pub async fn register_worker(
        &self,
        worker_id: WorkerId,
        address: Option<String>,
        capacity: Option<usize>,
        link: Arc<dyn WorkerLink>,
    ) -> Result<WorkerHandle> {
        let handle = {
            let mut core = self.core.write().await;
            let handle = core.registry.register(worker_id, address, capacity, link)?;
            let capacity = core.registry.get(&handle.id).map_or(0, |w| w.capacity);
            core.stats
                .record(&handle.id, WorkerEventKind::Registered { capacity });
            handle
        };
        self.schedule().await;
        Ok(handle)
    }

    /// Only takes the shared lock, so heartbeats from different workers do
    /// not contend with each other.
    pub async fn heartbeat(&self, worker_id: &WorkerId) -> Result<()> {
        self.core.read().await.registry.heartbeat(worker_id)
    }

    pub async fn submit_result(
        &self,
        worker_id: &WorkerId,
        job_id: &JobId,
        outcome: Outcome,
    ) -> Result<Collected> {
        let error = match &outcome {
            Outcome::Proven(proof) if proof.is_empty() => {
                Some("worker returned an empty proof".to_string())
            }
            Outcome::Proven(_) => None,
            Outcome::Failed(error) => Some(error.clone()),
        };

        let collected = {
            let mut core = self.core.write().await;
            let Core {
                registry,
                store,
                scheduler,
                collector,
                stats,
            } = &mut *core;
            let collected =
                collector.submit_result(registry, store, scheduler, worker_id, job_id, outcome)?;

            let job_id = job_id.clone();
            match (collected, error) {
                (Collected::Duplicate, _) => {}
                (Collected::Proven, _) => {
                    stats.record(worker_id, WorkerEventKind::Proven { job_id })
                }
                (_, error) => stats.record(
                    worker_id,
                    WorkerEventKind::Failed {
                        job_id,
                        error: error.unwrap_or_default(),
                    },
                ),
            }
            collected
        };
        self.schedule().await;
        Ok(collected)
    }

    /// Remove a worker at its own request and recycle its in-flight jobs.
    pub async fn disconnect_worker(&self, worker_id: &WorkerId) -> Result<Vec<Recycled>> {
        let recycled = {
            let mut core = self.core.write().await;
            core.registry.mark_disconnected(worker_id)?;
            core.reclaim(worker_id, "worker disconnected", |reclaimed| {
                WorkerEventKind::Disconnected { reclaimed }
            })?
        };
        self.schedule().await;
        Ok(recycled)
    }

    pub async fn list_workers(&self) -> Vec<WorkerInfo> {
        self.core.read().await.registry.infos()
    }

    pub async fn worker_stats(&self, query: &StatsQuery) -> BTreeMap<WorkerId, Vec<WorkerEvent>> {
        self.core.read().await.stats.query(query)
    }

    pub async fn summary(&self) -> Summary {
        let core = self.core.read().await;
        Summary {
            jobs: core.store.counts(),
            queue_depth: core.scheduler.depth(),
            workers: core.registry.len(),
            available_slots: core.registry.available_slots(),
        }
    }

    /// One maintenance pass: evict silent workers, expire overdue
    /// assignments, purge old results, then schedule whatever was freed.
    ///
    /// The lock is taken once per evicted worker and once per expired
    /// assignment, so heartbeats and results keep flowing during a long pass.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        // Marked workers stop receiving jobs until they are reclaimed below.
        let unresponsive = self.core.write().await.registry.mark_unresponsive();
        for worker_id in unresponsive {
            let reclaimed = self.core.write().await.reclaim(
                &worker_id,
                "worker stopped sending heartbeats",
                |reclaimed| WorkerEventKind::Evicted { reclaimed },
            );
            match reclaimed {
                Ok(recycled) => {
                    tracing::warn!(
                        worker_id = %worker_id,
                        reclaimed = recycled.len(),
                        "Evicted unresponsive worker"
                    );
                    report.recycled.extend(recycled);
                    report.evicted.push(worker_id);
                }
                Err(e) => {
                    tracing::debug!(worker_id = %worker_id, error = %e, "Skipping eviction")
                }
            }
        }

        let now = Instant::now();
        let overdue = self.core.read().await.store.overdue_assignments(now);
        for (job_id, worker_id) in overdue {
            let mut core = self.core.write().await;
            let Core {
                registry,
                store,
                scheduler,
                stats,
                ..
            } = &mut *core;
            // Skipped when a result or eviction got to the job first.
            let Some(expired) =
                scheduler.expire_assignment(registry, store, &job_id, &worker_id, now)
            else {
                continue;
            };
            stats.record(&expired.worker_id, WorkerEventKind::TimedOut { job_id });
            report.timed_out += 1;
            report.recycled.push(expired.recycled);
        }

        {
            let mut core = self.core.write().await;
            report.purged = core.store.purge_expired(now, self.config.result_retention());
            core.store.prune_waiters();
        }

        {
            let mut core = self.core.write().await;
            let Core {
                registry, stats, ..
            } = &mut *core;
            let retention_ms = self.config.result_retention_ms;
            let cutoff = (Utc::now().timestamp_millis().max(0) as u64).saturating_sub(retention_ms);
            stats.prune(cutoff, |id| registry.get(id).is_some());
        }

        if !report.evicted.is_empty() || report.timed_out > 0 || report.purged > 0 {
            tracing::info!(
                evicted = report.evicted.len(),
                recycled = report.recycled.len(),
                timed_out = report.timed_out,
                purged = report.purged,
                "Sweep finished"
            );
        }

        self.schedule().await;
        report
    }

    /// Run the maintenance loop until `shutdown` is cancelled.
    ///
    /// The sweep interval is half the heartbeat timeout.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.config.sweep_interval().as_millis() as u64,
            "Coordinator maintenance loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Coordinator maintenance loop stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Hand queued jobs to idle workers until either runs out. Each
    /// assignment takes the lock on its own and is sent after releasing it.
    async fn schedule(&self) {
        loop {
            let next = self.core.write().await.schedule_next();
            let Some(PendingDispatch { worker, dispatch }) = next else {
                break;
            };
            self.send(worker, dispatch).await;
        }
    }

    /// Send one dispatch. A worker whose link is closed is evicted and its
    /// jobs recycled, unless the id has since been registered again with a
    /// different link.
    async fn send(&self, worker: WorkerHandle, dispatch: Dispatch) {
        let job_id = dispatch.job_id.clone();
        if worker.link.send(dispatch).is_ok() {
            return;
        }
        tracing::warn!(job_id = %job_id, worker_id = %worker.id, "Dispatch failed");

        let mut core = self.core.write().await;
        if !core.registry.is_current(&worker) {
            tracing::debug!(worker_id = %worker.id, "Stale link, skipping reclaim");
            return;
        }
        let err = CoordinatorError::WorkerUnreachable(worker.id.clone());
        if let Err(e) = core.reclaim(&worker.id, &err.to_string(), |reclaimed| {
            WorkerEventKind::Evicted { reclaimed }
        }) {
            tracing::debug!(worker_id = %worker.id, error = %e, "Skipping reclaim");
        }
    }
}
