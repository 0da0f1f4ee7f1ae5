//! Per-worker event history.
//!
//! Every lifecycle event a worker goes through is appended to a bounded
//! log keyed by worker id. Histories outlive the registration so operators
//! can inspect a worker after it was evicted.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::Utc;
use serde::Serialize;

use crate::registry::WorkerId;
use crate::store::JobId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEventKind {
    Registered { capacity: usize },
    Assigned { job_id: JobId, attempt: u32 },
    Proven { job_id: JobId },
    Failed { job_id: JobId, error: String },
    TimedOut { job_id: JobId },
    Evicted { reclaimed: usize },
    Disconnected { reclaimed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerEvent {
    /// Unix time in milliseconds.
    pub time: u64,
    #[serde(flatten)]
    pub kind: WorkerEventKind,
}

/// Filter for [`WorkerStats::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct StatsQuery {
    pub workers: Option<Vec<WorkerId>>,
    pub from_t: Option<u64>,
    pub to_t: Option<u64>,
}

impl StatsQuery {
    fn matches_worker(&self, id: &WorkerId) -> bool {
        self.workers.as_ref().map_or(true, |ids| ids.contains(id))
    }

    fn matches_time(&self, time: u64) -> bool {
        self.from_t.map_or(true, |from| time >= from) && self.to_t.map_or(true, |to| time <= to)
    }
}

#[derive(Debug)]
pub struct WorkerStats {
    history: HashMap<WorkerId, VecDeque<WorkerEvent>>,
    max_events: usize,
}

impl WorkerStats {
    pub fn new(max_events: usize) -> Self {
        Self {
            history: HashMap::new(),
            max_events: max_events.max(1),
        }
    }

    pub fn record(&mut self, worker_id: &WorkerId, kind: WorkerEventKind) {
        let time = Utc::now().timestamp_millis().max(0) as u64;
        self.record_at(worker_id, time, kind);
    }

    pub fn record_at(&mut self, worker_id: &WorkerId, time: u64, kind: WorkerEventKind) {
        let events = self.history.entry(worker_id.clone()).or_default();
        if events.len() == self.max_events {
            events.pop_front();
        }
        events.push_back(WorkerEvent { time, kind });
    }

    /// Matching events per worker, oldest first. Workers with no matching
    /// events are left out.
    pub fn query(&self, query: &StatsQuery) -> BTreeMap<WorkerId, Vec<WorkerEvent>> {
        self.history
            .iter()
            .filter(|(id, _)| query.matches_worker(id))
            .filter_map(|(id, events)| {
                let events: Vec<WorkerEvent> = events
                    .iter()
                    .filter(|e| query.matches_time(e.time))
                    .cloned()
                    .collect();
                (!events.is_empty()).then(|| (id.clone(), events))
            })
            .collect()
    }

    /// Every worker that has a history, sorted.
    pub fn workers(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.history.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop histories whose newest event is older than `cutoff` and whose
    /// worker is no longer registered.
    pub fn prune(&mut self, cutoff: u64, is_registered: impl Fn(&WorkerId) -> bool) -> usize {
        let before = self.history.len();
        self.history.retain(|id, events| {
            is_registered(id) || events.back().is_some_and(|e| e.time >= cutoff)
        });
        before - self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(id: &str) -> WorkerId {
        WorkerId::from(id)
    }

    fn stats() -> WorkerStats {
        let mut stats = WorkerStats::new(3);
        stats.record_at(&w("w1"), 10, WorkerEventKind::Registered { capacity: 1 });
        stats.record_at(
            &w("w1"),
            20,
            WorkerEventKind::Assigned {
                job_id: JobId::from("a"),
                attempt: 1,
            },
        );
        stats.record_at(&w("w2"), 15, WorkerEventKind::Registered { capacity: 2 });
        stats
    }

    #[test]
    fn query_filters_by_worker_and_time() {
        let stats = stats();

        let all = stats.query(&StatsQuery::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[&w("w1")].len(), 2);

        let only_w2 = stats.query(&StatsQuery {
            workers: Some(vec![w("w2")]),
            ..Default::default()
        });
        assert_eq!(only_w2.keys().collect::<Vec<_>>(), vec![&w("w2")]);

        let window = stats.query(&StatsQuery {
            from_t: Some(12),
            to_t: Some(20),
            ..Default::default()
        });
        assert_eq!(window[&w("w1")].len(), 1);
        assert_eq!(window[&w("w1")][0].time, 20);
        assert_eq!(window[&w("w2")][0].time, 15);
    }

    #[test]
    fn history_is_bounded() {
        let mut stats = stats();
        stats.record_at(&w("w1"), 30, WorkerEventKind::Evicted { reclaimed: 1 });
        stats.record_at(&w("w1"), 40, WorkerEventKind::Registered { capacity: 1 });

        let events = &stats.query(&StatsQuery::default())[&w("w1")];
        let times: Vec<u64> = events.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![20, 30, 40]);
    }

    #[test]
    fn prune_keeps_registered_and_recent() {
        let mut stats = stats();
        let removed = stats.prune(16, |id| id.as_str() == "w2");
        assert_eq!(removed, 0);

        let removed = stats.prune(25, |_| false);
        assert_eq!(removed, 2);
        assert!(stats.workers().is_empty());
    }

    #[test]
    fn events_serialize_flat() {
        let event = WorkerEvent {
            time: 5,
            kind: WorkerEventKind::Proven {
                job_id: JobId::from("a"),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "proven");
        assert_eq!(json["job_id"], "a");
        assert_eq!(json["time"], 5);
    }
}
