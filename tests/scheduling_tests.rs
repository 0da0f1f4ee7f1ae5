//! End-to-end scheduling through the coordinator facade: ordering,
//! capacity, completion and waiting callers.


use std::time::Duration;

use bytes::Bytes;

use snark_coordinator::collector::{Collected, Outcome};
use snark_coordinator::error::CoordinatorError;
use snark_coordinator::registry::WorkerState;
use snark_coordinator::stats::{StatsQuery, WorkerEventKind};
use snark_coordinator::store::{Completion, JobStatus, SubmitOptions};
use test_harness::{coordinator, jid, proof, register, submit, test_config, wid};

#[tokio::test]
async fn jobs_are_dispatched_in_submission_order() {
    let coord = coordinator(test_config());
    for id in ["a", "b", "c"] {
        submit(&coord, id).await;
    }

    let link = register(&coord, "w1", 1).await;
    assert_eq!(link.job_ids(), vec![jid("a")]);
    assert_eq!(coord.queued_jobs().await, vec![jid("b"), jid("c")]);

    coord
        .submit_result(&wid("w1"), &jid("a"), proof("pa"))
        .await
        .unwrap();
    coord
        .submit_result(&wid("w1"), &jid("b"), proof("pb"))
        .await
        .unwrap();
    assert_eq!(link.job_ids(), vec![jid("a"), jid("b"), jid("c")]);
}

#[tokio::test]
async fn single_job_happy_path() {
    let coord = coordinator(test_config());
    let link = register(&coord, "w1", 1).await;

    let job = coord
        .submit(Bytes::from_static(b"witness"), SubmitOptions::default())
        .await
        .unwrap();

    let dispatch = link.last().unwrap();
    assert_eq!(dispatch.job_id, job);
    assert_eq!(dispatch.payload, Bytes::from_static(b"witness"));
    assert_eq!(dispatch.attempt, 1);
    assert_eq!(dispatch.timeout_ms, 5_000);

    let view = coord.status(&job).await.unwrap();
    assert_eq!(view.state, JobStatus::Assigned);
    assert_eq!(view.assigned_worker, Some(wid("w1")));
    assert!(view.assigned_at.is_some());

    let collected = coord
        .submit_result(&wid("w1"), &job, proof("P"))
        .await
        .unwrap();
    assert_eq!(collected, Collected::Proven);

    let view = coord.status(&job).await.unwrap();
    assert_eq!(view.state, JobStatus::Done);
    assert!(view.assigned_worker.is_none());
    assert!(view.completed_at.is_some());

    let result = coord
        .await_result(&job, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(result, Completion::Proven(Bytes::from_static(b"P")));

    let workers = coord.list_workers().await;
    assert_eq!(workers[0].state, WorkerState::Idle);
    assert!(workers[0].assignments.is_empty());
}

#[tokio::test]
async fn worker_never_exceeds_capacity() {
    let coord = coordinator(test_config());
    let link = register(&coord, "w1", 2).await;
    for id in ["a", "b", "c", "d", "e"] {
        submit(&coord, id).await;
    }

    assert_eq!(link.job_ids(), vec![jid("a"), jid("b")]);
    let workers = coord.list_workers().await;
    assert_eq!(workers[0].assignments.len(), 2);
    assert_eq!(workers[0].state, WorkerState::Busy);
    assert_eq!(coord.summary().await.queue_depth, 3);
    assert_eq!(coord.summary().await.available_slots, 0);

    coord
        .submit_result(&wid("w1"), &jid("b"), proof("pb"))
        .await
        .unwrap();
    assert_eq!(link.job_ids(), vec![jid("a"), jid("b"), jid("c")]);
    assert_eq!(coord.list_workers().await[0].assignments.len(), 2);
}

#[tokio::test]
async fn jobs_spread_across_idle_workers() {
    let coord = coordinator(test_config());
    let w1 = register(&coord, "w1", 1).await;
    let w2 = register(&coord, "w2", 1).await;

    submit(&coord, "a").await;
    submit(&coord, "b").await;
    submit(&coord, "c").await;

    assert_eq!(w1.job_ids(), vec![jid("a")]);
    assert_eq!(w2.job_ids(), vec![jid("b")]);
    assert_eq!(coord.queued_jobs().await, vec![jid("c")]);
}

#[tokio::test(start_paused = true)]
async fn await_timeout_leaves_job_running() {
    let coord = coordinator(test_config());
    register(&coord, "w1", 1).await;
    let job = submit(&coord, "a").await;

    let err = coord
        .await_result(&job, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err, CoordinatorError::Timeout(job.clone()));
    assert_eq!(coord.status(&job).await.unwrap().state, JobStatus::Assigned);

    coord
        .submit_result(&wid("w1"), &job, proof("P"))
        .await
        .unwrap();
    assert_eq!(
        coord.await_result(&job, Duration::from_millis(100)).await,
        Ok(Completion::Proven(Bytes::from_static(b"P")))
    );
}

#[tokio::test]
async fn waiting_callers_are_woken_by_completion() {
    let coord = coordinator(test_config());
    register(&coord, "w1", 1).await;
    let job = submit(&coord, "a").await;

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let coord = coord.clone();
            let job = job.clone();
            tokio::spawn(async move { coord.await_result(&job, Duration::from_secs(5)).await })
        })
        .collect();
    tokio::task::yield_now().await;

    coord
        .submit_result(&wid("w1"), &job, proof("P"))
        .await
        .unwrap();

    for waiter in waiters {
        let result = waiter.await.unwrap();
        assert_eq!(result, Ok(Completion::Proven(Bytes::from_static(b"P"))));
    }
}

#[tokio::test]
async fn await_unknown_job() {
    let coord = coordinator(test_config());
    assert_eq!(
        coord.await_result(&jid("nope"), Duration::from_millis(1)).await,
        Err(CoordinatorError::JobNotFound(jid("nope")))
    );
}

#[tokio::test]
async fn duplicate_proof_is_a_no_op() {
    let coord = coordinator(test_config());
    register(&coord, "w1", 1).await;
    let job = submit(&coord, "a").await;

    coord
        .submit_result(&wid("w1"), &job, proof("P"))
        .await
        .unwrap();
    let again = coord
        .submit_result(&wid("w1"), &job, proof("P"))
        .await
        .unwrap();
    assert_eq!(again, Collected::Duplicate);

    let err = coord
        .submit_result(&wid("w1"), &job, proof("other"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::StaleResult { .. }));
    assert_eq!(
        coord.status(&job).await.unwrap().result,
        Some(snark_coordinator::coordinator::JobResult::Proven {
            proof: Bytes::from_static(b"P")
        })
    );
}

#[tokio::test]
async fn acknowledge_only_removes_finished_jobs() {
    let coord = coordinator(test_config());
    register(&coord, "w1", 1).await;
    let job = submit(&coord, "a").await;

    let err = coord.acknowledge(&job).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidTransition { .. }));

    coord
        .submit_result(&wid("w1"), &job, proof("P"))
        .await
        .unwrap();
    coord.acknowledge(&job).await.unwrap();
    assert_eq!(
        coord.status(&job).await.unwrap_err(),
        CoordinatorError::JobNotFound(job)
    );
}

#[tokio::test(start_paused = true)]
async fn finished_jobs_expire_after_retention() {
    let config = test_config()
        .with_heartbeat_timeout_ms(60_000)
        .with_result_retention_ms(2_000);
    let coord = coordinator(config);
    register(&coord, "w1", 1).await;
    let done = submit(&coord, "done").await;
    coord
        .submit_result(&wid("w1"), &done, proof("P"))
        .await
        .unwrap();
    let running = submit(&coord, "running").await;

    tokio::time::advance(Duration::from_millis(1_500)).await;
    assert_eq!(coord.sweep().await.purged, 0);

    tokio::time::advance(Duration::from_millis(1_000)).await;
    assert_eq!(coord.sweep().await.purged, 1);
    assert!(coord.status(&done).await.is_err());
    assert_eq!(
        coord.status(&running).await.unwrap().state,
        JobStatus::Assigned
    );
}

#[tokio::test]
async fn worker_history_records_lifecycle() {
    let coord = coordinator(test_config());
    register(&coord, "w1", 1).await;
    register(&coord, "w2", 1).await;
    let job = submit(&coord, "a").await;
    coord
        .submit_result(&wid("w1"), &job, Outcome::Proven(Bytes::from_static(b"P")))
        .await
        .unwrap();

    let history = coord
        .worker_stats(&StatsQuery {
            workers: Some(vec![wid("w1")]),
            ..Default::default()
        })
        .await;
    assert_eq!(history.len(), 1);

    let kinds: Vec<WorkerEventKind> = history[&wid("w1")].iter().map(|e| e.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            WorkerEventKind::Registered { capacity: 1 },
            WorkerEventKind::Assigned {
                job_id: jid("a"),
                attempt: 1
            },
            WorkerEventKind::Proven { job_id: jid("a") },
        ]
    );

    let all = coord.worker_stats(&StatsQuery::default()).await;
    assert_eq!(all.len(), 2);
}
