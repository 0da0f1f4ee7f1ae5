//! Submission backpressure and input validation.
//!
//! A full pending queue must reject new work immediately without touching
//! the store, while recycled jobs are always readmitted.


use bytes::Bytes;

use snark_coordinator::error::{CoordinatorError, ErrorKind};
use snark_coordinator::store::{JobStatus, SubmitOptions};
use test_harness::{coordinator, jid, register, submit, test_config, wid};

#[tokio::test]
async fn full_queue_rejects_with_resource_exhausted() {
    let coord = coordinator(test_config().with_max_pending_jobs(2));
    submit(&coord, "a").await;
    submit(&coord, "b").await;

    let options = SubmitOptions {
        job_id: Some(jid("c")),
        ..Default::default()
    };
    let err = coord
        .submit(Bytes::from_static(b"witness"), options)
        .await
        .unwrap_err();
    assert_eq!(err, CoordinatorError::CoordinatorBusy { depth: 2, limit: 2 });
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

    // Nothing was stored for the rejected submission.
    assert_eq!(coord.list_jobs().await.len(), 2);
    assert_eq!(
        coord.status(&jid("c")).await.unwrap_err(),
        CoordinatorError::JobNotFound(jid("c"))
    );
    assert_eq!(coord.summary().await.jobs.pending, 2);
}

#[tokio::test]
async fn draining_the_queue_admits_new_work() {
    let coord = coordinator(test_config().with_max_pending_jobs(1));
    submit(&coord, "a").await;

    register(&coord, "w1", 1).await;
    assert_eq!(coord.summary().await.queue_depth, 0);

    submit(&coord, "b").await;
    assert_eq!(coord.queued_jobs().await, vec![jid("b")]);
}

#[tokio::test]
async fn recycled_jobs_bypass_the_depth_limit() {
    let coord = coordinator(test_config().with_max_pending_jobs(1));
    register(&coord, "w1", 1).await;
    submit(&coord, "a").await;
    submit(&coord, "b").await;
    assert_eq!(coord.summary().await.queue_depth, 1);

    coord.disconnect_worker(&wid("w1")).await.unwrap();
    assert_eq!(coord.queued_jobs().await, vec![jid("a"), jid("b")]);
    assert_eq!(
        coord.status(&jid("a")).await.unwrap().state,
        JobStatus::Pending
    );
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let coord = coordinator(test_config().with_max_payload_bytes(8));

    let err = coord
        .submit(Bytes::new(), SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidPayload(_)));

    let err = coord
        .submit(Bytes::from_static(b"far too large"), SubmitOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, CoordinatorError::PayloadTooLarge { size: 13, limit: 8 });

    let options = SubmitOptions {
        job_id: Some(jid("has space")),
        ..Default::default()
    };
    let err = coord
        .submit(Bytes::from_static(b"ok"), options)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidJobId(_)));

    submit(&coord, "dup").await;
    let options = SubmitOptions {
        job_id: Some(jid("dup")),
        ..Default::default()
    };
    let err = coord
        .submit(Bytes::from_static(b"ok"), options)
        .await
        .unwrap_err();
    assert_eq!(err, CoordinatorError::DuplicateJob(jid("dup")));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(coord.list_jobs().await.len(), 1);
}

#[tokio::test]
async fn generated_ids_are_unique() {
    let coord = coordinator(test_config());
    let a = coord
        .submit(Bytes::from_static(b"x"), SubmitOptions::default())
        .await
        .unwrap();
    let b = coord
        .submit(Bytes::from_static(b"x"), SubmitOptions::default())
        .await
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(a.as_str().len(), 36);
}
