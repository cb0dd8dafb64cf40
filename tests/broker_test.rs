use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tasklane::journal::MemoryJournal;
use tasklane::results::MemoryResultBackend;
use tasklane::{
    AckOutcome, Broker, BrokerConfig, JobError, JobSpec, JobState, LeaseStatus, ResultLookup,
};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

fn config() -> BrokerConfig {
    BrokerConfig {
        jitter: false,
        base_backoff_seconds: 0.0,
        ..Default::default()
    }
}

fn broker_with(config: BrokerConfig) -> Arc<Broker> {
    Arc::new(assert_ok!(Broker::new(config)))
}

#[tokio::test]
async fn expired_lease_is_reclaimed_exactly_once() {
    let broker = broker_with(BrokerConfig {
        lease_ttl_seconds: 0.05,
        ..config()
    });
    let id = assert_ok!(broker.submit(JobSpec::new("work", json!([1]))).await);

    let first = assert_ok!(broker.claim("slot-a", &["default"], 1).await).unwrap();
    assert_ok!(broker.start(&first.lease).await);

    // slot-a goes silent past its lease
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(assert_ok!(broker.reap_expired_leases().await), 1);

    let (b, c) = tokio::join!(
        broker.claim("slot-b", &["default"], 1),
        broker.claim("slot-c", &["default"], 1),
    );
    let winners: Vec<_> = [assert_ok!(b), assert_ok!(c)].into_iter().flatten().collect();
    assert_eq!(winners.len(), 1);
    let second = &winners[0];
    assert_eq!(second.job.id, id);
    assert_eq!(second.job.attempt_count, 2);

    // late ack from the lost slot changes nothing
    assert_eq!(
        assert_ok!(broker.complete(&first.lease, json!("stale")).await),
        AckOutcome::Stale
    );
    assert_eq!(
        assert_ok!(broker.heartbeat(&first.lease).await),
        LeaseStatus::Lost
    );

    assert_eq!(
        assert_ok!(broker.complete(&second.lease, json!("fresh")).await),
        AckOutcome::Acked(JobState::Succeeded)
    );
    let state = assert_ok!(broker.get_state(id).await);
    assert_eq!(state.result, Some(json!("fresh")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_on_one_job_have_one_winner() {
    let broker = broker_with(config());
    assert_ok!(broker.submit(JobSpec::new("only", Value::Null)).await);

    let mut handles = Vec::new();
    for slot in 0..16 {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            broker
                .claim(&format!("slot-{}", slot), &["default"], 1)
                .await
        }));
    }

    let mut claimed = 0;
    for handle in handles {
        if assert_ok!(assert_ok!(handle.await)).is_some() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);
}

#[tokio::test]
async fn attempts_never_exceed_the_cap() {
    let broker = broker_with(config());
    let id = assert_ok!(broker.submit(JobSpec::new("flaky", Value::Null)).await);

    let mut outcomes = Vec::new();
    while let Some(claim) = assert_ok!(broker.claim("slot", &["default"], 1).await) {
        assert!(claim.job.attempt_count <= 3);
        outcomes.push(assert_ok!(
            broker
                .fail(&claim.lease, JobError::transient("connection reset"))
                .await
        ));
    }

    assert_eq!(
        outcomes,
        vec![
            AckOutcome::Acked(JobState::RetryScheduled),
            AckOutcome::Acked(JobState::RetryScheduled),
            AckOutcome::Acked(JobState::Failed),
        ]
    );
    let state = assert_ok!(broker.get_state(id).await);
    assert_eq!(state.state, Some(JobState::Failed));
    assert_eq!(state.attempt_count, 3);
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let broker = broker_with(config());
    let id = assert_ok!(broker.submit(JobSpec::new("validate", json!({"age": -1}))).await);
    let claim = assert_ok!(broker.claim("slot", &["default"], 1).await).unwrap();

    assert_eq!(
        assert_ok!(broker.fail(&claim.lease, JobError::permanent("age must be positive")).await),
        AckOutcome::Acked(JobState::Failed)
    );
    assert!(assert_ok!(broker.claim("slot", &["default"], 1).await).is_none());

    let outcome = assert_ok!(broker.get_result(id).await).into_outcome().unwrap();
    assert_eq!(outcome.attempts, 1);
    assert!(outcome.error.unwrap().contains("age must be positive"));
}

#[tokio::test]
async fn retry_waits_for_backoff() {
    let broker = broker_with(BrokerConfig {
        base_backoff_seconds: 0.1,
        ..config()
    });
    assert_ok!(broker.submit(JobSpec::new("flaky", Value::Null)).await);
    let claim = assert_ok!(broker.claim("slot", &["default"], 1).await).unwrap();
    assert_ok!(broker.fail(&claim.lease, JobError::transient("busy")).await);

    // first retry waits base * 2^1
    assert!(assert_ok!(broker.claim("slot", &["default"], 1).await).is_none());
    let stats = broker.queue_stats("default").await;
    assert_eq!(stats.retry_scheduled_jobs, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let retry = assert_ok!(broker.claim("slot", &["default"], 1).await).unwrap();
    assert_eq!(retry.job.attempt_count, 2);
}

#[tokio::test]
async fn manual_retry_uses_the_given_countdown() {
    let broker = broker_with(BrokerConfig {
        base_backoff_seconds: 60.0,
        ..config()
    });
    assert_ok!(broker.submit(JobSpec::new("poll_api", Value::Null)).await);
    let claim = assert_ok!(broker.claim("slot", &["default"], 1).await).unwrap();
    assert_ok!(
        broker
            .fail(
                &claim.lease,
                JobError::retry_in("rate limited", Duration::from_millis(50))
            )
            .await
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(assert_ok!(broker.claim("slot", &["default"], 1).await).is_some());
}

#[tokio::test]
async fn expired_results_are_indistinguishable_from_unknown_ids() {
    let broker = broker_with(BrokerConfig {
        result_ttl_seconds: 0.05,
        ..config()
    });
    let id = assert_ok!(broker.submit(JobSpec::new("add", json!([2, 2]))).await);
    let claim = assert_ok!(broker.claim("slot", &["default"], 1).await).unwrap();
    assert_ok!(broker.complete(&claim.lease, json!(4)).await);

    assert!(assert_ok!(broker.get_result(id).await).is_ready());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let expired = assert_ok!(broker.get_result(id).await);
    let never_submitted = assert_ok!(broker.get_result(Uuid::new_v4()).await);
    assert_eq!(expired, ResultLookup::Unknown);
    assert_eq!(expired, never_submitted);
    assert!(assert_ok!(broker.get_state(id).await).is_unknown());

    assert_eq!(assert_ok!(broker.collect_garbage().await), 1);
    assert_eq!(assert_ok!(broker.get_result(id).await), ResultLookup::Unknown);
}

#[tokio::test]
async fn unfinished_jobs_are_not_ready() {
    let broker = broker_with(config());
    let id = assert_ok!(broker.submit(JobSpec::new("slow", Value::Null)).await);
    assert_eq!(
        assert_ok!(broker.get_result(id).await),
        ResultLookup::NotReady(JobState::Pending)
    );
}

#[tokio::test]
async fn early_ack_leases_never_expire() {
    let broker = broker_with(BrokerConfig {
        acks_late: false,
        lease_ttl_seconds: 0.01,
        ..config()
    });
    let id = assert_ok!(broker.submit(JobSpec::new("fire_and_forget", Value::Null)).await);
    let claim = assert_ok!(broker.claim("slot", &["default"], 1).await).unwrap();
    assert!(claim.lease.expires_at.is_none());

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(assert_ok!(broker.reap_expired_leases().await), 0);
    let state = assert_ok!(broker.get_state(id).await);
    assert_eq!(state.state, Some(JobState::Assigned));
}

#[tokio::test]
async fn prefetch_bounds_jobs_held_per_slot() {
    let broker = broker_with(BrokerConfig {
        prefetch_multiplier: 2,
        ..config()
    });
    for n in 0..5 {
        assert_ok!(broker.submit(JobSpec::new("n", json!(n))).await);
    }

    let claims = assert_ok!(broker.poll("slot", &["default"], 5, Duration::ZERO).await);
    assert_eq!(claims.len(), 2);
    assert_eq!(broker.held_by("slot").await, 2);
    assert!(assert_ok!(broker.poll("slot", &["default"], 1, Duration::ZERO).await).is_empty());

    assert_ok!(broker.complete(&claims[0].lease, Value::Null).await);
    let next = assert_ok!(broker.poll("slot", &["default"], 5, Duration::ZERO).await);
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].job.payload, json!(2));
}

#[tokio::test]
async fn lanes_are_fifo_and_consulted_in_order() {
    let broker = broker_with(config());
    let low = assert_ok!(broker.submit(JobSpec::new("job", json!("low")).on_queue("low")).await);
    let high_a = assert_ok!(broker.submit(JobSpec::new("job", json!("a")).on_queue("high")).await);
    let high_b = assert_ok!(broker.submit(JobSpec::new("job", json!("b")).on_queue("high")).await);

    let mut order = Vec::new();
    while let Some(claim) = assert_ok!(broker.claim("slot", &["high", "low"], 1).await) {
        order.push(claim.job.id);
        assert_ok!(broker.complete(&claim.lease, Value::Null).await);
    }
    assert_eq!(order, vec![high_a, high_b, low]);
    assert_eq!(broker.list_queues().await, vec!["high".to_string(), "low".to_string()]);
}

#[tokio::test]
async fn poll_wakes_up_when_a_job_arrives() {
    let broker = broker_with(BrokerConfig {
        poll_interval_ms: 10_000,
        ..config()
    });

    let poller = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .poll("slot", &["default"], 1, Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let id = assert_ok!(broker.submit(JobSpec::new("late", Value::Null)).await);

    let claims = assert_ok!(
        assert_ok!(tokio::time::timeout(Duration::from_secs(1), poller).await).unwrap()
    );
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].job.id, id);
}

#[tokio::test]
async fn restarted_broker_recovers_journaled_jobs() {
    let journal = Arc::new(MemoryJournal::new());
    let first = assert_ok!(Broker::with_backends(
        config(),
        Arc::new(MemoryResultBackend::new()),
        journal.clone(),
    ));
    let running = assert_ok!(first.submit(JobSpec::new("running", Value::Null)).await);
    let waiting = assert_ok!(first.submit(JobSpec::new("waiting", Value::Null)).await);
    let claim = assert_ok!(first.claim("slot", &["default"], 1).await).unwrap();
    assert_eq!(claim.job.id, running);
    assert_ok!(first.start(&claim.lease).await);
    drop(first);

    let second = assert_ok!(Broker::with_backends(
        config(),
        Arc::new(MemoryResultBackend::new()),
        journal,
    ));
    assert_eq!(assert_ok!(second.recover().await), 2);

    let state = assert_ok!(second.get_state(running).await);
    assert_eq!(state.state, Some(JobState::Pending));
    assert_eq!(state.attempt_count, 1);

    let mut recovered = Vec::new();
    while let Some(claim) = assert_ok!(second.claim("slot", &["default"], 1).await) {
        recovered.push(claim.job.id);
        assert_ok!(second.complete(&claim.lease, Value::Null).await);
    }
    recovered.sort();
    let mut expected = vec![running, waiting];
    expected.sort();
    assert_eq!(recovered, expected);

    // the old lease cannot touch the recovered job
    assert_eq!(
        assert_ok!(second.complete(&claim.lease, json!(1)).await),
        AckOutcome::Stale
    );
}

#[tokio::test]
async fn recovery_fails_in_flight_jobs_that_used_their_last_attempt() {
    let journal = Arc::new(MemoryJournal::new());
    let config = BrokerConfig {
        max_attempts: 1,
        ..config()
    };
    let first = assert_ok!(Broker::with_backends(
        config.clone(),
        Arc::new(MemoryResultBackend::new()),
        journal.clone(),
    ));
    let id = assert_ok!(first.submit(JobSpec::new("import", Value::Null)).await);
    let claim = assert_ok!(first.claim("slot", &["default"], 1).await).unwrap();
    assert_ok!(first.start(&claim.lease).await);
    drop(first);

    let second = assert_ok!(Broker::with_backends(
        config,
        Arc::new(MemoryResultBackend::new()),
        journal,
    ));
    assert_eq!(assert_ok!(second.recover().await), 1);

    let state = assert_ok!(second.get_state(id).await);
    assert_eq!(state.state, Some(JobState::Failed));
    assert_eq!(state.attempt_count, 1);
    assert!(state.error.unwrap().contains("worker lost"));
    assert!(assert_ok!(second.claim("slot", &["default"], 1).await).is_none());

    match assert_ok!(second.get_result(id).await) {
        ResultLookup::Ready(outcome) => {
            assert_eq!(outcome.state, JobState::Failed);
            assert_eq!(outcome.attempts, 1);
        }
        other => panic!("expected a stored failure, got {:?}", other),
    }
}

#[tokio::test]
async fn start_rejects_an_expired_lease() {
    let broker = broker_with(BrokerConfig {
        lease_ttl_seconds: 0.05,
        ..config()
    });
    let id = assert_ok!(broker.submit(JobSpec::new("work", Value::Null)).await);
    let claim = assert_ok!(broker.claim("slot-a", &["default"], 1).await).unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(assert_ok!(broker.start(&claim.lease).await), LeaseStatus::Lost);
    assert_eq!(broker.held_by("slot-a").await, 0);

    let state = assert_ok!(broker.get_state(id).await);
    assert_eq!(state.state, Some(JobState::Pending));

    let again = assert_ok!(broker.claim("slot-b", &["default"], 1).await).unwrap();
    assert_eq!(again.job.id, id);
    assert!(assert_ok!(broker.start(&again.lease).await).is_active());
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    assert_err!(Broker::new(BrokerConfig {
        max_attempts: 0,
        ..Default::default()
    }));
    assert_err!(Broker::new(BrokerConfig {
        prefetch_multiplier: 0,
        ..Default::default()
    }));
    assert_err!(Broker::new(BrokerConfig {
        lease_ttl_seconds: 1e18,
        ..Default::default()
    }));
}
