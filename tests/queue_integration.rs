//! End-to-end scenarios for the queue facades and the worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use jobforge::{
    DistributedProducer, Item, JobError, JobOptions, JobQueue, JobStatus, MemoryBackend, Outcome,
    PersistentBackend, PersistentJobQueue, PoolConfig, PriorityJobQueue, QueueError, WorkerError,
    WorkerKind,
};

/// Polls `cond` until it holds or the deadline passes.
async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < deadline,
            "condition not met within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn doubling_worker(delay: Duration) -> WorkerKind<u64, u64> {
    WorkerKind::returning(move |x: u64| async move {
        tokio::time::sleep(delay).await;
        Ok::<u64, WorkerError>(x * 2)
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifo_throughput_respects_concurrency() {
    // 20 jobs at 50ms across 4 slots need at least 5 waves of 50ms.
    let queue = JobQueue::new(
        PoolConfig::new(4),
        doubling_worker(Duration::from_millis(50)),
    );

    let start = Instant::now();
    let handles: Vec<_> = (1..=20)
        .map(|x| queue.add(x).expect("enqueue should succeed"))
        .collect();

    let mut results = Vec::new();
    for handle in &handles {
        results.push(handle.result().await.unwrap().unwrap());
    }
    let elapsed = start.elapsed();

    results.sort_unstable();
    let expected: Vec<u64> = (1..=20).map(|x| x * 2).collect();
    assert_eq!(results, expected);

    assert!(elapsed >= Duration::from_millis(250), "finished too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "finished too slow: {elapsed:?}");

    queue.wait_and_close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_priority_dispatch_order_with_fifo_tie_break() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&order);
    let queue = PriorityJobQueue::<String, ()>::new(
        PoolConfig::new(1),
        WorkerKind::void(move |label: String| {
            let recorder = Arc::clone(&recorder);
            async move {
                recorder.lock().unwrap().push(label);
                Ok(())
            }
        }),
    );

    // Pause so the first submission cannot start before the rest are
    // queued; otherwise the dispatch order is unobservable.
    queue.pause();
    queue.add("A".to_string(), 5).unwrap();
    queue.add("B".to_string(), 1).unwrap();
    queue.add("C".to_string(), 1).unwrap();
    queue.add("D".to_string(), 3).unwrap();
    queue.resume();

    queue.wait_until_finished().await;
    assert_eq!(*order.lock().unwrap(), ["B", "C", "D", "A"]);

    queue.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pause_lets_in_flight_jobs_finish() {
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completed);
    let queue = JobQueue::new(
        PoolConfig::new(2),
        WorkerKind::returning(move |x: u64| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<u64, WorkerError>(x)
            }
        }),
    );

    for x in 0..10 {
        queue.add(x).unwrap();
    }

    wait_until(Duration::from_secs(2), || {
        completed.load(Ordering::SeqCst) >= 1
    })
    .await;
    queue.pause();
    let at_pause = completed.load(Ordering::SeqCst);

    // Only the jobs already occupying slots may still finish.
    wait_until(Duration::from_secs(2), || queue.processing_count() == 0).await;
    let after_drain = completed.load(Ordering::SeqCst);
    assert!(
        after_drain - at_pause <= 2,
        "paused pool completed {} extra jobs",
        after_drain - at_pause
    );
    assert!(after_drain < 10);

    queue.resume();
    queue.wait_until_finished().await;
    assert_eq!(completed.load(Ordering::SeqCst), 10);

    queue.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_purge_cancels_pending_but_not_executing() {
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finished);
    let queue = JobQueue::new(
        PoolConfig::new(2),
        WorkerKind::returning(move |x: u64| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<u64, WorkerError>(x * 2)
            }
        }),
    );

    let handles: Vec<_> = (0..100).map(|x| queue.add(x).unwrap()).collect();

    wait_until(Duration::from_secs(5), || {
        finished.load(Ordering::SeqCst) >= 10
    })
    .await;
    queue.purge();
    assert_eq!(queue.pending_count(), 0);

    queue.wait_until_finished().await;

    let mut closed = 0;
    let mut delivered = 0;
    for handle in &handles {
        match handle.result().await {
            Ok(Some(value)) => {
                delivered += 1;
                assert_eq!(value, handle.data() * 2);
            }
            Err(JobError::ResultUnavailable(_)) => {
                closed += 1;
                assert_eq!(handle.status(), JobStatus::Closed);
            }
            other => panic!("unexpected result state: {other:?}"),
        }
    }
    assert_eq!(closed + delivered, 100);
    assert_eq!(delivered, finished.load(Ordering::SeqCst));
    assert!(closed > 0, "purge should have cancelled queued jobs");

    queue.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_persistent_rehydrate_and_ack_exactly_once() {
    let backend = MemoryBackend::new();

    // Another process persists work.
    let producer = DistributedProducer::<u64, MemoryBackend>::new(Arc::clone(&backend));
    for (value, id) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        producer
            .add(value as u64, JobOptions::new().with_id(*id))
            .unwrap();
    }
    assert_eq!(producer.pending_count(), 5);

    // This process binds a consumer whose worker blocks on a gate, so
    // everything but the first job stays in the back-end for the scan.
    let gate = Arc::new(Semaphore::new(0));
    let worker_gate = Arc::clone(&gate);
    let consumer = PersistentJobQueue::<u64, (), MemoryBackend>::new(
        PoolConfig::new(1),
        WorkerKind::void(move |_x: u64| {
            let gate = Arc::clone(&worker_gate);
            async move {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| WorkerError::new("gate closed"))?;
                permit.forget();
                Ok(())
            }
        }),
        Arc::clone(&backend),
    );

    // "e" has not been dispatched yet; the lookup rehydrates it from the
    // back-end.
    let handle = consumer.job_by_id("e").expect("scan should find job");
    assert_eq!(handle.id(), "e");

    gate.add_permits(5);
    assert_eq!(handle.result().await.unwrap(), None);

    consumer.wait_until_finished().await;
    assert_eq!(backend.ack_count(), 5);
    assert_eq!(backend.outstanding_leases(), 0);

    // Jobs seen by the dispatcher stay reachable by id afterwards.
    let recovered = consumer.job_by_id("a").unwrap();
    assert_eq!(recovered.status(), JobStatus::Finished);

    let missing = consumer.job_by_id("zz").unwrap_err();
    assert!(matches!(missing, QueueError::JobNotFound(_)));

    consumer.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_double_close_rejected() {
    let queue = JobQueue::new(PoolConfig::new(1), doubling_worker(Duration::ZERO));

    let handle = queue.add(5).unwrap();
    assert_eq!(handle.result().await.unwrap(), Some(10));

    handle.close().expect("first close succeeds");
    let err = handle.close().unwrap_err();
    assert!(matches!(err, JobError::AlreadyClosed(_)));

    queue.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_until_finished_auto_resumes() {
    let completed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completed);
    let queue = JobQueue::new(
        PoolConfig::new(2),
        WorkerKind::returning(move |x: u64| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<u64, WorkerError>(x)
            }
        }),
    );

    queue.pause();
    for x in 0..3 {
        queue.add(x).unwrap();
    }
    assert_eq!(queue.pending_count(), 3);

    // Would deadlock without the implicit resume.
    queue.wait_until_finished().await;
    assert_eq!(completed.load(Ordering::SeqCst), 3);
    assert!(!queue.is_paused());

    queue.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_panic_is_contained() {
    let queue = JobQueue::new(
        PoolConfig::new(1),
        WorkerKind::returning(|x: u64| async move {
            if x == 13 {
                panic!("unlucky input");
            }
            Ok::<u64, WorkerError>(x)
        }),
    );

    let unlucky = queue.add(13).unwrap();
    match unlucky.result().await {
        Err(JobError::WorkerFailed(err)) => assert!(err.message.contains("unlucky input")),
        other => panic!("expected worker failure, got {other:?}"),
    }

    // The pool keeps serving jobs after the panic.
    let fine = queue.add(7).unwrap();
    assert_eq!(fine.result().await.unwrap(), Some(7));

    queue.wait_and_close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_group_job_fan_in() {
    let queue = JobQueue::new(PoolConfig::new(3), doubling_worker(Duration::from_millis(5)));

    let group = queue.add_all(vec![1, 2, 3, 4, 5]);
    assert_eq!(group.remaining(), 5);

    let mut rx = group.results().unwrap();
    let mut values = Vec::new();
    while let Some(result) = rx.recv().await {
        match result.outcome {
            Outcome::Data(value) => values.push(value),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    values.sort_unstable();
    assert_eq!(values, [2, 4, 6, 8, 10]);
    assert_eq!(group.remaining(), 0);

    // The group stream is consumed exactly once.
    assert!(matches!(
        group.results().unwrap_err(),
        JobError::AlreadyConsumed
    ));

    queue.wait_and_close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_group_lookup_accepts_raw_and_prefixed_ids() {
    let queue = JobQueue::new(PoolConfig::new(1), doubling_worker(Duration::ZERO));

    let group = queue.add_all(vec![1, 2]);
    let prefixed = group.id().to_string();
    let raw = prefixed.trim_start_matches("group:").to_string();

    assert_eq!(queue.groups_job_by_id(&prefixed).unwrap().id(), prefixed);
    assert_eq!(queue.groups_job_by_id(&raw).unwrap().id(), prefixed);

    let err = queue.groups_job_by_id("nope").unwrap_err();
    assert!(matches!(err, QueueError::GroupJobNotFound(_)));

    queue.wait_and_close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_drain_consumes_the_channel_once() {
    let queue = JobQueue::new(PoolConfig::new(1), doubling_worker(Duration::ZERO));

    let handle = queue.add(4).unwrap();
    handle.drain().expect("first drain succeeds");
    assert!(matches!(handle.drain(), Err(JobError::AlreadyConsumed)));
    assert!(matches!(
        handle.result().await,
        Err(JobError::AlreadyConsumed)
    ));

    queue.wait_and_close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_closed_queue_rejects_submissions() {
    let queue = JobQueue::new(PoolConfig::new(2), doubling_worker(Duration::ZERO));

    for x in 0..5 {
        queue.add(x).unwrap();
    }
    queue.wait_and_close().await;

    assert_eq!(queue.pending_count(), 0);
    assert_eq!(queue.processing_count(), 0);
    let err = queue.add(99).unwrap_err();
    assert!(matches!(err, QueueError::EnqueueRejected));

    // Close is idempotent.
    queue.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_persistent_requires_job_ids() {
    let backend = MemoryBackend::new();
    let queue = PersistentJobQueue::<u64, u64, MemoryBackend>::new(
        PoolConfig::new(1),
        doubling_worker(Duration::ZERO),
        Arc::clone(&backend),
    );

    let err = queue.add(1, JobOptions::new()).unwrap_err();
    assert!(matches!(err, QueueError::MissingJobId));

    let err = queue
        .add_all(vec![Item::new("ok", 1), Item::new("", 2)])
        .unwrap_err();
    assert!(matches!(err, QueueError::MissingJobId));

    queue.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_persistent_rejects_when_backend_closed() {
    let backend = MemoryBackend::new();
    let queue = PersistentJobQueue::<u64, u64, MemoryBackend>::new(
        PoolConfig::new(1),
        doubling_worker(Duration::ZERO),
        Arc::clone(&backend),
    );

    backend.close();
    let err = queue.add(1, JobOptions::new().with_id("x")).unwrap_err();
    assert!(matches!(err, QueueError::EnqueueRejected));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_persistent_group_results_flow_back() {
    let backend = MemoryBackend::new();
    let queue = PersistentJobQueue::<u64, u64, MemoryBackend>::new(
        PoolConfig::new(2),
        doubling_worker(Duration::from_millis(2)),
        Arc::clone(&backend),
    );

    let group = queue
        .add_all(vec![
            Item::new("g-a", 1),
            Item::new("g-b", 2),
            Item::new("g-c", 3),
        ])
        .unwrap();

    let mut rx = group.results().unwrap();
    let mut values = Vec::new();
    while let Some(result) = rx.recv().await {
        match result.outcome {
            Outcome::Data(value) => values.push(value),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    values.sort_unstable();
    assert_eq!(values, [2, 4, 6]);
    assert_eq!(backend.ack_count(), 3);

    queue.wait_and_close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscription_drives_external_enqueues() {
    let backend = MemoryBackend::new();
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&processed);

    let _consumer = PersistentJobQueue::<u64, (), MemoryBackend>::with_subscription(
        PoolConfig::new(2),
        WorkerKind::void(move |_x: u64| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        Arc::clone(&backend),
    );

    // A separate producer enqueues; the subscription poke alone must
    // get these processed.
    let producer = DistributedProducer::<u64, MemoryBackend>::new(Arc::clone(&backend));
    for id in ["s1", "s2", "s3"] {
        producer.add(1, JobOptions::new().with_id(id)).unwrap();
    }

    wait_until(Duration::from_secs(2), || {
        backend.ack_count() == 3 && processed.load(Ordering::SeqCst) == 3
    })
    .await;
    assert_eq!(backend.outstanding_leases(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_queued_job_before_dispatch() {
    let queue = JobQueue::new(PoolConfig::new(1), doubling_worker(Duration::from_millis(30)));

    // Occupy the single slot, then queue a victim behind it.
    let _busy = queue.add(1).unwrap();
    let victim = queue.add(2).unwrap();
    victim.close().expect("queued job can be closed");
    assert!(victim.is_closed());

    // The closed job is silently discarded at dispatch.
    queue.wait_until_finished().await;
    assert!(matches!(
        victim.result().await,
        Err(JobError::ResultUnavailable(_))
    ));

    queue.close().await;
}
