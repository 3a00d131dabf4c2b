//! Integration tests for long-running workers and the worker pool.

mod common;

use backbeat_jobs::{
    ClaimFilter, JobError, JobQuery, JobStatus, NewJob, Shutdown, TenantId, WorkerId,
    WorkerPoolConfig,
};
use common::{local_stores, pool_config, Harness, SqliteFile};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

async fn wait_until<F, Fut>(deadline: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while !check().await {
        assert!(start.elapsed() < deadline, "condition not met within {deadline:?}");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_worker_run_stops_on_shutdown() {
    for (label, store) in local_stores().await {
        let harness = Harness::new(store);
        harness
            .engine
            .handlers()
            .register_fn("license_pdf", |_ctx| async { Ok(()) });
        let queue = harness.engine.queue();
        let tenant = TenantId::from("t1");
        for n in 0..3 {
            queue
                .enqueue(NewJob::new("t1", "license_pdf", json!({ "n": n })))
                .await
                .unwrap();
        }

        let shutdown = Shutdown::new();
        let worker = harness.worker("w1");
        let signal = shutdown.signal();
        let handle = tokio::spawn(async move { worker.run(signal).await });

        wait_until(Duration::from_secs(5), || {
            let queue = queue.clone();
            let tenant = tenant.clone();
            async move { queue.counts(&tenant).await.unwrap().completed == 3 }
        })
        .await;

        shutdown.trigger();
        timeout(Duration::from_secs(5), handle)
            .await
            .unwrap_or_else(|_| panic!("{label}: worker did not stop"))
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_processes_every_job_once() {
    let db = SqliteFile::new(8).await;
    let harness = Harness::new(db.store());

    let executions = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = Arc::clone(&executions);
    harness.engine.handlers().register_fn("license_pdf", move |ctx| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().push((ctx.job.id, ctx.worker_id.clone()));
            sleep(Duration::from_millis(5)).await;
            Ok(())
        }
    });

    let queue = harness.engine.queue();
    let tenant = TenantId::from("t1");
    for n in 0..40 {
        queue
            .enqueue(NewJob::new("t1", "license_pdf", json!({ "n": n })))
            .await
            .unwrap();
    }

    let pool = Arc::new(harness.engine.worker_pool_with(pool_config(4)));
    let runner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.start().await })
    };

    wait_until(Duration::from_secs(20), || {
        let queue = queue.clone();
        let tenant = tenant.clone();
        async move { queue.counts(&tenant).await.unwrap().completed == 40 }
    })
    .await;

    assert!(pool.is_running());
    pool.stop();
    runner.await.unwrap().unwrap();

    let stats = pool.stats();
    assert!(!stats.running);
    assert_eq!(stats.concurrency, 4);
    assert_eq!(stats.jobs_completed, 40);
    assert_eq!(stats.jobs_failed, 0);

    let executions = executions.lock();
    let unique: HashSet<_> = executions.iter().map(|(id, _)| *id).collect();
    assert_eq!(executions.len(), 40);
    assert_eq!(unique.len(), 40);
    assert!(executions
        .iter()
        .all(|(_, worker)| worker.as_str().starts_with(pool.id())));
}

#[tokio::test]
async fn test_pool_slots_have_distinct_identities() {
    let harness = Harness::new(common::memory_store());
    let config = WorkerPoolConfig {
        identity_prefix: "render".to_string(),
        ..pool_config(3)
    };
    let pool = harness.engine.worker_pool_with(config);
    let pool_id = pool.stats().id;
    assert!(pool_id.starts_with("render-"));

    let ids: HashSet<WorkerId> = (0..3).map(|slot| pool.worker_id(slot)).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(pool.worker_id(2), WorkerId::new(format!("{pool_id}-2")));
}

#[tokio::test]
async fn test_pool_rejects_second_start() {
    let harness = Harness::new(common::memory_store());
    let pool = Arc::new(harness.engine.worker_pool_with(pool_config(1)));
    let runner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.start().await })
    };

    wait_until(Duration::from_secs(5), || {
        let running = pool.is_running();
        async move { running }
    })
    .await;
    assert!(matches!(pool.start().await, Err(JobError::Internal(_))));

    pool.stop();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_pool_drains_in_flight_job_on_stop() {
    let harness = Harness::new(common::memory_store());
    harness.engine.handlers().register_fn("license_pdf", |_ctx| async {
        sleep(Duration::from_millis(200)).await;
        Ok(())
    });
    let queue = harness.engine.queue();
    let tenant = TenantId::from("t1");
    let id = queue
        .enqueue(NewJob::new("t1", "license_pdf", json!({})))
        .await
        .unwrap();

    let pool = Arc::new(harness.engine.worker_pool_with(pool_config(2)));
    let runner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.start().await })
    };

    wait_until(Duration::from_secs(5), || {
        let queue = queue.clone();
        let tenant = tenant.clone();
        async move { queue.get(&tenant, id).await.unwrap().status == JobStatus::Processing }
    })
    .await;

    pool.stop();
    runner.await.unwrap().unwrap();

    let job = queue.get(&tenant, id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(pool.stats().jobs_completed, 1);
}

#[tokio::test]
async fn test_pool_aborts_handler_abandoned_at_shutdown_timeout() {
    let harness = Harness::new(common::memory_store());
    let finished = Arc::new(AtomicBool::new(false));
    {
        let finished = Arc::clone(&finished);
        harness.engine.handlers().register_fn("license_pdf", move |_ctx| {
            let finished = Arc::clone(&finished);
            async move {
                sleep(Duration::from_millis(300)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
    }
    let queue = harness.engine.queue();
    let tenant = TenantId::from("t1");
    let id = queue
        .enqueue(NewJob::new("t1", "license_pdf", json!({})))
        .await
        .unwrap();

    let config = WorkerPoolConfig {
        shutdown_timeout: Duration::from_millis(50),
        ..pool_config(1)
    };
    let pool = Arc::new(harness.engine.worker_pool_with(config));
    let runner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.start().await })
    };

    wait_until(Duration::from_secs(5), || {
        let queue = queue.clone();
        let tenant = tenant.clone();
        async move { queue.get(&tenant, id).await.unwrap().status == JobStatus::Processing }
    })
    .await;

    pool.stop();
    runner.await.unwrap().unwrap();

    // Well past the point where a detached handler would have finished.
    sleep(Duration::from_millis(400)).await;
    assert!(!finished.load(Ordering::SeqCst));

    // The lease is left to expire; nothing reported an outcome.
    let job = queue.get(&tenant, id).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(pool.stats().jobs_completed, 0);
}

#[tokio::test]
async fn test_idle_worker_reaps_expired_leases() {
    let harness = Harness::new(common::memory_store());
    let queue = harness.engine.queue();
    let tenant = TenantId::from("t1");
    let id = queue
        .enqueue(NewJob::new("t1", "license_pdf", json!({})).max_attempts(1))
        .await
        .unwrap();

    harness
        .engine
        .leases()
        .claim(&WorkerId::from("crashed"), &ClaimFilter::any())
        .await
        .unwrap();
    harness.clock.advance(Duration::from_secs(61));

    let worker = harness.worker("w1");
    worker.run_once().await.unwrap();

    let failed = queue
        .list(&tenant, &JobQuery::default().status(JobStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].last_error.as_deref(), Some("lease expired"));
}
