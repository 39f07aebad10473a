//! Integration tests for the queue service: pool registry, submission
//! contracts, and disposal.

use fnqueue::config::ServiceConfig;
use fnqueue::engine::QueueService;
use fnqueue::error::Error;
use fnqueue::kind::{KindSpec, QueueKind};
use fnqueue::model::WorkState;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

struct Reports;
impl QueueKind for Reports {
    const MAX_WORKERS: usize = 1;
}

struct Uploads;
impl QueueKind for Uploads {
    const MAX_WORKERS: usize = 3;
}

fn test_service() -> QueueService {
    QueueService::new(ServiceConfig {
        poll_timeout: Duration::from_millis(50),
        ..ServiceConfig::default()
    })
    .expect("tests run inside a tokio runtime")
}

#[derive(Debug, thiserror::Error)]
#[error("quota exceeded for {tenant}")]
struct QuotaExceeded {
    tenant: String,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn same_kind_resolves_to_same_pool() {
    let service = test_service();
    let a = service.pool::<Uploads>();
    let b = service.pool::<Uploads>();

    a.submit(|_token| async { Ok(()) }, |_e| {});
    assert_eq!(b.active_workers(), 1);

    let snapshots = service.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].kind, "Uploads");
    assert_eq!(snapshots[0].max_workers, 3);
    service.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_use_creates_one_pool() {
    let service = Arc::new(test_service());
    let done = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let service = Arc::clone(&service);
        let done = Arc::clone(&done);
        tasks.push(tokio::spawn(async move {
            service
                .submit_awaitable::<Reports, _, _>(move |_token| async move {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(done.load(Ordering::SeqCst), 32);
    assert_eq!(service.snapshots().len(), 1);
    assert!(service.pool::<Reports>().active_workers() <= 1);
    service.dispose();
}

#[tokio::test]
async fn kinds_are_independent() {
    let service = test_service();
    service.pool::<Reports>();
    service.pool::<Uploads>();

    let kinds: Vec<_> = service.snapshots().into_iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec!["Reports", "Uploads"]);
    service.dispose();
}

#[tokio::test]
async fn named_kinds_use_their_own_pools() {
    let service = test_service();
    let spec = KindSpec::new("resize", 2);

    let first = service.pool_for(&spec).unwrap();
    // Later specs for the same name reuse the first pool.
    let second = service.pool_for(&KindSpec::new("resize", 8)).unwrap();
    assert_eq!(first.spec().max_workers, 2);
    assert_eq!(second.spec().max_workers, 2);

    service
        .submit_awaitable_to(&spec, |_token| async { Ok(()) })
        .unwrap()
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel();
    service
        .submit_to(
            &spec,
            |_token| async { anyhow::bail!("bad image") },
            move |e| {
                let _ = tx.send(e.to_string());
            },
        )
        .unwrap();
    assert!(rx.await.unwrap().contains("bad image"));

    // A named kind never shares a pool with a typed one of the same name.
    service.pool_for(&KindSpec::new("Reports", 1)).unwrap();
    service.pool::<Reports>();
    assert_eq!(service.snapshots().len(), 3);
    service.dispose();
}

#[tokio::test]
async fn invalid_named_kind_is_rejected() {
    let service = test_service();
    let spec = KindSpec {
        name: "  ".to_string(),
        max_workers: 1,
        dedicated_thread: false,
    };
    assert!(matches!(service.pool_for(&spec), Err(Error::Config(_))));
    assert!(service.snapshots().is_empty());
    service.dispose();
}

#[test]
fn service_requires_a_runtime() {
    let err = QueueService::new(ServiceConfig::default()).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
}

#[test]
fn service_can_target_an_explicit_runtime() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let service = QueueService::with_runtime(ServiceConfig::default(), runtime.handle().clone());

    let handle = service.submit_awaitable::<Reports, _, _>(|_token| async { Ok(()) });
    runtime.block_on(handle.wait()).unwrap();
    service.dispose();
}

// ---------------------------------------------------------------------------
// Submission contracts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fire_and_forget_success_is_silent() {
    let service = test_service();
    let failures = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = oneshot::channel();

    let f = Arc::clone(&failures);
    service.submit::<Reports, _, _>(
        move |_token| async move {
            let _ = tx.send(());
            Ok(())
        },
        move |_e| {
            f.fetch_add(1, Ordering::SeqCst);
        },
    );
    rx.await.unwrap();

    // Give the worker time to finish reporting.
    let pool = service.pool::<Reports>();
    pool.submit_awaitable(|_token| async { Ok(()) }).await.unwrap();
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    service.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn awaitable_failure_surfaces_original_error() {
    let service = test_service();
    let pool = service.pool::<Reports>();

    let err = service
        .submit_awaitable::<Reports, _, _>(|_token| async {
            Err(QuotaExceeded {
                tenant: "acme".to_string(),
            }
            .into())
        })
        .await
        .unwrap_err();

    let source = err.work_error().expect("work failure");
    let quota = source
        .downcast_ref::<QuotaExceeded>()
        .expect("original error type preserved");
    assert_eq!(quota.tenant, "acme");

    tokio::time::timeout(Duration::from_secs(2), async {
        while pool.active_workers() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker slot not released after failure");
    service.dispose();
}

// ---------------------------------------------------------------------------
// Disposal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispose_is_idempotent() {
    let service = test_service();
    let token = service.cancellation_token();
    assert!(!service.is_disposed());

    service.dispose();
    service.dispose();

    assert!(service.is_disposed());
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn actions_observe_the_cancellation_token() {
    let service = test_service();
    let (started_tx, started_rx) = oneshot::channel();

    let handle = service.submit_awaitable::<Uploads, _, _>(move |token| async move {
        let _ = started_tx.send(());
        token.cancelled().await;
        anyhow::bail!("stopped early")
    });
    started_rx.await.unwrap();
    service.dispose();

    let err = handle.await.unwrap_err();
    assert!(err.to_string().contains("stopped early"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispose_cancels_waiting_items_but_not_running_ones() {
    let service = test_service();
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let ran_second = Arc::new(AtomicUsize::new(0));

    let running = service.submit_awaitable::<Reports, _, _>(move |_token| async move {
        let _ = started_tx.send(());
        let _ = release_rx.await;
        Ok(())
    });
    let r = Arc::clone(&ran_second);
    let waiting = service.submit_awaitable::<Reports, _, _>(move |_token| async move {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    started_rx.await.unwrap();
    assert_eq!(waiting.state(), WorkState::Waiting);
    service.dispose();

    let err = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("waiting handle should give up promptly")
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // The running item still completes normally.
    release_tx.send(()).unwrap();
    running.await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ran_second.load(Ordering::SeqCst), 0);
    assert_eq!(service.pool::<Reports>().active_workers(), 0);
}

#[tokio::test]
async fn submissions_after_dispose_are_cancelled() {
    let service = test_service();
    service.dispose();

    let handle = service.submit_awaitable::<Uploads, _, _>(|_token| async { Ok(()) });
    assert!(handle.state().is_terminal());
    assert!(matches!(handle.await, Err(Error::Cancelled)));

    let (tx, rx) = oneshot::channel();
    service.submit::<Uploads, _, _>(
        |_token| async { Ok(()) },
        move |e| {
            let _ = tx.send(e);
        },
    );
    let err = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("failure handler never told about the cancellation")
        .unwrap();
    assert!(matches!(err, Error::Cancelled));

    let pool = service.pool::<Uploads>();
    assert_eq!(pool.active_workers(), 0);
    assert_eq!(pool.queued(), 0, "nothing may pile up after disposal");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_callbacks_hear_about_disposal() {
    let service = test_service();
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    service.submit::<Reports, _, _>(
        move |_token| async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(())
        },
        |e| panic!("running item must not fail: {e}"),
    );
    let (tx, rx) = oneshot::channel();
    service.submit::<Reports, _, _>(
        |_token| async { Ok(()) },
        move |e| {
            let _ = tx.send(e);
        },
    );

    started_rx.await.unwrap();
    service.dispose();
    release_tx.send(()).unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("queued item never settled")
        .unwrap();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(service.pool::<Reports>().queued(), 0);
}
