//! End-to-end tests of the job engine: retry chains, circuit breaking,
//! classification, concurrency limits, and event ordering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use alephauto_backend::jobs::{
    handler_fn, EventKind, HandlerError, JobEvent, JobOptions, JobServer, JobServerConfig,
    JobServerError, JobStatus, JobStore, MemoryJobStore, ABSOLUTE_MAX_RETRIES,
};
use alephauto_backend::jobs::store::JobFilter;
use alephauto_backend::telemetry::{RecordingTelemetry, Severity};

fn test_config() -> JobServerConfig {
    JobServerConfig {
        job_type: "test".to_string(),
        max_concurrent: 3,
        queue_max_size: 1000,
        default_timeout_ms: 60_000,
        base_retry_delay_ms: 50,
        default_max_retries: 2,
        drain_timeout_ms: 5_000,
    }
}

fn build_server(
    config: JobServerConfig,
    handler: Arc<dyn alephauto_backend::jobs::JobHandler>,
) -> (JobServer, Arc<MemoryJobStore>, Arc<RecordingTelemetry>) {
    let store = Arc::new(MemoryJobStore::new());
    let telemetry = Arc::new(RecordingTelemetry::new());
    let server = JobServer::new(config, handler, store.clone(), telemetry.clone());
    (server, store, telemetry)
}

async fn collect_until_drained(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for queue:drained")
            .expect("event stream closed");
        let kind = event.kind;
        events.push(event);
        if kind == EventKind::QueueDrained {
            return events;
        }
    }
}

fn kinds_for<'a>(events: &'a [JobEvent], id: &str) -> Vec<EventKind> {
    events
        .iter()
        .filter(|e| e.job_id() == Some(id))
        .map(|e| e.kind)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn retry_then_succeed_emits_full_chain() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_handler = calls.clone();
    let handler = handler_fn(move |_ctx| {
        let calls = calls_handler.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(HandlerError::with_code("operation timed out", "timed-out"))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    });
    let (server, _store, _telemetry) = build_server(test_config(), handler);

    let mut rx = server.subscribe();
    let options = JobOptions {
        max_retries: 2,
        retry_delay_ms: Some(100),
        ..JobOptions::default()
    };
    server
        .create_job_with(Some("j".to_string()), json!({}), options)
        .unwrap();

    let events = collect_until_drained(&mut rx).await;

    assert_eq!(
        kinds_for(&events, "j"),
        vec![
            EventKind::JobCreated,
            EventKind::JobQueued,
            EventKind::JobStarted,
            EventKind::JobFailed,
        ]
    );
    assert_eq!(
        kinds_for(&events, "j-retry1"),
        vec![
            EventKind::JobCreated,
            EventKind::JobQueued,
            EventKind::JobStarted,
            EventKind::JobFailed,
        ]
    );
    assert_eq!(
        kinds_for(&events, "j-retry2"),
        vec![
            EventKind::JobCreated,
            EventKind::JobQueued,
            EventKind::JobStarted,
            EventKind::JobCompleted,
        ]
    );

    // Failure events carry the retry flag and the attempt ordinal.
    let failures: Vec<&JobEvent> = events
        .iter()
        .filter(|e| e.kind == EventKind::JobFailed)
        .collect();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].retry_scheduled, Some(true));
    assert_eq!(failures[0].attempts, Some(1));
    assert_eq!(failures[1].retry_scheduled, Some(true));
    assert_eq!(failures[1].attempts, Some(2));

    // A retry's created event comes after the failure that scheduled it.
    let failed_pos = events
        .iter()
        .position(|e| e.kind == EventKind::JobFailed && e.job_id() == Some("j"))
        .unwrap();
    let retry_created_pos = events
        .iter()
        .position(|e| e.kind == EventKind::JobCreated && e.job_id() == Some("j-retry1"))
        .unwrap();
    assert!(failed_pos < retry_created_pos);

    // Retry bookkeeping is gone after the chain succeeds.
    assert!(server.retry_info("j").is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn circuit_breaker_caps_attempts_at_five() {
    let starts = Arc::new(AtomicUsize::new(0));
    let starts_handler = starts.clone();
    let handler = handler_fn(move |_ctx| {
        let starts = starts_handler.clone();
        async move {
            starts.fetch_add(1, Ordering::SeqCst);
            Err::<Value, _>(HandlerError::with_code("operation timed out", "timed-out"))
        }
    });
    let (server, _store, telemetry) = build_server(test_config(), handler);

    let mut rx = server.subscribe();
    let options = JobOptions {
        max_retries: 100,
        retry_delay_ms: Some(1),
        ..JobOptions::default()
    };
    server
        .create_job_with(Some("stuck".to_string()), json!({}), options)
        .unwrap();

    let events = collect_until_drained(&mut rx).await;

    // Original plus four retries.
    assert_eq!(starts.load(Ordering::SeqCst), ABSOLUTE_MAX_RETRIES as usize);
    let final_id = format!("stuck-retry{}", ABSOLUTE_MAX_RETRIES - 1);
    let final_failed = events
        .iter()
        .find(|e| e.kind == EventKind::JobFailed && e.job_id() == Some(&final_id))
        .expect("terminal failure event");
    assert_eq!(final_failed.retry_scheduled, Some(false));
    assert_eq!(final_failed.attempts, Some(ABSOLUTE_MAX_RETRIES));

    let error = final_failed.job.as_ref().unwrap().error.as_ref().unwrap();
    assert!(error.circuit_breaker_tripped);
    assert_eq!(error.code.as_deref(), Some("circuit-breaker-tripped"));

    let errors = telemetry.messages_with_severity(Severity::Error);
    assert!(errors.iter().any(|m| m.contains("circuit breaker")));
    assert!(server.retry_info("stuck").is_none());
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failure_is_terminal_immediately() {
    let handler = handler_fn(|_ctx| async {
        Err::<Value, _>(HandlerError::with_code("no such file", "file-not-found"))
    });
    let (server, store, _telemetry) = build_server(test_config(), handler);

    let mut rx = server.subscribe();
    server
        .create_job_with(Some("missing".to_string()), json!({}), JobOptions::default())
        .unwrap();
    let events = collect_until_drained(&mut rx).await;

    assert_eq!(
        kinds_for(&events, "missing"),
        vec![
            EventKind::JobCreated,
            EventKind::JobQueued,
            EventKind::JobStarted,
            EventKind::JobFailed,
        ]
    );
    let failed = events
        .iter()
        .find(|e| e.kind == EventKind::JobFailed)
        .unwrap();
    assert_eq!(failed.retry_scheduled, Some(false));
    assert!(server.retry_info("missing").is_none());

    // Terminal state is persisted.
    let persisted = store
        .load(&JobFilter {
            status: Some(JobStatus::Failed),
            ..JobFilter::default()
        })
        .unwrap();
    assert_eq!(persisted.len(), 1);
    assert!(!persisted[0].error.as_ref().unwrap().retryable);
}

#[tokio::test(start_paused = true)]
async fn concurrency_stays_within_the_gate() {
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let live_handler = live.clone();
    let peak_handler = peak.clone();
    let handler = handler_fn(move |_ctx| {
        let live = live_handler.clone();
        let peak = peak_handler.clone();
        async move {
            let now = live.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            live.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({}))
        }
    });
    let config = JobServerConfig {
        max_concurrent: 2,
        ..test_config()
    };
    let (server, _store, _telemetry) = build_server(config, handler);

    for _ in 0..6 {
        server.create_job(json!({})).unwrap();
    }
    server.wait_for_completion(10_000).await.unwrap();

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(server.get_counts().completed, 6);
}

#[tokio::test(start_paused = true)]
async fn queue_capacity_rejects_with_a_capacity_error() {
    let handler = handler_fn(|_ctx| async { Ok(json!({})) });
    let config = JobServerConfig {
        queue_max_size: 2,
        ..test_config()
    };
    let (server, _store, _telemetry) = build_server(config, handler);

    server.pause();
    server.create_job(json!({"n": 1})).unwrap();
    server.create_job(json!({"n": 2})).unwrap();
    let err = server.create_job(json!({"n": 3})).unwrap_err();
    assert!(matches!(err, JobServerError::QueueFull { depth: 2 }));

    // Draining the queue frees capacity again.
    server.resume();
    server.wait_for_completion(10_000).await.unwrap();
    server.pause();
    server.create_job(json!({"n": 4})).unwrap();
}

#[tokio::test(start_paused = true)]
async fn timeout_is_enforced_with_cooperative_cancel() {
    let handler = handler_fn(|ctx: alephauto_backend::jobs::JobContext| async move {
        // Sleep far past the budget but honor the cancel signal.
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(json!({})),
            _ = ctx.cancelled() => Err(HandlerError::new("interrupted")),
        }
    });
    let (server, _store, _telemetry) = build_server(test_config(), handler);

    let mut rx = server.subscribe();
    let options = JobOptions {
        max_retries: 0,
        timeout_ms: Some(100),
        ..JobOptions::default()
    };
    server
        .create_job_with(Some("slow".to_string()), json!({}), options)
        .unwrap();
    let events = collect_until_drained(&mut rx).await;

    let failed = events
        .iter()
        .find(|e| e.kind == EventKind::JobFailed)
        .unwrap();
    let error = failed.job.as_ref().unwrap().error.as_ref().unwrap();
    assert_eq!(error.code.as_deref(), Some("timed-out"));
}

#[tokio::test(start_paused = true)]
async fn uncooperative_handler_still_fails_but_holds_the_slot() {
    let finished = Arc::new(AtomicUsize::new(0));
    let finished_handler = finished.clone();
    let handler = handler_fn(move |_ctx| {
        let finished = finished_handler.clone();
        async move {
            // Ignores cancellation entirely.
            tokio::time::sleep(Duration::from_millis(5_000)).await;
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(json!({}))
        }
    });
    let (server, _store, _telemetry) = build_server(test_config(), handler);

    let mut rx = server.subscribe();
    let options = JobOptions {
        max_retries: 0,
        timeout_ms: Some(100),
        ..JobOptions::default()
    };
    server
        .create_job_with(Some("stubborn".to_string()), json!({}), options)
        .unwrap();

    // The failure is recorded at deadline + grace even though the handler
    // is still running.
    let events = collect_until_drained(&mut rx).await;
    let failed = events
        .iter()
        .find(|e| e.kind == EventKind::JobFailed)
        .unwrap();
    assert_eq!(
        failed
            .job
            .as_ref()
            .unwrap()
            .error
            .as_ref()
            .unwrap()
            .code
            .as_deref(),
        Some("timed-out")
    );
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    // Eventually the handler returns and the slot frees up.
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn progress_events_are_monotonic_and_running_only() {
    let handler = handler_fn(|ctx: alephauto_backend::jobs::JobContext| async move {
        ctx.report_progress(10);
        ctx.report_progress(5); // regression, ignored
        ctx.report_progress(60);
        Ok(json!({}))
    });
    let (server, _store, _telemetry) = build_server(test_config(), handler);

    let mut rx = server.subscribe();
    server
        .create_job_with(Some("p".to_string()), json!({}), JobOptions::default())
        .unwrap();
    let events = collect_until_drained(&mut rx).await;

    let progress: Vec<u8> = events
        .iter()
        .filter(|e| e.kind == EventKind::JobProgress)
        .map(|e| e.progress.unwrap())
        .collect();
    assert_eq!(progress, vec![10, 60]);
}

#[tokio::test(start_paused = true)]
async fn priority_orders_dispatch_with_fifo_tiebreak() {
    let order = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let order_handler = order.clone();
    let handler = handler_fn(move |ctx: alephauto_backend::jobs::JobContext| {
        let order = order_handler.clone();
        async move {
            order.lock().unwrap().push(ctx.job().id.clone());
            Ok(json!({}))
        }
    });
    let config = JobServerConfig {
        max_concurrent: 1,
        ..test_config()
    };
    let (server, _store, _telemetry) = build_server(config, handler);

    server.pause();
    let opts = |priority: Option<i64>| JobOptions {
        priority,
        ..JobOptions::default()
    };
    server
        .create_job_with(Some("low".to_string()), json!({}), opts(None))
        .unwrap();
    server
        .create_job_with(Some("first".to_string()), json!({}), opts(Some(10)))
        .unwrap();
    server
        .create_job_with(Some("second".to_string()), json!({}), opts(Some(10)))
        .unwrap();
    server.resume();
    server.wait_for_completion(10_000).await.unwrap();

    assert_eq!(
        order.lock().unwrap().clone(),
        vec!["first".to_string(), "second".to_string(), "low".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn wait_for_completion_returns_immediately_when_idle() {
    let handler = handler_fn(|_ctx| async { Ok(json!({})) });
    let (server, _store, _telemetry) = build_server(test_config(), handler);
    server.wait_for_completion(100).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn duplicate_ids_are_rejected() {
    let handler = handler_fn(|_ctx| async { Ok(json!({})) });
    let (server, _store, _telemetry) = build_server(test_config(), handler);

    server.pause();
    server
        .create_job_with(Some("dup".to_string()), json!({}), JobOptions::default())
        .unwrap();
    let err = server
        .create_job_with(Some("dup".to_string()), json!({}), JobOptions::default())
        .unwrap_err();
    assert!(matches!(err, JobServerError::Duplicate(_)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_refuses_new_jobs() {
    let handler = handler_fn(|_ctx| async { Ok(json!({})) });
    let (server, _store, _telemetry) = build_server(test_config(), handler);

    server.create_job(json!({})).unwrap();
    server.wait_for_completion(10_000).await.unwrap();
    server.shutdown().await;
    assert!(matches!(
        server.create_job(json!({})),
        Err(JobServerError::Stopping)
    ));
}

#[tokio::test(start_paused = true)]
async fn terminal_jobs_keep_their_results() {
    let handler = handler_fn(|ctx: alephauto_backend::jobs::JobContext| async move {
        Ok(json!({"echo": ctx.job().data["n"]}))
    });
    let (server, store, _telemetry) = build_server(test_config(), handler);

    let id = server.create_job(json!({"n": 7})).unwrap();
    server.wait_for_completion(10_000).await.unwrap();

    let job = server.get_job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!({"echo": 7})));
    assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
    assert!(job.started_at.unwrap() >= job.created_at);

    let persisted = store
        .load(&JobFilter {
            status: Some(JobStatus::Completed),
            ..JobFilter::default()
        })
        .unwrap();
    assert_eq!(persisted[0].result, Some(json!({"echo": 7})));
}
