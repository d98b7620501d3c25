//! Behavioral tests for the in-memory backend, driven through the
//! adapter contract the way an application would use it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use taskqueue_core::{
    handler_fn, InMemoryAdapter, QueueAdapter, TaskHandler, TaskListOptions, TaskStatus,
};

fn counting_handler(counter: Arc<AtomicU32>) -> TaskHandler {
    handler_fn(move |_message| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

fn failing_handler() -> TaskHandler {
    handler_fn(|_message| async move { Err("handler exploded".into()) })
}

#[tokio::test]
async fn test_create_queue_is_idempotent() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    adapter.create_queue("reports").await.unwrap();
    adapter.create_queue("reports").await.unwrap();

    let names = adapter.queue_names().await.unwrap();
    assert_eq!(names.iter().filter(|n| n.as_str() == "reports").count(), 1);
}

#[tokio::test]
async fn test_register_consumer_is_idempotent() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    adapter
        .register_consumer("emails", counting_handler(counter.clone()))
        .await
        .unwrap();
    // The second registration must not create a second consumer.
    adapter
        .register_consumer("emails", counting_handler(counter.clone()))
        .await
        .unwrap();

    adapter.schedule_task("emails", 0, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_delay_is_a_lower_bound() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    adapter
        .register_consumer("delayed", counting_handler(counter.clone()))
        .await
        .unwrap();

    adapter.schedule_task("delayed", 200, None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0, "ran before its delay");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recurring_task_chains_after_each_success() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    adapter
        .schedule_recurring_task("ticker", counting_handler(counter.clone()), 100, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(550)).await;
    let runs = counter.load(Ordering::SeqCst);
    assert!(runs >= 3, "expected at least 3 occurrences, got {runs}");

    adapter.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_stops_renewal_but_not_inflight_occurrence() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    adapter
        .schedule_recurring_task("cancellable", counting_handler(counter.clone()), 100, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    adapter.cancel_task("cancellable").await.unwrap();

    // The occurrence already enqueued at cancel time may still run; after
    // that the chain must be dead.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let settled = counter.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(counter.load(Ordering::SeqCst), settled);

    adapter.close().await.unwrap();
}

#[tokio::test]
async fn test_reschedule_after_cancel_restarts_chain() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    let first = Arc::new(AtomicU32::new(0));
    adapter
        .schedule_recurring_task("ticker", counting_handler(first.clone()), 50, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    adapter.cancel_task("ticker").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Scheduling again after cancel must start a fresh chain, not hit a
    // stale registration that never renews.
    let second = Arc::new(AtomicU32::new(0));
    adapter
        .schedule_recurring_task("ticker", counting_handler(second.clone()), 50, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let runs = second.load(Ordering::SeqCst);
    assert!(runs >= 2, "re-scheduled chain stalled after {runs} runs");

    adapter.close().await.unwrap();
}

#[tokio::test]
async fn test_handler_failure_does_not_affect_other_tasks() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    adapter
        .register_consumer("broken", failing_handler())
        .await
        .unwrap();
    adapter
        .schedule_recurring_task("healthy", counting_handler(counter.clone()), 100, None)
        .await
        .unwrap();

    adapter.schedule_task("broken", 0, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;

    assert!(counter.load(Ordering::SeqCst) >= 2);

    let stats = adapter.queue_stats(Some("broken")).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].failed, 1);

    adapter.close().await.unwrap();
}

#[tokio::test]
async fn test_task_listing_paginates() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    for i in 0..45 {
        adapter
            .schedule_task("bulk", 60_000, Some(serde_json::json!({ "i": i })))
            .await
            .unwrap();
    }
    // Job records are written by the delivery tasks; give them a moment.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let page1 = adapter
        .tasks(TaskListOptions::for_queue("bulk").with_page(1, 20))
        .await
        .unwrap();
    assert_eq!(page1.total, 45);
    assert_eq!(page1.total_pages, 3);
    assert_eq!(page1.tasks.len(), 20);

    let page3 = adapter
        .tasks(TaskListOptions::for_queue("bulk").with_page(3, 20))
        .await
        .unwrap();
    assert_eq!(page3.tasks.len(), 5);

    adapter.close().await.unwrap();
}

#[tokio::test]
async fn test_task_listing_filters_by_status() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    adapter
        .register_consumer("ok-task", counting_handler(counter))
        .await
        .unwrap();
    adapter
        .register_consumer("bad-task", failing_handler())
        .await
        .unwrap();

    adapter.schedule_task("ok-task", 0, None).await.unwrap();
    adapter.schedule_task("bad-task", 0, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let failed = adapter
        .tasks(TaskListOptions::default().with_status(TaskStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.total, 1);
    assert_eq!(failed.tasks[0].name, "bad-task");

    let completed = adapter
        .tasks(TaskListOptions::default().with_status(TaskStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.total, 1);
    assert_eq!(completed.tasks[0].name, "ok-task");

    adapter.close().await.unwrap();
}

#[tokio::test]
async fn test_task_lookup_by_id() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    adapter.schedule_task("lookup", 60_000, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let page = adapter
        .tasks(TaskListOptions::for_queue("lookup"))
        .await
        .unwrap();
    let id = page.tasks[0].id.clone();

    let found = adapter.task(&id).await.unwrap().unwrap();
    assert_eq!(found.id, id);
    assert_eq!(found.status, TaskStatus::Created);

    assert!(adapter.task("no-such-id").await.unwrap().is_none());

    adapter.close().await.unwrap();
}

// One-shot delivery with a payload, end to end.
#[tokio::test]
async fn test_immediate_task_delivers_payload() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    let seen = Arc::new(Mutex::new(None));
    let seen_in_handler = seen.clone();
    adapter
        .register_consumer(
            "welcome-email",
            handler_fn(move |message| {
                let seen = seen_in_handler.clone();
                async move {
                    *seen.lock().unwrap() = message.data;
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    adapter
        .schedule_task(
            "welcome-email",
            0,
            Some(serde_json::json!({"userId": 42, "template": "welcome"})),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let payload = seen.lock().unwrap().clone().expect("handler never ran");
    assert_eq!(payload["userId"], 42);

    let stats = adapter.queue_stats(Some("welcome-email")).await.unwrap();
    assert_eq!(stats[0].completed, 1);

    adapter.close().await.unwrap();
}

// Recurring heartbeat: occurrences keep at least the interval apart.
#[tokio::test]
async fn test_heartbeat_spacing_respects_interval() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    let instants: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = instants.clone();
    adapter
        .schedule_recurring_task(
            "heartbeat",
            handler_fn(move |_message| {
                let instants = recorder.clone();
                async move {
                    instants.lock().unwrap().push(Instant::now());
                    Ok(())
                }
            }),
            200,
            None,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    adapter.close().await.unwrap();

    let instants = instants.lock().unwrap();
    assert!(instants.len() >= 3, "expected >= 3 beats, got {}", instants.len());
    for pair in instants.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(180),
            "beats only {gap:?} apart"
        );
    }
}

#[tokio::test]
async fn test_registered_consumer_queue_is_listed() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    adapter
        .register_consumer("jobs", failing_handler())
        .await
        .unwrap();

    let names = adapter.queue_names().await.unwrap();
    assert!(names.contains(&"jobs".to_string()));

    adapter.close().await.unwrap();
}

#[tokio::test]
async fn test_close_stops_recurring_delivery() {
    let adapter = InMemoryAdapter::new();
    adapter.initialize().await.unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    adapter
        .schedule_recurring_task("short-lived", counting_handler(counter.clone()), 50, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(180)).await;
    adapter.close().await.unwrap();

    let at_close = counter.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    // One occurrence may have been mid-flight at close; no chain after it.
    assert!(counter.load(Ordering::SeqCst) <= at_close + 1);
}
