use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kindling_domain::coordinator::{
    CoordinationService, CoordinatorConfig, StoredResponse, WaitResult,
};
use kindling_domain::fingerprint::RequestIdentity;
use kindling_domain::keys::RecordKeys;
use kindling_domain::memory::InMemoryKvStore;
use kindling_domain::ports::kv::{KvStore, SetOptions};
use kindling_domain::priority::PriorityTable;
use serde_json::json;
use tokio::time::{Instant, sleep};

const USER: &str = "reader@example.com";

fn service() -> (InMemoryKvStore, CoordinationService) {
    let store = InMemoryKvStore::new();
    let service = CoordinationService::new(
        Arc::new(store.clone()),
        PriorityTable::default(),
        CoordinatorConfig::default(),
    );
    (store, service)
}

fn request(path: &str) -> RequestIdentity {
    RequestIdentity::new(USER, path, "GET")
}

fn open_book(title: &str) -> RequestIdentity {
    request("/open-book").with_params([("title", title)])
}

#[derive(Debug)]
enum Outcome {
    Executed,
    Deduplicated(StoredResponse),
    Missed,
}

#[tokio::test(start_paused = true)]
async fn identical_concurrent_requests_execute_once() {
    let (store, service) = service();
    let executions = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let service = service.clone();
        let executions = executions.clone();
        handles.push(tokio::spawn(async move {
            let mut coordinator = service.request(request("/books"));
            if coordinator.claim_request().await {
                executions.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(3)).await;
                coordinator
                    .store_response(json!({ "books": ["Dune", "Emma"] }), 200)
                    .await;
                Outcome::Executed
            } else {
                match coordinator.wait_for_deduplicated_response().await {
                    Some(response) => Outcome::Deduplicated(response),
                    None => Outcome::Missed,
                }
            }
        }));
    }

    let mut executed = 0;
    let mut deduplicated = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Outcome::Executed => executed += 1,
            Outcome::Deduplicated(response) => deduplicated.push(response),
            Outcome::Missed => panic!("waiter timed out"),
        }
    }

    assert_eq!(executed, 1);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(deduplicated.len(), 4);
    for response in deduplicated {
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, json!({ "books": ["Dune", "Emma"] }));
    }
    assert!(
        store.keys_with_prefix("kindle:").is_empty(),
        "leaked keys: {:?}",
        store.keys_with_prefix("kindle:")
    );
}

#[tokio::test(start_paused = true)]
async fn completion_without_waiters_retains_nothing() {
    let (store, service) = service();
    let mut first = service.request(request("/state"));
    assert!(first.claim_request().await);
    first.store_response(json!({ "state": "reading" }), 200).await;

    let record = RecordKeys::for_request(first.request_key());
    for key in [
        &record.progress,
        &record.result,
        &record.waiters,
        &record.cancelled,
    ] {
        assert!(!store.contains_key(key), "{key} should be gone");
    }

    let mut second = service.request(request("/state"));
    assert_eq!(second.request_key(), first.request_key());
    assert!(second.claim_request().await, "must execute fresh");
    assert!(!store.contains_key(&record.status));
    second.store_response(json!({ "state": "library" }), 200).await;

    sleep(Duration::from_secs(3)).await;
    assert!(store.keys_with_prefix(first.request_key()).is_empty());
    assert!(store.keys_with_prefix("kindle:user:").is_empty());
}

#[tokio::test(start_paused = true)]
async fn higher_priority_claim_cancels_lower_priority_request() {
    let (store, service) = service();
    let mut books = service.request(request("/books"));
    assert!(books.claim_request().await);

    let mut open = service.request(open_book("Dune"));
    assert!(open.claim_request().await);

    assert!(books.is_cancelled().await);
    assert!(!books.is_duplicate_in_progress().await);
    assert!(!open.is_cancelled().await);

    let pointer = service
        .cancellation()
        .active_request_info(USER)
        .await
        .unwrap();
    assert_eq!(pointer.request_key, open.request_key());
    assert_eq!(pointer.priority, 100);
    assert!(store.contains_key(&RecordKeys::for_request(open.request_key()).progress));
}

#[tokio::test(start_paused = true)]
async fn preemption_check_marks_active_lower_priority_request() {
    let (_store, service) = service();
    let mut books = service.request(request("/books"));
    assert!(books.claim_request().await);

    let open = service.request(open_book("Dune"));
    assert!(open.preempt_lower_priority().await);
    assert!(books.is_cancelled().await);

    let screenshot = service.request(request("/screenshot"));
    assert!(!screenshot.preempt_lower_priority().await);
}

#[tokio::test(start_paused = true)]
async fn lower_priority_request_waits_for_higher_priority_completion() {
    let (_store, service) = service();
    let mut open = service.request(open_book("Dune"));
    assert!(open.claim_request().await);

    let mut books = service.request(request("/books"));
    assert!(books.should_wait_for_higher_priority().await);
    assert!(!books.claim_request().await);
    assert!(!books.is_duplicate_in_progress().await);

    let execution = Duration::from_secs(4);
    let started = Instant::now();
    let executor = tokio::spawn(async move {
        sleep(execution).await;
        open.store_response(json!({ "opened": "Dune" }), 200).await;
    });

    let result = books.wait_for_higher_priority_completion().await;
    assert_eq!(result, WaitResult::Ready);
    assert!(started.elapsed() >= execution);
    executor.await.unwrap();
    assert!(books.claim_request().await);
}

#[tokio::test(start_paused = true)]
async fn waiting_request_observes_its_own_cancellation() {
    let (_store, service) = service();
    let mut shutdown = service.request(RequestIdentity::new(USER, "/shutdown", "POST"));
    assert!(shutdown.claim_request().await);

    let mut navigate = service.request(request("/navigate").with_params([("action", "next")]));
    assert!(!navigate.claim_request().await);

    service
        .cancellation()
        .mark_cancelled(USER, Some(navigate.request_key()))
        .await;
    assert_eq!(
        navigate.wait_for_higher_priority_completion().await,
        WaitResult::Cancelled
    );
}

#[tokio::test(start_paused = true)]
async fn higher_priority_wait_times_out_under_record_ttl() {
    let (_store, service) = service();
    let mut open = service.request(open_book("Dune"));
    assert!(open.claim_request().await);

    let books = service.request(request("/books"));
    let started = Instant::now();
    assert_eq!(
        books.wait_for_higher_priority_completion().await,
        WaitResult::Timeout
    );
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(125));
    assert!(waited < Duration::from_secs(130));
}

#[tokio::test(start_paused = true)]
async fn newest_same_endpoint_request_wins() {
    let (_store, service) = service();
    let mut first = service.request(open_book("Dune"));
    let mut second = service.request(open_book("Emma"));
    let mut third = service.request(open_book("Ulysses"));

    assert!(first.claim_request().await);
    assert!(second.claim_request().await);
    assert!(third.claim_request().await);

    assert!(first.is_cancelled().await);
    assert!(second.is_cancelled().await);
    assert!(!third.is_cancelled().await);
    assert!(third.is_duplicate_in_progress().await);

    let pointer = service
        .cancellation()
        .active_request_info(USER)
        .await
        .unwrap();
    assert_eq!(pointer.request_key, third.request_key());
}

#[tokio::test(start_paused = true)]
async fn identical_same_endpoint_requests_deduplicate_instead_of_cancelling() {
    let (_store, service) = service();
    let mut first = service.request(open_book("Dune"));
    let mut second = service.request(open_book("Dune"));

    assert!(first.claim_request().await);
    assert!(!second.claim_request().await);
    assert!(second.is_duplicate_in_progress().await);
    assert!(!first.is_cancelled().await);

    let executor = tokio::spawn(async move {
        sleep(Duration::from_secs(1)).await;
        first.store_response(json!({ "opened": "Dune" }), 200).await;
    });
    let response = second.wait_for_deduplicated_response().await.unwrap();
    assert_eq!(response.body, json!({ "opened": "Dune" }));
    executor.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn legacy_last_one_wins_paths_force_claim() {
    let store = InMemoryKvStore::new();
    let service = CoordinationService::new(
        Arc::new(store.clone()),
        PriorityTable::default().with_legacy_last_one_wins(["/open-random-book"]),
        CoordinatorConfig::default(),
    );
    let mut first = service.request(request("/open-random-book"));
    let mut second = service.request(request("/open-random-book"));
    assert!(first.claim_request().await);
    assert!(second.claim_request().await);
    assert!(!second.is_cancelled().await);
}

#[tokio::test(start_paused = true)]
async fn last_waiter_cleans_up_exactly_once() {
    let (store, service) = service();
    let mut executor = service.request(request("/books"));
    assert!(executor.claim_request().await);

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let mut waiter = service.request(request("/books"));
        assert!(!waiter.claim_request().await);
        waiters.push(tokio::spawn(async move {
            waiter.wait_for_deduplicated_response().await
        }));
    }

    sleep(Duration::from_millis(100)).await;
    let record = RecordKeys::for_request(executor.request_key());
    assert_eq!(store.get(&record.waiters).await.unwrap().as_deref(), Some("3"));
    executor.store_response(json!({ "count": 2 }), 200).await;

    for waiter in waiters {
        assert!(waiter.await.unwrap().is_some());
    }
    assert!(store.keys_with_prefix(executor.request_key()).is_empty());
    assert!(store.get(&record.waiters).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn executor_failure_releases_waiters() {
    let (store, service) = service();
    let mut executor = service.request(request("/screenshot"));
    assert!(executor.claim_request().await);

    let mut waiter = service.request(request("/screenshot"));
    assert!(!waiter.claim_request().await);
    let pending = tokio::spawn(async move { waiter.wait_for_deduplicated_response().await });

    sleep(Duration::from_secs(1)).await;
    executor.mark_error().await;

    assert!(pending.await.unwrap().is_none());
    assert!(
        service
            .cancellation()
            .active_request_info(USER)
            .await
            .is_none()
    );
    assert!(store.keys_with_prefix(executor.request_key()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn corrupt_result_is_treated_as_a_miss() {
    let (store, service) = service();
    let mut waiter = service.request(request("/state"));
    let record = RecordKeys::for_request(waiter.request_key());
    store
        .set(&record.progress, "in_progress", SetOptions::default())
        .await
        .unwrap();
    store
        .set(&record.result, "not json", SetOptions::default())
        .await
        .unwrap();
    store
        .set(&record.status, "completed", SetOptions::default())
        .await
        .unwrap();

    assert!(!waiter.claim_request().await);
    let started = Instant::now();
    assert!(waiter.wait_for_deduplicated_response().await.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn dedup_wait_gives_up_at_the_ceiling() {
    let (_store, service) = service();
    let mut executor = service.request(request("/books"));
    assert!(executor.claim_request().await);

    let mut waiter = service.request(request("/books"));
    assert!(!waiter.claim_request().await);
    let started = Instant::now();
    assert!(waiter.wait_for_deduplicated_response().await.is_none());
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(125));
    assert!(waited < Duration::from_secs(130));
}

#[tokio::test(start_paused = true)]
async fn request_numbers_count_active_requests_per_user() {
    let (store, service) = service();
    let mut books = service.request(request("/books"));
    let mut state = service.request(request("/state"));

    assert_eq!(books.assign_request_number().await, Some(1));
    assert_eq!(books.assign_request_number().await, Some(1));
    assert!(!books.multiple_requests_detected());

    assert_eq!(state.assign_request_number().await, Some(2));
    assert!(state.multiple_requests_detected());
    assert!(books.has_multiple_requests().await);

    let mut duplicate = service.request(request("/books"));
    assert_eq!(duplicate.assign_request_number().await, Some(1));

    books.release_request_number().await;
    books.release_request_number().await;
    duplicate.release_request_number().await;
    assert!(!state.has_multiple_requests().await);
    state.release_request_number().await;

    let counter = service.keys().request_counter(USER);
    let count = service.keys().active_request_count(USER);
    assert!(!store.contains_key(&counter));
    assert!(!store.contains_key(&count));

    let mut fresh = service.request(request("/navigate"));
    assert_eq!(fresh.assign_request_number().await, Some(1));
}

#[tokio::test(start_paused = true)]
async fn taken_ticket_is_released_exactly_once() {
    let (store, service) = service();
    let mut books = service.request(request("/books"));
    let mut state = service.request(request("/state"));
    assert_eq!(books.assign_request_number().await, Some(1));
    assert_eq!(state.assign_request_number().await, Some(2));

    let ticket = books.take_ticket().expect("ticket");
    assert_eq!(ticket.number(), 1);
    assert_eq!(books.request_number(), None);
    books.release_request_number().await;
    assert!(state.has_multiple_requests().await);

    books.release_ticket(ticket).await;
    assert!(!state.has_multiple_requests().await);
    state.release_request_number().await;
    assert!(!store.contains_key(&service.keys().active_request_count(USER)));
}

#[tokio::test(start_paused = true)]
async fn side_effecting_methods_bypass_coordination() {
    let (store, service) = service();
    let mut delete = service.request(RequestIdentity::new(USER, "/books", "DELETE"));
    assert!(delete.claim_request().await);
    let mut again = service.request(RequestIdentity::new(USER, "/books", "DELETE"));
    assert!(again.claim_request().await);
    delete.store_response(json!({}), 204).await;
    assert!(store.keys_with_prefix("kindle:").is_empty());

    let mut tokens = service.request(RequestIdentity::new(USER, "/staff-tokens", "GET"));
    assert!(tokens.claim_request().await);
    assert!(store.keys_with_prefix("kindle:").is_empty());
}

#[tokio::test(start_paused = true)]
async fn store_outage_fails_open() {
    let (store, service) = service();
    store.set_offline(true);

    let mut coordinator = service.request(request("/books"));
    assert!(coordinator.claim_request().await);
    assert!(!coordinator.is_cancelled().await);
    assert!(!coordinator.is_duplicate_in_progress().await);
    assert!(!coordinator.should_wait_for_higher_priority().await);
    assert_eq!(
        coordinator.wait_for_higher_priority_completion().await,
        WaitResult::Error
    );
    coordinator.store_response(json!({ "books": [] }), 200).await;
    assert_eq!(coordinator.request_number(), None);

    store.set_offline(false);
    assert!(store.keys_with_prefix("kindle:").is_empty());
}

#[tokio::test(start_paused = true)]
async fn books_scan_is_cancelled_by_open_book_and_later_request_runs_fresh() {
    let (_store, service) = service();
    let cancellation = service.cancellation();

    let mut scan = service.request(request("/books"));
    assert!(scan.claim_request().await);
    let scan_key = scan.request_key().to_string();
    let mut checker = cancellation.checker_for(USER, scan_key, 1);
    let scan_task = tokio::spawn(async move {
        loop {
            if checker.check().await {
                scan.mark_error().await;
                return Instant::now();
            }
            sleep(Duration::from_millis(500)).await;
        }
    });

    sleep(Duration::from_secs(3)).await;
    let mut open = service.request(open_book("Dune"));
    assert!(open.claim_request().await);
    let claimed_at = Instant::now();

    let mut duplicate = service.request(open_book("Dune"));
    assert!(!duplicate.claim_request().await);
    let duplicate_task =
        tokio::spawn(async move { duplicate.wait_for_deduplicated_response().await });

    let detected_at = scan_task.await.unwrap();
    assert!(detected_at.duration_since(claimed_at) <= Duration::from_secs(2));

    sleep(Duration::from_secs(5)).await;
    open.store_response(json!({ "opened": "Dune" }), 200).await;
    let shared = duplicate_task.await.unwrap().unwrap();
    assert_eq!(shared.status_code, 200);
    assert_eq!(shared.body, json!({ "opened": "Dune" }));

    sleep(Duration::from_secs(15)).await;
    let mut later = service.request(open_book("Dune"));
    assert!(later.claim_request().await);
}

#[tokio::test(start_paused = true)]
async fn request_arriving_inside_the_result_window_reuses_the_result() {
    let (store, service) = service();
    let mut executor = service.request(open_book("Dune"));
    assert!(executor.claim_request().await);

    let mut waiter = service.request(open_book("Dune"));
    assert!(!waiter.claim_request().await);
    let waiter_task = tokio::spawn(async move { waiter.wait_for_deduplicated_response().await });

    sleep(Duration::from_secs(1)).await;
    executor
        .store_response(json!({ "opened": "Dune" }), 200)
        .await;

    sleep(Duration::from_millis(100)).await;
    let mut late = service.request(open_book("Dune"));
    assert!(!late.claim_request().await);
    assert!(late.is_duplicate_in_progress().await);
    let reused = late.wait_for_deduplicated_response().await.expect("cached result");
    assert_eq!(reused.status_code, 200);
    assert_eq!(reused.body, json!({ "opened": "Dune" }));

    let shared = waiter_task.await.unwrap().expect("waiter result");
    assert_eq!(shared, reused);
    assert!(store.keys_with_prefix("kindle:request:").is_empty());
}

#[tokio::test(start_paused = true)]
async fn abandoned_claim_can_be_retried_and_waiters_get_the_retry_result() {
    let (store, service) = service();
    let mut executor = service.request(request("/books"));
    assert!(executor.claim_request().await);

    let mut waiter = service.request(request("/books"));
    assert!(!waiter.claim_request().await);
    let pending = tokio::spawn(async move { waiter.wait_for_deduplicated_response().await });

    sleep(Duration::from_secs(1)).await;
    executor.abandon().await;
    let record = RecordKeys::for_request(executor.request_key());
    assert!(!store.contains_key(&record.status));

    let mut retry = service.request(request("/books"));
    assert!(retry.claim_request().await);
    sleep(Duration::from_secs(1)).await;
    retry.store_response(json!({ "books": ["Dune"] }), 200).await;

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.body, json!({ "books": ["Dune"] }));
    assert!(store.keys_with_prefix("kindle:").is_empty());
}
