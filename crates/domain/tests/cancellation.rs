use std::sync::Arc;

use kindling_domain::cancellation::CancellationChecker;
use kindling_domain::coordinator::{CoordinationService, CoordinatorConfig};
use kindling_domain::fingerprint::RequestIdentity;
use kindling_domain::memory::InMemoryKvStore;
use kindling_domain::priority::PriorityTable;

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

#[tokio::test]
async fn nothing_to_cancel_without_an_active_request() {
    let (_store, service) = service();
    let query = service.cancellation();
    assert!(query.active_request_info(USER).await.is_none());
    assert!(!query.should_cancel(USER, None).await);
    assert!(!query.mark_cancelled(USER, None).await);
}

#[tokio::test]
async fn marking_the_active_request_cancels_it() {
    let (_store, service) = service();
    let mut books = service.request(RequestIdentity::new(USER, "/books", "GET"));
    assert!(books.claim_request().await);

    let query = service.cancellation();
    let info = query.active_request_info(USER).await.unwrap();
    assert_eq!(info.path, "/books");
    assert_eq!(info.request_number, Some(1));

    assert!(!query.should_cancel(USER, None).await);
    assert!(query.mark_cancelled(USER, None).await);
    assert!(query.should_cancel(USER, None).await);
    assert!(query.should_cancel(USER, Some(books.request_key())).await);
    assert!(books.is_cancelled().await);
}

#[tokio::test]
async fn explicit_request_key_is_checked_directly() {
    let (_store, service) = service();
    let query = service.cancellation();
    let key = "kindle:request:0123abcd";
    assert!(!query.should_cancel(USER, Some(key)).await);
    assert!(query.mark_cancelled(USER, Some(key)).await);
    assert!(query.should_cancel(USER, Some(key)).await);
    assert!(!query.should_cancel("other@example.com", None).await);
}

#[tokio::test]
async fn checker_reaches_the_store_every_interval() {
    let (_store, service) = service();
    let mut navigate = service.request(
        RequestIdentity::new(USER, "/navigate", "GET").with_params([("action", "next")]),
    );
    assert!(navigate.claim_request().await);

    let query = service.cancellation();
    let mut checker = query.checker(USER, 3).await;
    assert_eq!(checker.request_key(), Some(navigate.request_key()));
    assert!(query.mark_cancelled(USER, None).await);

    let observed: Vec<bool> = {
        let mut observed = Vec::new();
        for _ in 0..6 {
            observed.push(checker.check().await);
        }
        observed
    };
    assert_eq!(observed, vec![false, false, true, false, false, true]);
}

#[tokio::test]
async fn checker_stays_bound_to_its_request() {
    let (_store, service) = service();
    let mut books = service.request(RequestIdentity::new(USER, "/books", "GET"));
    assert!(books.claim_request().await);

    let query = service.cancellation();
    let mut checker = query.checker_for(USER, books.request_key(), 1);

    let mut open = service.request(
        RequestIdentity::new(USER, "/open-book", "GET").with_params([("title", "Dune")]),
    );
    assert!(open.claim_request().await);

    assert!(checker.check().await);
    let mut newer = query.checker(USER, 1).await;
    assert!(!newer.check().await);
}

#[tokio::test]
async fn uncoordinated_checker_never_cancels() {
    let mut checker = CancellationChecker::never();
    for _ in 0..10 {
        assert!(!checker.check().await);
    }
    assert_eq!(checker.request_key(), None);
}

#[tokio::test]
async fn store_outage_reads_as_not_cancelled() {
    let (store, service) = service();
    let query = service.cancellation();
    store.set_offline(true);
    assert!(!query.should_cancel(USER, Some("kindle:request:abc")).await);
    assert!(!query.mark_cancelled(USER, Some("kindle:request:abc")).await);
    assert!(query.active_request_info(USER).await.is_none());
}
