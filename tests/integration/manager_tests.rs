//! Scan manager sequencing and the orchestration API

use crate::common::{category_url, product_url, Harness, Reply, ScriptedFetcher, DOMAIN};
use asin_harvest::scan::{
    Budget, OrchestrationError, ScanConfig, ScanDetails, ScanRequest, ScanTarget, SCANS_PER_PAGE,
};
use asin_harvest::state::ScanState;
use asin_harvest::storage::lock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

fn asin_request(asins: &[&str]) -> String {
    let asins: Vec<String> = asins.iter().map(|a| format!("\"{}\"", a)).collect();
    format!(
        r#"
type = "ASIN"
domain = "com"
max-requests = 10
max-concurrent-requests = 1
asins = [{}]
"#,
        asins.join(", ")
    )
}

fn completed_config() -> ScanConfig {
    ScanConfig {
        domain: DOMAIN.to_string(),
        budget: Budget {
            max_requests: 1,
            max_concurrent_requests: 1,
            max_rerequests: 0,
        },
        target: ScanTarget::Asin {
            asins: vec!["B000000001".to_string()],
        },
    }
}

#[tokio::test]
async fn test_second_scan_waits_in_queue() {
    // Scan 1 stalls so it stays active while scan 2 is submitted
    let fetcher = ScriptedFetcher::new(Reply::product(10))
        .script(product_url("B000000001"), vec![Reply::Status(402)]);
    let harness = Harness::new(fetcher);

    let first = harness.enqueue(&asin_request(&["B000000001"])).await;
    harness.wait_for_state(first, ScanState::Stalled).await;

    let second = harness.enqueue(&asin_request(&["B000000002"])).await;
    assert_eq!(harness.state_of(second), ScanState::Enqueued);
    assert_eq!(harness.manager.active_scan_id(), Some(first));

    harness.manager.resume_active_scan().unwrap();
    harness.wait_idle().await;

    assert_eq!(harness.stored(first).record.state, ScanState::Completed);
    let second = harness.stored(second);
    assert_eq!(second.record.state, ScanState::Completed);
    assert_eq!(second.record.counters.products_gathered, 1);
    assert_eq!(harness.manager.active_scan_id(), None);
}

#[tokio::test]
async fn test_repeated_scans_append_history() {
    let fetcher = ScriptedFetcher::new(Reply::product(30))
        .script(product_url("B000000001"), vec![Reply::product(10)]);
    let harness = Harness::new(fetcher);

    let first = harness.enqueue(&asin_request(&["B000000001"])).await;
    harness.wait_idle().await;
    let second = harness.enqueue(&asin_request(&["B000000001"])).await;
    harness.wait_idle().await;

    let product = lock(&harness.store)
        .get_product("B000000001", DOMAIN)
        .unwrap()
        .unwrap();
    assert_eq!(product.scan_id, second);
    assert_eq!(product.data.rank, Some(30));
    assert_eq!(product.history.len(), 2);
    assert_eq!(product.history[0].scan_id, first);
    assert_eq!(product.history[1].scan_id, second);

    let changed: Vec<&str> = product.history[1]
        .changed_fields
        .iter()
        .map(|c| c.field.as_str())
        .collect();
    assert!(changed.contains(&"rank"));
    assert!(changed.contains(&"title"));
}

#[tokio::test]
async fn test_enqueue_while_validating_is_busy() {
    let harness = Harness::new(ScriptedFetcher::new(Reply::product(10)));
    let roots = harness.import(
        r#"
domain = "com"

[[category]]
name = "Books"
node-id = "200"

[[category.children]]
name = "Fiction"
node-id = "201"
"#,
    );
    let request = ScanRequest::from_toml(&format!(
        r#"
type = "Category"
domain = "com"
max-requests = 5
max-concurrent-requests = 1
main-category-id = {}
products-to-gather = 1
strategy = "depth-first-start"
"#,
        roots[0]
    ))
    .unwrap();

    // Hold the store so the first request blocks inside validation
    let held = lock(&harness.store);
    let manager = harness.manager.clone();
    let pending = tokio::spawn(async move { manager.enqueue_scan(request).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let busy = harness
        .manager
        .enqueue_scan(ScanRequest::from_toml(&asin_request(&["B000000001"])).unwrap())
        .await;
    assert!(matches!(busy, Err(OrchestrationError::Busy)));
    assert_eq!(busy.unwrap_err().status_code(), 400);

    drop(held);
    let first = pending.await.unwrap().unwrap();
    harness.wait_idle().await;
    assert_eq!(harness.stored(first).record.state, ScanState::Completed);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let harness = Harness::new(ScriptedFetcher::new(Reply::product(10)));

    let wrong_domain = ScanRequest::from_toml(
        r#"
type = "ASIN"
domain = "de"
max-requests = 5
max-concurrent-requests = 1
asins = ["B000000001"]
"#,
    )
    .unwrap();
    let err = harness.manager.enqueue_scan(wrong_domain).await.unwrap_err();
    assert_eq!(err.status_code(), 400);

    let missing_category = ScanRequest::from_toml(
        r#"
type = "Category"
domain = "com"
max-requests = 5
max-concurrent-requests = 1
main-category-id = 999
products-to-gather = 1
strategy = "breadth-first-end"
"#,
    )
    .unwrap();
    let err = harness
        .manager
        .enqueue_scan(missing_category)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);

    // Nothing was created
    assert_eq!(harness.manager.list_scans(1).unwrap().scans.len(), 0);
}

#[tokio::test]
async fn test_api_errors_carry_status_codes() {
    let fetcher = ScriptedFetcher::new(Reply::product(10))
        .script(product_url("B000000001"), vec![Reply::Status(403)]);
    let harness = Harness::new(fetcher);

    let err = harness.manager.resume_active_scan().unwrap_err();
    assert_eq!(err.status_code(), 404);
    let err = harness.manager.halt_active_scan().unwrap_err();
    assert_eq!(err.status_code(), 404);
    let err = harness.manager.delete_scan(42).unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert_eq!(harness.manager.scan_details(42).unwrap_err().status_code(), 404);

    let id = harness.enqueue(&asin_request(&["B000000001"])).await;
    harness.wait_for_state(id, ScanState::Stalled).await;

    // The active scan cannot be deleted
    let err = harness.manager.delete_scan(id).unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidState(_)));
    assert_eq!(err.status_code(), 400);

    // Halting a stalled scan completes it at once
    harness.manager.halt_active_scan().unwrap();
    harness.wait_idle().await;
    let stored = harness.stored(id);
    assert_eq!(stored.record.state, ScanState::Completed);
    assert_eq!(stored.record.counters.products_gathered, 0);

    harness.manager.delete_scan(id).unwrap();
    assert_eq!(harness.manager.scan_details(id).unwrap_err().status_code(), 404);
}

#[tokio::test]
async fn test_halt_completes_only_after_in_flight_fetch_settles() {
    let gate = Arc::new(Semaphore::new(0));
    let fetcher = ScriptedFetcher::new(Reply::product(10))
        .script(
            category_url("201", 1),
            vec![Reply::listing(&["B000000001", "B000000002"], false)],
        )
        .gate(category_url("201", 1), gate.clone());
    let harness = Harness::new(fetcher);
    let roots = harness.import(
        r#"
domain = "com"

[[category]]
name = "Books"
node-id = "200"

[[category.children]]
name = "Fiction"
node-id = "201"
"#,
    );

    // Three workers, one listing page to fetch: two workers sit idle
    let id = harness
        .enqueue(&format!(
            r#"
type = "Category"
domain = "com"
max-requests = 20
max-concurrent-requests = 3
main-category-id = {}
products-to-gather = 1000
strategy = "breadth-first-start"
"#,
            roots[0]
        ))
        .await;
    harness.wait_for_live(id, |s| s.in_flight == 1).await;

    harness.manager.halt_active_scan().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = harness.live(id);
    assert_eq!(snapshot.state, ScanState::Halting);
    assert_eq!(snapshot.in_flight, 1);

    gate.add_permits(1);
    harness.wait_idle().await;

    let stored = harness.stored(id);
    assert_eq!(stored.record.state, ScanState::Completed);
    assert_eq!(stored.categories.len(), 1);
    assert_eq!(stored.record.counters.sent_requests, 1);

    // Nothing is fetched once halting, the listed products included
    assert_eq!(harness.fetcher.calls(), vec![category_url("201", 1)]);
}

#[tokio::test]
async fn test_live_details_for_active_scan() {
    let fetcher = ScriptedFetcher::new(Reply::product(10))
        .script(product_url("B000000002"), vec![Reply::Status(401)]);
    let harness = Harness::new(fetcher);

    let id = harness
        .enqueue(&asin_request(&["B000000001", "B000000002", "B000000003"]))
        .await;
    harness.wait_for_state(id, ScanState::Stalled).await;

    match harness.manager.scan_details(id).unwrap() {
        ScanDetails::Live(snapshot) => {
            assert_eq!(snapshot.id, id);
            assert_eq!(snapshot.state, ScanState::Stalled);
            assert_eq!(snapshot.counters.products_gathered, 1);
            assert_eq!(snapshot.in_flight, 0);
            assert_eq!(snapshot.requeued, 1);
            assert_eq!(snapshot.backlog, 1);
        }
        ScanDetails::Stored(_) => panic!("active scan should be reported live"),
    }

    let page = harness.manager.list_scans(1).unwrap();
    assert_eq!(page.scans[0].state, ScanState::Stalled);
    assert_eq!(page.scans[0].products_gathered, 1);

    harness.manager.resume_active_scan().unwrap();
    harness.wait_idle().await;
    assert_eq!(harness.stored(id).record.counters.products_gathered, 3);
}

#[tokio::test]
async fn test_list_scans_pages_newest_first() {
    let harness = Harness::new(ScriptedFetcher::new(Reply::product(10)));

    let ids: Vec<i64> = (0..7)
        .map(|_| {
            lock(&harness.store)
                .create_scan(&completed_config(), ScanState::Completed, None)
                .unwrap()
        })
        .collect();

    let first = harness.manager.list_scans(1).unwrap();
    assert_eq!(first.total_pages, 2);
    assert_eq!(first.scans.len(), SCANS_PER_PAGE);
    assert_eq!(first.scans[0].id, ids[6]);

    let second = harness.manager.list_scans(2).unwrap();
    assert_eq!(second.page, 2);
    let second_ids: Vec<i64> = second.scans.iter().map(|s| s.id).collect();
    assert_eq!(second_ids, vec![ids[1], ids[0]]);

    assert!(harness.manager.list_scans(3).unwrap().scans.is_empty());
}

#[tokio::test]
async fn test_recover_completes_interrupted_scans_and_starts_queue() {
    let harness = Harness::new(ScriptedFetcher::new(Reply::product(10)));

    let interrupted = {
        let mut store = lock(&harness.store);
        let id = store
            .create_scan(&completed_config(), ScanState::Enqueued, None)
            .unwrap();
        store.update_scan_state(id, ScanState::Active).unwrap();
        id
    };
    let queued = lock(&harness.store)
        .create_scan(&completed_config(), ScanState::Enqueued, None)
        .unwrap();

    let started = harness.manager.recover().unwrap();
    assert_eq!(started, Some(queued));
    harness.wait_idle().await;

    assert_eq!(harness.stored(interrupted).record.state, ScanState::Completed);
    let queued = harness.stored(queued);
    assert_eq!(queued.record.state, ScanState::Completed);
    assert_eq!(queued.record.counters.products_gathered, 1);
}
