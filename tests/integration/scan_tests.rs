//! End-to-end scan runs against scripted collaborators

use crate::common::{category_url, product_url, Harness, Reply, ScriptedDeals, ScriptedFetcher, DOMAIN};
use asin_harvest::state::{ScanState, SubjectStatus};
use asin_harvest::storage::lock;

const TREE: &str = r#"
domain = "com"

[[category]]
name = "Electronics"
node-id = "100"

[[category.children]]
name = "Audio"
node-id = "101"

[[category.children]]
name = "Cameras"
node-id = "102"

[[category.children]]
name = "Phones"
node-id = "103"
"#;

#[tokio::test]
async fn test_asin_scan_runs_to_completion() {
    let harness = Harness::new(ScriptedFetcher::new(Reply::product(10)));

    let id = harness
        .enqueue(
            r#"
type = "ASIN"
domain = "com"
max-requests = 10
max-concurrent-requests = 2
asins = ["B000000001", "B000000002", "B000000003", "B000000002"]
"#,
        )
        .await;
    harness.wait_idle().await;

    let stored = harness.stored(id);
    assert_eq!(stored.record.state, ScanState::Completed);
    assert_eq!(stored.record.counters.sent_requests, 3);
    assert_eq!(stored.record.counters.products_gathered, 3);
    assert_eq!(stored.record.counters.product_pages.succeeded, 3);
    assert_eq!(stored.products_gathered, 3);
    assert!(stored.record.started_at.is_some());
    assert!(stored.record.completed_at.is_some());
    assert_eq!(harness.fetcher.calls().len(), 3);
}

#[tokio::test]
async fn test_asin_scan_stops_at_request_budget() {
    let harness = Harness::new(ScriptedFetcher::new(Reply::product(10)));

    let id = harness
        .enqueue(
            r#"
type = "ASIN"
domain = "com"
max-requests = 2
max-concurrent-requests = 4
asins = ["B000000001", "B000000002", "B000000003", "B000000004"]
"#,
        )
        .await;
    harness.wait_idle().await;

    let stored = harness.stored(id);
    assert_eq!(stored.record.state, ScanState::Completed);
    assert_eq!(stored.record.counters.sent_requests, 2);
    assert_eq!(stored.record.counters.products_gathered, 2);
    assert_eq!(harness.fetcher.calls().len(), 2);
}

#[tokio::test]
async fn test_asin_scan_settles_every_error_kind() {
    let fetcher = ScriptedFetcher::new(Reply::product(10))
        .script(product_url("B000000002"), vec![Reply::Status(404)])
        .script(
            product_url("B000000003"),
            vec![Reply::Status(503), Reply::Status(503)],
        );
    let harness = Harness::new(fetcher);

    let id = harness
        .enqueue(
            r#"
type = "ASIN"
domain = "com"
max-requests = 10
max-concurrent-requests = 1
max-rerequests = 1
asins = ["B000000001", "B000000002", "B000000003"]
"#,
        )
        .await;
    harness.wait_idle().await;

    let stored = harness.stored(id);
    let status_of = |asin: &str| {
        stored
            .products
            .iter()
            .find(|p| p.asin == asin)
            .map(|p| p.status)
    };
    assert_eq!(status_of("B000000001"), Some(SubjectStatus::Recorded));
    assert_eq!(status_of("B000000002"), Some(SubjectStatus::Absent));
    assert_eq!(status_of("B000000003"), Some(SubjectStatus::Failed));

    // One retry for the server error, then the budget of rerequests is spent
    assert_eq!(harness.fetcher.calls_to(&product_url("B000000003")), 2);
    assert_eq!(stored.record.counters.sent_requests, 4);
    assert_eq!(stored.record.counters.products_gathered, 3);

    let failed = lock(&harness.store)
        .get_product("B000000003", DOMAIN)
        .unwrap()
        .unwrap();
    assert_eq!(failed.history.len(), 1);
    assert_eq!(failed.history[0].sent_requests, 2);
}

#[tokio::test]
async fn test_rate_limits_shrink_concurrency() {
    let fetcher = ScriptedFetcher::new(Reply::product(10)).script(
        product_url("B000000001"),
        vec![Reply::Status(429), Reply::Status(429), Reply::Status(429)],
    );
    let harness = Harness::new(fetcher);

    let id = harness
        .enqueue(
            r#"
type = "ASIN"
domain = "com"
max-requests = 10
max-concurrent-requests = 5
asins = ["B000000001"]
"#,
        )
        .await;
    harness.wait_idle().await;

    let stored = harness.stored(id);
    assert_eq!(stored.record.state, ScanState::Completed);
    assert_eq!(stored.record.config.budget.max_concurrent_requests, 2);
    assert_eq!(stored.record.counters.sent_requests, 4);
    assert_eq!(stored.products[0].status, SubjectStatus::Recorded);
}

#[tokio::test]
async fn test_category_scan_stalls_and_resumes() {
    let fetcher = ScriptedFetcher::new(Reply::product(10))
        .script(category_url("101", 1), vec![Reply::listing(&["B00000000A"], true)])
        .script(category_url("102", 1), vec![Reply::listing(&["B00000000B"], true)])
        .script(category_url("103", 1), vec![Reply::listing(&["B00000000C"], true)])
        .script(
            product_url("B00000000B"),
            vec![Reply::Status(401), Reply::product(20)],
        );
    let harness = Harness::new(fetcher);
    let roots = harness.import(TREE);

    let id = harness
        .enqueue(&format!(
            r#"
type = "Category"
domain = "com"
max-requests = 50
max-concurrent-requests = 1
main-category-id = {}
products-to-gather = 1000
strategy = "breadth-first-start"
"#,
            roots[0]
        ))
        .await;

    harness.wait_for_state(id, ScanState::Stalled).await;
    assert_eq!(harness.manager.active_scan_id(), Some(id));
    assert_eq!(
        lock(&harness.store).get_scan(id).unwrap().state,
        ScanState::Stalled
    );

    // The rejected fetch is not a terminal record
    let before = lock(&harness.store).get_product("B00000000B", DOMAIN).unwrap();
    assert!(before.is_none());

    harness.manager.resume_active_scan().unwrap();
    harness.wait_idle().await;

    let stored = harness.stored(id);
    assert_eq!(stored.record.state, ScanState::Completed);
    assert_eq!(stored.record.counters.products_gathered, 3);
    assert_eq!(stored.products_gathered, 3);
    assert_eq!(stored.categories.len(), 3);
    assert_eq!(harness.fetcher.calls_to(&product_url("B00000000B")), 2);

    let resumed = lock(&harness.store)
        .get_product("B00000000B", DOMAIN)
        .unwrap()
        .unwrap();
    assert_eq!(resumed.data.rank, Some(20));
    assert_eq!(resumed.history.len(), 1);
}

#[tokio::test]
async fn test_category_stall_drains_in_flight_pages_and_serves_failed_page_first() {
    let fetcher = ScriptedFetcher::new(Reply::product(10))
        .script(
            category_url("101", 1),
            vec![Reply::Status(401), Reply::listing(&["B00000000A"], true)],
        )
        .script(category_url("102", 1), vec![Reply::listing(&["B00000000B"], true)])
        .script(category_url("103", 1), vec![Reply::listing(&["B00000000C"], true)]);
    let harness = Harness::new(fetcher);
    let roots = harness.import(TREE);

    let id = harness
        .enqueue(&format!(
            r#"
type = "Category"
domain = "com"
max-requests = 50
max-concurrent-requests = 3
main-category-id = {}
products-to-gather = 1000
strategy = "breadth-first-start"
"#,
            roots[0]
        ))
        .await;
    harness.wait_for_state(id, ScanState::Stalled).await;

    // The two pages in flight next to the rejected one were settled
    let snapshot = harness.live(id);
    assert_eq!(snapshot.in_flight, 0);
    assert_eq!(snapshot.requeued, 1);
    assert_eq!(snapshot.counters.category_pages.sent, 3);
    assert_eq!(snapshot.counters.category_pages.succeeded, 2);
    let stalled_at = harness.fetcher.calls().len();
    assert_eq!(stalled_at, 3);

    harness.manager.resume_active_scan().unwrap();
    harness.wait_idle().await;

    let calls = harness.fetcher.calls();
    assert_eq!(calls[stalled_at], category_url("101", 1));

    let stored = harness.stored(id);
    assert_eq!(stored.record.state, ScanState::Completed);
    assert_eq!(stored.record.counters.products_gathered, 3);
    assert_eq!(stored.categories.len(), 3);
    assert_eq!(harness.fetcher.calls_to(&category_url("101", 1)), 2);
}

#[tokio::test]
async fn test_pages_skip_lists_shallow_pages_of_every_category_first() {
    let nodes = ["101", "102", "103"];
    let mut fetcher = ScriptedFetcher::new(Reply::product(10));
    for node in nodes {
        for page in 1..=3u32 {
            let asin = format!("B0000{}0{}", node, page);
            fetcher = fetcher.script(
                category_url(node, page),
                vec![Reply::listing(&[asin.as_str()], page == 3)],
            );
        }
    }
    let harness = Harness::new(fetcher);
    let roots = harness.import(TREE);

    let id = harness
        .enqueue(&format!(
            r#"
type = "Category"
domain = "com"
max-requests = 100
max-concurrent-requests = 1
main-category-id = {}
products-to-gather = 1000
strategy = "breadth-first-start"
use-pages-skip = true
pages-skip = 2
"#,
            roots[0]
        ))
        .await;
    harness.wait_idle().await;

    let stored = harness.stored(id);
    assert_eq!(stored.record.state, ScanState::Completed);
    assert_eq!(stored.record.counters.products_gathered, 9);

    let listing_urls: Vec<(String, u32)> = nodes
        .iter()
        .flat_map(|node| (1..=3u32).map(move |page| (category_url(node, page), page)))
        .collect();
    let pages: Vec<u32> = harness
        .fetcher
        .calls()
        .iter()
        .filter_map(|call| {
            listing_urls
                .iter()
                .find(|(url, _)| url == call)
                .map(|(_, page)| *page)
        })
        .collect();
    assert_eq!(pages, vec![1, 2, 1, 2, 1, 2, 3, 3, 3]);

    let deep: Vec<String> = harness
        .fetcher
        .calls()
        .into_iter()
        .filter(|call| nodes.iter().any(|node| *call == category_url(node, 3)))
        .collect();
    assert_eq!(
        deep,
        vec![
            category_url("101", 3),
            category_url("102", 3),
            category_url("103", 3)
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_asin_scans_fetch_every_subject_on_multi_thread_runtime() {
    let asins: Vec<String> = (1..=8).map(|i| format!("\"B00000000{}\"", i)).collect();
    let request = format!(
        r#"
type = "ASIN"
domain = "com"
max-requests = 100
max-concurrent-requests = 4
asins = [{}]
"#,
        asins.join(", ")
    );
    let harness = Harness::new(ScriptedFetcher::new(Reply::product(10)));

    for _ in 0..50 {
        let id = harness.enqueue(&request).await;
        harness.wait_idle().await;

        let stored = harness.stored(id);
        assert_eq!(stored.record.state, ScanState::Completed);
        assert_eq!(stored.record.counters.products_gathered, 8, "scan {}", id);
        assert_eq!(stored.record.counters.sent_requests, 8, "scan {}", id);
    }
    assert_eq!(harness.fetcher.calls().len(), 50 * 8);
}

#[tokio::test]
async fn test_resume_never_grows_a_throttled_pool() {
    let fetcher = ScriptedFetcher::new(Reply::product(10)).script(
        product_url("B000000001"),
        vec![
            Reply::Status(429),
            Reply::Status(429),
            Reply::Status(429),
            Reply::Status(402),
        ],
    );
    let harness = Harness::new(fetcher);

    let id = harness
        .enqueue(
            r#"
type = "ASIN"
domain = "com"
max-requests = 10
max-concurrent-requests = 5
asins = ["B000000001"]
"#,
        )
        .await;
    harness.wait_for_state(id, ScanState::Stalled).await;
    assert_eq!(harness.live(id).budget.max_concurrent_requests, 2);

    // The provider now allows more than the throttled pool
    harness.fetcher.set_hint(8);
    harness.manager.resume_active_scan().unwrap();
    harness.wait_idle().await;

    let stored = harness.stored(id);
    assert_eq!(stored.record.state, ScanState::Completed);
    assert_eq!(stored.record.config.budget.max_concurrent_requests, 2);
    assert_eq!(stored.products[0].status, SubjectStatus::Recorded);
}

#[tokio::test]
async fn test_category_scan_counts_only_in_range_products() {
    let fetcher = ScriptedFetcher::new(Reply::product(10))
        .script(
            category_url("101", 1),
            vec![Reply::listing(&["B000000001", "B000000002"], true)],
        )
        .script(product_url("B000000002"), vec![Reply::product(500)])
        .script(category_url("102", 1), vec![Reply::listing(&[], false)])
        .script(category_url("103", 1), vec![Reply::Status(404)]);
    let harness = Harness::new(fetcher);
    let roots = harness.import(TREE);

    let id = harness
        .enqueue(&format!(
            r#"
type = "Category"
domain = "com"
max-requests = 50
max-concurrent-requests = 2
main-category-id = {}
products-to-gather = 10
max-rank = 100
strategy = "breadth-first-start"
"#,
            roots[0]
        ))
        .await;
    harness.wait_idle().await;

    let stored = harness.stored(id);
    assert_eq!(stored.record.state, ScanState::Completed);
    assert_eq!(stored.record.counters.products_gathered, 1);
    assert_eq!(stored.products_gathered, 1);

    let out_of_range = stored
        .products
        .iter()
        .find(|p| p.asin == "B000000002")
        .unwrap();
    assert_eq!(out_of_range.status, SubjectStatus::Recorded);
    assert_eq!(out_of_range.rank, Some(500));

    // An empty page ends its category, a missing one is recorded absent
    assert_eq!(harness.fetcher.calls_to(&category_url("102", 2)), 0);
    let absent = stored
        .categories
        .iter()
        .find(|c| c.node_id == "103")
        .unwrap();
    assert_eq!(absent.status, SubjectStatus::Absent);
}

#[tokio::test]
async fn test_category_scan_stops_listing_once_target_is_predicted() {
    let page: Vec<String> = (0..30).map(|i| format!("B0000000{:02}", i)).collect();
    let page: Vec<&str> = page.iter().map(String::as_str).collect();
    let fetcher = ScriptedFetcher::new(Reply::product(10))
        .script(category_url("101", 1), vec![Reply::listing(&page, false)]);
    let harness = Harness::new(fetcher);
    let roots = harness.import(TREE);

    let id = harness
        .enqueue(&format!(
            r#"
type = "Category"
domain = "com"
max-requests = 100
max-concurrent-requests = 3
main-category-id = {}
products-to-gather = 5
strategy = "breadth-first-start"
"#,
            roots[0]
        ))
        .await;
    harness.wait_idle().await;

    let stored = harness.stored(id);
    assert_eq!(stored.record.counters.products_gathered, 5);
    assert_eq!(stored.record.counters.category_pages.sent, 1);
    assert!(stored.record.counters.sent_requests <= 1 + 5 + 3);
}

#[tokio::test]
async fn test_deals_scan_drains_discovered_asins() {
    let deals = ScriptedDeals::default()
        .page(1, &[("B000000001", Some("10% off")), ("B000000002", None)])
        .page(2, &[("B000000002", None), ("not-an-asin", None), ("B000000003", None)]);
    let harness = Harness::with_deals(ScriptedFetcher::new(Reply::product(10)), deals);

    let id = harness
        .enqueue(
            r#"
type = "Deals"
domain = "com"
max-requests = 20
max-concurrent-requests = 2
products-to-gather = 10
"#,
        )
        .await;
    harness.wait_idle().await;

    let stored = harness.stored(id);
    assert_eq!(stored.record.state, ScanState::Completed);
    assert_eq!(stored.record.counters.products_gathered, 3);
    assert_eq!(stored.products.len(), 3);
    assert_eq!(harness.fetcher.calls().len(), 3);

    let discounted = lock(&harness.store)
        .get_product("B000000001", DOMAIN)
        .unwrap()
        .unwrap();
    assert_eq!(discounted.data.discount_coupon.as_deref(), Some("10% off"));
}

#[tokio::test]
async fn test_deals_scan_stops_discovery_at_target() {
    let deals = ScriptedDeals::default().page(
        1,
        &[
            ("B000000001", None),
            ("B000000002", None),
            ("B000000003", None),
        ],
    );
    let harness = Harness::with_deals(ScriptedFetcher::new(Reply::product(10)), deals);

    let id = harness
        .enqueue(
            r#"
type = "Deals"
domain = "com"
max-requests = 20
max-concurrent-requests = 2
products-to-gather = 2
"#,
        )
        .await;
    harness.wait_idle().await;

    let stored = harness.stored(id);
    assert_eq!(stored.record.counters.products_gathered, 2);
    assert_eq!(stored.products_gathered, 2);
    assert_eq!(harness.fetcher.calls().len(), 2);
}

#[tokio::test]
async fn test_deals_discovery_retries_rate_limited_page() {
    let deals = ScriptedDeals::default()
        .page(1, &[("B000000001", None), ("B000000002", None)])
        .fail(1, 429, 3);
    let harness = Harness::with_deals(ScriptedFetcher::new(Reply::product(10)), deals);

    let id = harness
        .enqueue(
            r#"
type = "Deals"
domain = "com"
max-requests = 20
max-concurrent-requests = 4
products-to-gather = 10
"#,
        )
        .await;
    harness.wait_idle().await;

    // Three rate limits neither skip page 1 nor count as empty batches
    assert_eq!(harness.deals.requested(), vec![1, 1, 1, 1, 2, 3, 4]);

    let stored = harness.stored(id);
    assert_eq!(stored.record.state, ScanState::Completed);
    assert_eq!(stored.record.counters.products_gathered, 2);
    assert_eq!(stored.record.config.budget.max_concurrent_requests, 1);
}
