use std::time::Duration;

use catalog_reconcile::database_ops::models::PriceLink;
use catalog_reconcile::database_ops::{
    InMemoryStore, LinkCanonicalizer, PassOptions, ReconcileError,
};

fn opts() -> PassOptions {
    PassOptions {
        page_size: 2,
        call_timeout: Duration::from_millis(200),
        backoff: Duration::from_millis(1),
        ..PassOptions::default()
    }
}

fn seeded() -> InMemoryStore {
    let store = InMemoryStore::new();
    for (id, retailer, raw) in [
        (
            "L1",
            "Amazon",
            "https://www.amazon.com/Some-Product/dp/B07XYZ1234/ref=sr_1_1?keywords=x",
        ),
        ("L2", "Amazon", "https://www.amazon.com/s?k=golf+driver"),
        ("L3", "Amazon", "https://example.com/foo"),
        ("L4", "Amazon", "not a url"),
        ("L5", "Amazon", "https://www.amazon.com/gp/product/b000abc123"),
        ("L6", "Walmart", "https://www.walmart.com/ip/123456"),
    ] {
        store.add_link(PriceLink::new(id, "X", retailer, raw));
    }
    store
}

#[tokio::test]
async fn product_link_is_canonicalized() {
    let store = seeded();
    let summary = LinkCanonicalizer::new(&store, opts())
        .run("Amazon")
        .await
        .unwrap();
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.changed, 2);

    let l1 = store.link("L1").unwrap();
    assert_eq!(
        l1.canonical_url.as_deref(),
        Some("https://www.amazon.com/dp/B07XYZ1234")
    );
    assert!(!l1.needs_review);
    assert_eq!(
        store.link("L5").unwrap().canonical_url.as_deref(),
        Some("https://www.amazon.com/dp/B000ABC123")
    );
}

#[tokio::test]
async fn unresolvable_links_are_flagged_with_reasons() {
    let store = seeded();
    let summary = LinkCanonicalizer::new(&store, opts())
        .run("Amazon")
        .await
        .unwrap();
    assert_eq!(summary.flagged, 3);
    assert_eq!(summary.review_reasons.get("listing"), Some(&1));
    assert_eq!(summary.review_reasons.get("foreign-host"), Some(&1));
    assert_eq!(summary.review_reasons.get("unparsable"), Some(&1));

    let search = store.link("L2").unwrap();
    assert_eq!(search.canonical_url, None);
    assert!(search.needs_review);
}

#[tokio::test]
async fn other_retailers_are_left_alone() {
    let store = seeded();
    LinkCanonicalizer::new(&store, opts())
        .run("amazon")
        .await
        .unwrap();
    let walmart = store.link("L6").unwrap();
    assert_eq!(walmart.canonical_url, None);
    assert!(!walmart.needs_review);
}

#[tokio::test]
async fn second_run_writes_nothing() {
    let store = seeded();
    LinkCanonicalizer::new(&store, opts())
        .run("Amazon")
        .await
        .unwrap();
    assert_eq!(store.update_count(), 5);
    let before: Vec<_> = ["L1", "L2", "L3", "L4", "L5"]
        .iter()
        .map(|id| store.link(id).unwrap())
        .collect();

    let again = LinkCanonicalizer::new(&store, opts())
        .run("Amazon")
        .await
        .unwrap();
    assert_eq!(again.changed, 0);
    assert_eq!(again.flagged, 0);
    assert_eq!(again.skipped, 5);
    assert_eq!(store.update_count(), 5);
    let after: Vec<_> = ["L1", "L2", "L3", "L4", "L5"]
        .iter()
        .map(|id| store.link(id).unwrap())
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn stored_canonical_is_never_flipped_to_review() {
    let store = InMemoryStore::new();
    let mut link = PriceLink::new("L1", "X", "Amazon", "https://www.amazon.com/s?k=golf");
    link.canonical_url = Some("https://www.amazon.com/dp/B07XYZ1234".into());
    store.add_link(link);

    let summary = LinkCanonicalizer::new(&store, opts())
        .run("Amazon")
        .await
        .unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(store.update_count(), 0);
    let kept = store.link("L1").unwrap();
    assert_eq!(
        kept.canonical_url.as_deref(),
        Some("https://www.amazon.com/dp/B07XYZ1234")
    );
    assert!(!kept.needs_review);
}

#[tokio::test]
async fn stale_review_flag_on_canonical_link_is_cleared_once() {
    let store = InMemoryStore::new();
    let mut link = PriceLink::new("L1", "X", "Amazon", "https://www.amazon.com/s?k=golf");
    link.canonical_url = Some("https://www.amazon.com/dp/B07XYZ1234".into());
    link.needs_review = true;
    store.add_link(link);

    let summary = LinkCanonicalizer::new(&store, opts())
        .run("Amazon")
        .await
        .unwrap();
    assert_eq!(summary.changed, 1);
    let fixed = store.link("L1").unwrap();
    assert_eq!(
        fixed.canonical_url.as_deref(),
        Some("https://www.amazon.com/dp/B07XYZ1234")
    );
    assert!(!fixed.needs_review);

    let again = LinkCanonicalizer::new(&store, opts())
        .run("Amazon")
        .await
        .unwrap();
    assert_eq!(again.skipped, 1);
    assert_eq!(store.update_count(), 1);
}

#[tokio::test]
async fn failed_update_is_reported_and_pass_continues() {
    let store = seeded();
    store.fail_update_for("L2");

    let summary = LinkCanonicalizer::new(&store, opts())
        .run("Amazon")
        .await
        .unwrap();
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.failures[0].id, "L2");
    assert_eq!(summary.failures[0].stage, "update_link");
    assert_eq!(store.update_count(), 4);
    assert!(!store.link("L2").unwrap().needs_review);
    assert!(store.link("L3").unwrap().needs_review);
}

#[tokio::test]
async fn transient_update_failures_are_retried() {
    let store = seeded();
    store.flaky_for("L1", 2);

    let summary = LinkCanonicalizer::new(&store, opts())
        .run("Amazon")
        .await
        .unwrap();
    assert_eq!(summary.errored, 0);
    assert!(store.link("L1").unwrap().canonical_url.is_some());
}

#[tokio::test]
async fn unknown_retailer_is_fatal() {
    let store = seeded();
    let err = LinkCanonicalizer::new(&store, opts())
        .run("Target")
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, ReconcileError::UnknownRetailer(ref r) if r == "Target"));
    assert_eq!(store.update_count(), 0);
}

#[tokio::test]
async fn enumeration_failure_is_fatal() {
    let store = seeded();
    store.fail_enumeration();
    let err = LinkCanonicalizer::new(&store, opts())
        .run("Amazon")
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Enumeration { .. }));
}

#[tokio::test]
async fn dry_run_reports_without_writing() {
    let store = seeded();
    let opts = PassOptions {
        dry_run: true,
        ..opts()
    };
    let summary = LinkCanonicalizer::new(&store, opts)
        .run("Amazon")
        .await
        .unwrap();
    assert!(summary.dry_run);
    assert_eq!(summary.changed, 2);
    assert_eq!(summary.flagged, 3);
    assert_eq!(store.update_count(), 0);
    assert_eq!(store.link("L1").unwrap().canonical_url, None);
}

#[tokio::test]
async fn outcome_does_not_depend_on_worker_count() {
    let serial = seeded();
    let parallel = seeded();
    LinkCanonicalizer::new(&serial, opts())
        .run("Amazon")
        .await
        .unwrap();
    let wide = PassOptions {
        workers: 4,
        page_size: 3,
        ..opts()
    };
    LinkCanonicalizer::new(&parallel, wide)
        .run("Amazon")
        .await
        .unwrap();
    for id in ["L1", "L2", "L3", "L4", "L5"] {
        let a = serial.link(id).unwrap();
        let b = parallel.link(id).unwrap();
        assert_eq!(a.canonical_url, b.canonical_url, "link {id}");
        assert_eq!(a.needs_review, b.needs_review, "link {id}");
    }
}

#[tokio::test]
async fn walmart_links_use_their_own_rules() {
    let store = seeded();
    let summary = LinkCanonicalizer::new(&store, opts())
        .run("Walmart")
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(
        store.link("L6").unwrap().canonical_url.as_deref(),
        Some("https://www.walmart.com/ip/123456")
    );
}
