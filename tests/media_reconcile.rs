use std::time::Duration;

use catalog_reconcile::database_ops::models::{CatalogItem, PhotoAsset, PhotoSource};
use catalog_reconcile::database_ops::{
    resolve_display_photo, InMemoryStore, MediaOptions, MediaReconciler, PassOptions,
    ReconcileError, StoreError,
};

fn opts() -> PassOptions {
    PassOptions {
        page_size: 2,
        call_timeout: Duration::from_millis(200),
        backoff: Duration::from_millis(1),
        ..PassOptions::default()
    }
}

fn community_photo(item_id: &str, url: &str) -> PhotoAsset {
    PhotoAsset {
        id: format!("c-{item_id}"),
        item_id: item_id.into(),
        url: url.into(),
        is_primary: false,
        likes_count: 12,
        source: PhotoSource::Community,
        created_at: None,
    }
}

fn seeded() -> InMemoryStore {
    let store = InMemoryStore::new();
    store.add_item(CatalogItem::new("A", Some("https://img/a.jpg")));
    store.add_item(CatalogItem::new("B", Some("https://img/b.jpg")));
    store.add_item(CatalogItem::new("C", None));
    store.add_item(CatalogItem::new("D", Some("https://img/d.jpg")));
    store.add_item(CatalogItem::new("E", Some("https://img/e.jpg")));
    store.add_asset(community_photo("D", "https://img/d-user.jpg"));
    store
}

#[tokio::test]
async fn promotes_legacy_image_to_single_primary_photo() {
    let store = InMemoryStore::new();
    store.add_item(CatalogItem::new("X", Some("https://img/a.jpg")));

    let summary = MediaReconciler::new(&store, opts()).run().await.unwrap();
    assert_eq!(summary.changed, 1);

    let photos = store.assets_for("X");
    assert_eq!(photos.len(), 1);
    let photo = &photos[0];
    assert_eq!(photo.item_id, "X");
    assert_eq!(photo.url, "https://img/a.jpg");
    assert!(photo.is_primary);
    assert_eq!(photo.likes_count, 0);
    assert_eq!(photo.source, PhotoSource::LegacyBackfill);

    let item = store.item("X").unwrap();
    assert_eq!(
        resolve_display_photo(&item, &photos).url(),
        Some("https://img/a.jpg")
    );
}

#[tokio::test]
async fn second_run_inserts_nothing() {
    let store = seeded();

    let first = MediaReconciler::new(&store, opts()).run().await.unwrap();
    assert_eq!(first.processed, 4);
    assert_eq!(first.changed, 3);
    assert_eq!(first.skipped, 1);
    let after_first = store.assets();

    let second = MediaReconciler::new(&store, opts()).run().await.unwrap();
    assert_eq!(second.changed, 0);
    assert_eq!(second.skipped, 4);
    assert_eq!(store.insert_count(), 3);
    assert_eq!(store.assets(), after_first);
}

#[tokio::test]
async fn at_most_one_backfill_row_per_item_across_runs() {
    let store = seeded();
    for _ in 0..3 {
        MediaReconciler::new(&store, opts()).run().await.unwrap();
    }
    for id in ["A", "B", "C", "D", "E"] {
        let backfilled = store
            .assets_for(id)
            .iter()
            .filter(|a| a.source == PhotoSource::LegacyBackfill)
            .count();
        assert!(backfilled <= 1, "item {id} has {backfilled} backfill rows");
    }
}

#[tokio::test]
async fn community_photo_preempts_backfill() {
    let store = seeded();
    MediaReconciler::new(&store, opts()).run().await.unwrap();

    let photos = store.assets_for("D");
    assert_eq!(photos.len(), 1);
    assert_eq!(photos[0].source, PhotoSource::Community);
    assert!(!photos[0].is_primary);
}

#[tokio::test]
async fn failed_insert_is_reported_and_siblings_continue() {
    let store = seeded();
    store.fail_insert_for("B");

    let summary = MediaReconciler::new(&store, opts()).run().await.unwrap();
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.changed, 2);
    assert_eq!(summary.failures[0].id, "B");
    assert_eq!(summary.failures[0].stage, "insert_asset");
    assert!(store.assets_for("B").is_empty());
    assert_eq!(store.assets_for("E").len(), 1);
}

#[tokio::test]
async fn enumeration_failure_is_fatal() {
    let store = seeded();
    store.fail_enumeration();

    let err = MediaReconciler::new(&store, opts()).run().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, ReconcileError::Enumeration { .. }));
    assert_eq!(store.insert_count(), 0);
}

#[tokio::test]
async fn transient_insert_failures_are_retried() {
    let store = seeded();
    store.flaky_for("A", 2);

    let summary = MediaReconciler::new(&store, opts()).run().await.unwrap();
    assert_eq!(summary.errored, 0);
    assert_eq!(store.assets_for("A").len(), 1);
}

#[tokio::test]
async fn enumeration_timeout_is_fatal() {
    let store = InMemoryStore::new();
    store.add_item(CatalogItem::new("A", Some("https://img/a.jpg")));
    store.set_delay(Duration::from_millis(50));
    let opts = PassOptions {
        call_timeout: Duration::from_millis(5),
        max_retries: 1,
        ..opts()
    };

    let err = MediaReconciler::new(&store, opts).run().await.unwrap_err();
    match err {
        ReconcileError::Enumeration { source, .. } => {
            assert!(matches!(source, StoreError::Timeout { op: "list_items", .. }))
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn timed_out_item_is_reported_and_siblings_continue() {
    let store = InMemoryStore::new();
    store.add_item(CatalogItem::new("A", Some("https://img/a.jpg")));
    store.add_item(CatalogItem::new("B", Some("https://img/b.jpg")));
    store.add_item(CatalogItem::new("C", Some("https://img/c.jpg")));
    store.delay_for("B", Duration::from_millis(200));
    let opts = PassOptions {
        call_timeout: Duration::from_millis(20),
        max_retries: 1,
        ..opts()
    };

    let summary = MediaReconciler::new(&store, opts).run().await.unwrap();
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.changed, 2);
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.failures[0].id, "B");
    assert_eq!(summary.failures[0].stage, "list_assets");
    assert!(summary.failures[0].message.contains("timed out"));
    assert!(store.assets_for("B").is_empty());
    assert_eq!(store.assets_for("A").len(), 1);
    assert_eq!(store.assets_for("C").len(), 1);
}

#[tokio::test]
async fn stored_image_url_is_copied_verbatim() {
    let store = InMemoryStore::new();
    store.add_item(CatalogItem::new("A", Some(" https://img/a.jpg ")));
    let media = MediaOptions {
        category: None,
        clear_legacy: true,
    };

    let summary = MediaReconciler::new(&store, opts())
        .with_media_options(media)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.changed, 1);
    assert_eq!(summary.cleared, 1);
    assert_eq!(store.assets_for("A")[0].url, " https://img/a.jpg ");
}

#[tokio::test]
async fn dry_run_counts_without_writing() {
    let store = seeded();
    let opts = PassOptions {
        dry_run: true,
        ..opts()
    };

    let summary = MediaReconciler::new(&store, opts).run().await.unwrap();
    assert!(summary.dry_run);
    assert_eq!(summary.changed, 3);
    assert_eq!(store.insert_count(), 0);
}

#[tokio::test]
async fn limit_stops_the_pass_early() {
    let store = seeded();
    let opts = PassOptions {
        limit: Some(3),
        ..opts()
    };

    let summary = MediaReconciler::new(&store, opts).run().await.unwrap();
    assert_eq!(summary.processed, 3);
    assert!(store.assets_for("E").is_empty());
}

#[tokio::test]
async fn category_scope_filters_items() {
    let store = InMemoryStore::new();
    let mut driver = CatalogItem::new("A", Some("https://img/a.jpg"));
    driver.category = Some("Drivers".into());
    let mut putter = CatalogItem::new("B", Some("https://img/b.jpg"));
    putter.category = Some("Putters".into());
    store.add_item(driver);
    store.add_item(putter);

    let summary = MediaReconciler::new(&store, opts())
        .with_media_options(MediaOptions {
            category: Some("drivers".into()),
            clear_legacy: false,
        })
        .run()
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(store.assets_for("A").len(), 1);
    assert!(store.assets_for("B").is_empty());
}

#[tokio::test]
async fn clear_legacy_nulls_only_matching_urls() {
    let store = seeded();
    let media = MediaOptions {
        category: None,
        clear_legacy: true,
    };

    let summary = MediaReconciler::new(&store, opts())
        .with_media_options(media)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.cleared, 3);
    assert_eq!(store.item("A").unwrap().image_url, None);
    // D's only photo is a different community upload; keep the legacy value.
    assert_eq!(
        store.item("D").unwrap().image_url.as_deref(),
        Some("https://img/d.jpg")
    );

    let again = MediaReconciler::new(&store, opts()).run().await.unwrap();
    assert_eq!(again.processed, 1);
    assert_eq!(again.changed, 0);
}

#[tokio::test]
async fn concurrent_workers_keep_the_invariants() {
    let store = InMemoryStore::new();
    for i in 0..40 {
        store.add_item(CatalogItem::new(
            format!("item-{i:02}"),
            Some(format!("https://img/{i}.jpg").as_str()),
        ));
    }
    let opts = PassOptions {
        workers: 8,
        page_size: 7,
        ..opts()
    };

    let summary = MediaReconciler::new(&store, opts.clone()).run().await.unwrap();
    assert_eq!(summary.changed, 40);
    let rerun = MediaReconciler::new(&store, opts).run().await.unwrap();
    assert_eq!(rerun.changed, 0);
    assert_eq!(store.assets().len(), 40);
}
