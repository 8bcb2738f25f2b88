//! Promotes legacy single `image_url` values into the photo repository.
//!
//! An item is migrated at most once: if any photo row exists for it (any
//! source, including community uploads) it is skipped. Otherwise exactly one
//! primary `legacy-backfill` row is inserted. Re-running inserts nothing.

use futures::{stream, StreamExt};
use tracing::{debug, info, instrument};

use super::error::{ReconcileError, StoreError};
use super::models::{CatalogItem, NewPhotoAsset, PhotoAsset};
use super::pass::{call_store, PassKind, PassOptions, PassSummary};
use super::store::{CatalogStore, ItemFilter, PageRequest};

/// Photo a display layer should show for an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayPhoto<'a> {
    Primary(&'a str),
    MostLiked(&'a str),
    Legacy(&'a str),
    None,
}

impl<'a> DisplayPhoto<'a> {
    pub fn url(&self) -> Option<&'a str> {
        match *self {
            DisplayPhoto::Primary(u) | DisplayPhoto::MostLiked(u) | DisplayPhoto::Legacy(u) => {
                Some(u)
            }
            DisplayPhoto::None => None,
        }
    }
}

/// Display precedence: explicit primary, then most liked (oldest first on
/// ties), then the legacy `image_url`.
pub fn resolve_display_photo<'a>(item: &'a CatalogItem, assets: &'a [PhotoAsset]) -> DisplayPhoto<'a> {
    let own = move || assets.iter().filter(move |a| a.item_id == item.id);
    if let Some(p) = own().filter(|a| a.is_primary).min_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    }) {
        return DisplayPhoto::Primary(&p.url);
    }
    if let Some(best) = own().min_by(|a, b| {
        b.likes_count
            .cmp(&a.likes_count)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }) {
        return DisplayPhoto::MostLiked(&best.url);
    }
    match item.legacy_image() {
        Some(u) => DisplayPhoto::Legacy(u),
        None => DisplayPhoto::None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaOptions {
    pub category: Option<String>,
    /// Null the legacy `image_url` once a photo with the same URL exists.
    pub clear_legacy: bool,
}

enum ItemResult {
    Migrated { cleared: bool },
    Skipped { cleared: bool },
    Failed {
        id: String,
        stage: &'static str,
        source: StoreError,
    },
}

pub struct MediaReconciler<'a, S: CatalogStore + ?Sized> {
    store: &'a S,
    opts: PassOptions,
    media: MediaOptions,
}

impl<'a, S: CatalogStore + ?Sized> MediaReconciler<'a, S> {
    pub fn new(store: &'a S, opts: PassOptions) -> Self {
        Self {
            store,
            opts,
            media: MediaOptions::default(),
        }
    }

    pub fn with_media_options(mut self, media: MediaOptions) -> Self {
        self.media = media;
        self
    }

    /// Walks every item carrying a legacy image and makes sure it has at
    /// least one photo row.
    ///
    /// Fails only when the catalog cannot be enumerated.
    #[instrument(skip(self), fields(dry_run = self.opts.dry_run, category = ?self.media.category))]
    pub async fn run(&self) -> Result<PassSummary, ReconcileError> {
        let filter = ItemFilter::with_legacy_image().category(self.media.category.clone());
        let mut summary = PassSummary::new(
            PassKind::MediaBackfill,
            filter.category.clone(),
            self.opts.dry_run,
        );

        let mut page = PageRequest::first(self.opts.page_size);
        while let Some(len) = self.opts.next_page_len(summary.processed) {
            page.limit = len;
            let items = call_store(&self.opts, "list_items", || {
                self.store.list_items(&filter, &page)
            })
            .await
            .map_err(|source| ReconcileError::Enumeration {
                what: "catalog items with a legacy image".into(),
                source,
            })?;
            let Some(last) = items.last() else { break };
            let next = page.next_after(&last.id);
            let fetched = items.len();
            debug!(fetched, after = ?page.after, "catalog page");

            let mut results = stream::iter(items)
                .map(|item| self.process(item))
                .buffer_unordered(self.opts.workers.max(1));
            while let Some(result) = results.next().await {
                match result {
                    ItemResult::Migrated { cleared } => {
                        summary.record_changed();
                        summary.cleared += usize::from(cleared);
                    }
                    ItemResult::Skipped { cleared } => {
                        summary.record_skipped();
                        summary.cleared += usize::from(cleared);
                    }
                    ItemResult::Failed { id, stage, source } => {
                        summary.record_failure(&id, stage, source)
                    }
                }
            }

            if fetched < len {
                break;
            }
            page = next;
        }

        info!(
            processed = summary.processed,
            migrated = summary.changed,
            skipped = summary.skipped,
            cleared = summary.cleared,
            errored = summary.errored,
            "media backfill finished"
        );
        Ok(summary)
    }

    async fn process(&self, item: CatalogItem) -> ItemResult {
        let Some(url) = item.legacy_image() else {
            return ItemResult::Skipped { cleared: false };
        };

        let existing = match call_store(&self.opts, "list_assets", || {
            self.store.list_assets(&item.id)
        })
        .await
        {
            Ok(assets) => assets,
            Err(source) => return self.failed(&item.id, "list_assets", source),
        };

        if !existing.is_empty() {
            debug!(item_id = %item.id, photos = existing.len(), "already has photos; skipping");
            let cleared = if existing.iter().any(|a| a.url.trim() == url) {
                self.clear_legacy(&item.id, url).await
            } else {
                false
            };
            return ItemResult::Skipped { cleared };
        }

        if self.opts.dry_run {
            debug!(item_id = %item.id, url, "dry run: would promote legacy image");
            return ItemResult::Migrated { cleared: false };
        }

        // The photo carries the stored value verbatim; `url` is only trimmed for matching.
        let stored = item.image_url.as_deref().unwrap_or(url);
        let asset = NewPhotoAsset::legacy_primary(&item.id, stored);
        match call_store(&self.opts, "insert_asset", || self.store.insert_asset(&asset)).await {
            Ok(row) => {
                debug!(item_id = %item.id, photo_id = %row.id, "promoted legacy image");
                let cleared = self.clear_legacy(&item.id, url).await;
                ItemResult::Migrated { cleared }
            }
            // Another run promoted this URL between our read and write.
            Err(StoreError::Conflict(msg)) => {
                debug!(item_id = %item.id, %msg, "legacy photo already present");
                ItemResult::Skipped { cleared: false }
            }
            Err(source) => self.failed(&item.id, "insert_asset", source),
        }
    }

    /// Best effort: a failed cleanup is logged, never counted as an item error.
    async fn clear_legacy(&self, item_id: &str, url: &str) -> bool {
        if !self.media.clear_legacy || self.opts.dry_run {
            return false;
        }
        match call_store(&self.opts, "clear_legacy_image", || {
            self.store.clear_legacy_image(item_id, url)
        })
        .await
        {
            Ok(changed) => changed,
            Err(err) => {
                tracing::warn!(item_id, error = %err, "legacy image cleanup failed");
                false
            }
        }
    }

    fn failed(&self, item_id: &str, stage: &'static str, source: StoreError) -> ItemResult {
        ItemResult::Failed {
            id: item_id.to_string(),
            stage,
            source,
        }
    }
}
