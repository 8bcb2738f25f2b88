//! Narrow store seam used by both reconcilers.
//!
//! Everything the passes need from the catalog goes through [`CatalogStore`]:
//! paged enumeration, per-item photo reads, one insert, one link update and
//! the conditional legacy cleanup. `pg_store` talks to Postgres, `memory_store`
//! backs the tests.

use async_trait::async_trait;

use super::error::StoreError;
use super::models::{CatalogItem, NewPhotoAsset, PhotoAsset, PriceLink};

/// Which catalog rows to enumerate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    /// Only rows whose legacy `image_url` is set (and not blank).
    pub legacy_image_only: bool,
    /// Optional case-insensitive category scope.
    pub category: Option<String>,
}

impl ItemFilter {
    pub fn with_legacy_image() -> Self {
        Self {
            legacy_image_only: true,
            category: None,
        }
    }

    pub fn category(mut self, category: Option<String>) -> Self {
        self.category = category.filter(|c| !c.trim().is_empty());
        self
    }
}

/// Keyset page: rows with `id > after`, ordered by id, at most `limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub after: Option<String>,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }

    pub fn next_after(&self, last_id: &str) -> Self {
        Self {
            after: Some(last_id.to_string()),
            limit: self.limit,
        }
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_items(
        &self,
        filter: &ItemFilter,
        page: &PageRequest,
    ) -> Result<Vec<CatalogItem>, StoreError>;

    async fn list_assets(&self, item_id: &str) -> Result<Vec<PhotoAsset>, StoreError>;

    /// Inserts one photo row. A second `legacy-backfill` row with the same
    /// `(item_id, url)` is rejected with [`StoreError::Conflict`].
    async fn insert_asset(&self, asset: &NewPhotoAsset) -> Result<PhotoAsset, StoreError>;

    async fn list_links(
        &self,
        retailer: &str,
        page: &PageRequest,
    ) -> Result<Vec<PriceLink>, StoreError>;

    /// Persists `canonical_url` and `needs_review` for `link.id`.
    async fn update_link(&self, link: &PriceLink) -> Result<(), StoreError>;

    /// Nulls the legacy `image_url` of an item, but only while it still equals
    /// `expected_url`. Returns whether a row changed.
    async fn clear_legacy_image(&self, item_id: &str, expected_url: &str)
        -> Result<bool, StoreError>;
}
