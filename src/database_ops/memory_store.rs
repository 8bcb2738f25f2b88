//! In-memory [`CatalogStore`] with fault injection, used by the test suites
//! and by anyone who wants to exercise a pass without a database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::error::StoreError;
use super::models::{CatalogItem, NewPhotoAsset, PhotoAsset, PhotoSource, PriceLink};
use super::store::{CatalogStore, ItemFilter, PageRequest};

#[derive(Default)]
struct Faults {
    fail_enumeration: bool,
    fail_insert: HashSet<String>,
    fail_update: HashSet<String>,
    // item/link id -> remaining transient failures
    flaky: HashMap<String, u32>,
    delay: Option<Duration>,
    // item/link id -> extra latency on calls touching that row
    slow: HashMap<String, Duration>,
}

#[derive(Default)]
struct State {
    items: BTreeMap<String, CatalogItem>,
    assets: Vec<PhotoAsset>,
    links: BTreeMap<String, PriceLink>,
    faults: Faults,
    inserts: usize,
    updates: usize,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_item(&self, item: CatalogItem) {
        self.lock().items.insert(item.id.clone(), item);
    }

    /// Seeds a photo row directly, bypassing the insert path and its counters.
    pub fn add_asset(&self, asset: PhotoAsset) {
        self.lock().assets.push(asset);
    }

    pub fn add_link(&self, link: PriceLink) {
        self.lock().links.insert(link.id.clone(), link);
    }

    pub fn item(&self, id: &str) -> Option<CatalogItem> {
        self.lock().items.get(id).cloned()
    }

    pub fn assets(&self) -> Vec<PhotoAsset> {
        self.lock().assets.clone()
    }

    pub fn assets_for(&self, item_id: &str) -> Vec<PhotoAsset> {
        self.lock()
            .assets
            .iter()
            .filter(|a| a.item_id == item_id)
            .cloned()
            .collect()
    }

    pub fn link(&self, id: &str) -> Option<PriceLink> {
        self.lock().links.get(id).cloned()
    }

    pub fn insert_count(&self) -> usize {
        self.lock().inserts
    }

    pub fn update_count(&self) -> usize {
        self.lock().updates
    }

    pub fn fail_enumeration(&self) {
        self.lock().faults.fail_enumeration = true;
    }

    pub fn fail_insert_for(&self, item_id: &str) {
        self.lock().faults.fail_insert.insert(item_id.to_string());
    }

    pub fn fail_update_for(&self, link_id: &str) {
        self.lock().faults.fail_update.insert(link_id.to_string());
    }

    /// The next `times` writes touching `id` fail with a retryable error.
    pub fn flaky_for(&self, id: &str, times: u32) {
        self.lock().faults.flaky.insert(id.to_string(), times);
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().faults.delay = Some(delay);
    }

    /// Calls touching `id` sleep this long before answering.
    pub fn delay_for(&self, id: &str, delay: Duration) {
        self.lock().faults.slow.insert(id.to_string(), delay);
    }

    async fn pause(&self) {
        let delay = self.lock().faults.delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }

    async fn pause_for(&self, id: &str) {
        self.pause().await;
        let delay = self.lock().faults.slow.get(id).copied();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }
}

fn take_flaky(state: &mut State, id: &str) -> Result<(), StoreError> {
    if let Some(left) = state.faults.flaky.get_mut(id) {
        if *left > 0 {
            *left -= 1;
            return Err(StoreError::Unavailable(format!("transient failure for {id}")));
        }
    }
    Ok(())
}

fn page_of<T: Clone>(
    rows: &BTreeMap<String, T>,
    page: &PageRequest,
    keep: impl Fn(&T) -> bool,
) -> Vec<T> {
    rows.iter()
        .filter(|(id, _)| page.after.as_deref().map_or(true, |after| id.as_str() > after))
        .map(|(_, row)| row)
        .filter(|row| keep(row))
        .take(page.limit)
        .cloned()
        .collect()
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn list_items(
        &self,
        filter: &ItemFilter,
        page: &PageRequest,
    ) -> Result<Vec<CatalogItem>, StoreError> {
        self.pause().await;
        let state = self.lock();
        if state.faults.fail_enumeration {
            return Err(StoreError::Query("catalog enumeration failed".into()));
        }
        Ok(page_of(&state.items, page, |item| {
            if filter.legacy_image_only && item.legacy_image().is_none() {
                return false;
            }
            match (&filter.category, &item.category) {
                (Some(want), Some(have)) => want.eq_ignore_ascii_case(have),
                (Some(_), None) => false,
                (None, _) => true,
            }
        }))
    }

    async fn list_assets(&self, item_id: &str) -> Result<Vec<PhotoAsset>, StoreError> {
        self.pause_for(item_id).await;
        Ok(self.assets_for(item_id))
    }

    async fn insert_asset(&self, asset: &NewPhotoAsset) -> Result<PhotoAsset, StoreError> {
        self.pause_for(&asset.item_id).await;
        let mut state = self.lock();
        take_flaky(&mut state, &asset.item_id)?;
        if state.faults.fail_insert.contains(&asset.item_id) {
            return Err(StoreError::Query(format!(
                "insert rejected for item {}",
                asset.item_id
            )));
        }
        if asset.source == PhotoSource::LegacyBackfill
            && state.assets.iter().any(|a| {
                a.item_id == asset.item_id
                    && a.url == asset.url
                    && a.source == PhotoSource::LegacyBackfill
            })
        {
            return Err(StoreError::Conflict(format!(
                "legacy-backfill photo already exists for item {}",
                asset.item_id
            )));
        }
        let row = PhotoAsset {
            id: uuid::Uuid::new_v4().to_string(),
            item_id: asset.item_id.clone(),
            url: asset.url.clone(),
            is_primary: asset.is_primary,
            likes_count: asset.likes_count.max(0),
            source: asset.source.clone(),
            created_at: Some(Utc::now()),
        };
        state.assets.push(row.clone());
        state.inserts += 1;
        Ok(row)
    }

    async fn list_links(
        &self,
        retailer: &str,
        page: &PageRequest,
    ) -> Result<Vec<PriceLink>, StoreError> {
        self.pause().await;
        let state = self.lock();
        if state.faults.fail_enumeration {
            return Err(StoreError::Query("price link enumeration failed".into()));
        }
        Ok(page_of(&state.links, page, |link| {
            link.retailer.eq_ignore_ascii_case(retailer)
        }))
    }

    async fn update_link(&self, link: &PriceLink) -> Result<(), StoreError> {
        self.pause_for(&link.id).await;
        let mut state = self.lock();
        take_flaky(&mut state, &link.id)?;
        if state.faults.fail_update.contains(&link.id) {
            return Err(StoreError::Query(format!("update rejected for link {}", link.id)));
        }
        let stored = state
            .links
            .get_mut(&link.id)
            .ok_or_else(|| StoreError::NotFound(format!("price link {}", link.id)))?;
        stored.canonical_url = link.canonical_url.clone();
        stored.needs_review = link.needs_review;
        stored.updated_at = Some(Utc::now());
        state.updates += 1;
        Ok(())
    }

    async fn clear_legacy_image(
        &self,
        item_id: &str,
        expected_url: &str,
    ) -> Result<bool, StoreError> {
        self.pause().await;
        let mut state = self.lock();
        match state.items.get_mut(item_id) {
            Some(item) if item.legacy_image() == Some(expected_url) => {
                item.image_url = None;
                item.updated_at = Some(Utc::now());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("catalog item {item_id}"))),
        }
    }
}
