//! Postgres-backed [`CatalogStore`].
//!
//! Ids are treated as opaque text (`id::text`) so the same queries work for
//! uuid, bigint or text keys. Table names come from the environment and are
//! validated before being spliced into SQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgRow, Postgres};
use sqlx::{PgPool, QueryBuilder, Row};

use super::error::StoreError;
use super::models::{CatalogItem, NewPhotoAsset, PhotoAsset, PhotoSource, PriceLink};
use super::store::{CatalogStore, ItemFilter, PageRequest};
use crate::util::env::env_opt;

const ASSET_COLUMNS: &str = "id::text AS id, item_id::text AS item_id, url, is_primary, \
     likes_count, source, created_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub items: String,
    pub photos: String,
    pub links: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            items: "catalog_items".into(),
            photos: "photo_assets".into(),
            links: "price_links".into(),
        }
    }
}

impl TableNames {
    /// `CATALOG_ITEMS_TABLE`, `PHOTO_ASSETS_TABLE`, `PRICE_LINKS_TABLE`.
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();
        let names = Self {
            items: env_opt("CATALOG_ITEMS_TABLE").unwrap_or(d.items),
            photos: env_opt("PHOTO_ASSETS_TABLE").unwrap_or(d.photos),
            links: env_opt("PRICE_LINKS_TABLE").unwrap_or(d.links),
        };
        for name in [&names.items, &names.photos, &names.links] {
            if !is_sql_identifier(name) {
                anyhow::bail!("invalid table name {name:?}; expected [schema.]table");
            }
        }
        Ok(names)
    }
}

/// Plain or schema-qualified identifier: `photo_assets`, `public.photo_assets`.
pub fn is_sql_identifier(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|p| {
            let mut chars = p.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

#[derive(Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
    tables: TableNames,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool, tables: TableNames) -> Self {
        Self { pool, tables }
    }
}

fn ts(row: &PgRow, col: &str) -> Option<DateTime<Utc>> {
    row.try_get::<Option<DateTime<Utc>>, _>(col).ok().flatten()
}

fn text(row: &PgRow, col: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(col).ok().flatten()
}

fn item_from_row(row: &PgRow) -> Result<CatalogItem, StoreError> {
    Ok(CatalogItem {
        id: row.try_get("id")?,
        brand: text(row, "brand"),
        model: text(row, "model"),
        category: text(row, "category"),
        image_url: text(row, "image_url"),
        created_at: ts(row, "created_at"),
        updated_at: ts(row, "updated_at"),
    })
}

fn asset_from_row(row: &PgRow) -> Result<PhotoAsset, StoreError> {
    Ok(PhotoAsset {
        id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        url: row.try_get("url")?,
        is_primary: row
            .try_get::<Option<bool>, _>("is_primary")?
            .unwrap_or(false),
        likes_count: row
            .try_get::<Option<i32>, _>("likes_count")?
            .unwrap_or(0)
            .max(0),
        source: text(row, "source")
            .map(PhotoSource::from)
            .unwrap_or_else(|| PhotoSource::Other(String::new())),
        created_at: ts(row, "created_at"),
    })
}

fn link_from_row(row: &PgRow) -> Result<PriceLink, StoreError> {
    Ok(PriceLink {
        id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        retailer: text(row, "retailer").unwrap_or_default(),
        raw_url: text(row, "raw_url").unwrap_or_default(),
        canonical_url: text(row, "canonical_url"),
        needs_review: row
            .try_get::<Option<bool>, _>("needs_review")?
            .unwrap_or(false),
        updated_at: ts(row, "updated_at"),
    })
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn list_items(
        &self,
        filter: &ItemFilter,
        page: &PageRequest,
    ) -> Result<Vec<CatalogItem>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT id::text AS id, brand, model, category, image_url, created_at, updated_at \
             FROM {} WHERE TRUE",
            self.tables.items
        ));
        if filter.legacy_image_only {
            qb.push(" AND image_url IS NOT NULL AND btrim(image_url) <> ''");
        }
        if let Some(category) = &filter.category {
            qb.push(" AND lower(category) = lower(")
                .push_bind(category.clone())
                .push(")");
        }
        if let Some(after) = &page.after {
            qb.push(" AND id::text > ").push_bind(after.clone());
        }
        qb.push(" ORDER BY id::text LIMIT ")
            .push_bind(page.limit as i64);

        let rows = qb.build().persistent(false).fetch_all(&self.pool).await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn list_assets(&self, item_id: &str) -> Result<Vec<PhotoAsset>, StoreError> {
        let sql = format!(
            "SELECT {ASSET_COLUMNS} FROM {} WHERE item_id::text = $1 \
             ORDER BY created_at NULLS LAST, id::text",
            self.tables.photos
        );
        let rows = sqlx::query(&sql)
            .persistent(false)
            .bind(item_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(asset_from_row).collect()
    }

    async fn insert_asset(&self, asset: &NewPhotoAsset) -> Result<PhotoAsset, StoreError> {
        // The NOT EXISTS guard keeps the legacy-backfill dedup key even when
        // two runs race past the read-side check.
        let sql = format!(
            "INSERT INTO {photos} (item_id, url, is_primary, likes_count, source) \
             SELECT i.id, $2, $3, $4, $5::text FROM {items} i \
             WHERE i.id::text = $1 \
               AND NOT ($5::text = 'legacy-backfill' AND EXISTS ( \
                   SELECT 1 FROM {photos} p \
                   WHERE p.item_id = i.id AND p.url = $2 AND p.source = 'legacy-backfill')) \
             RETURNING {ASSET_COLUMNS}",
            photos = self.tables.photos,
            items = self.tables.items,
        );
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(&asset.item_id)
            .bind(&asset.url)
            .bind(asset.is_primary)
            .bind(asset.likes_count.max(0))
            .bind(asset.source.as_str())
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            return asset_from_row(&row);
        }

        let exists_sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE id::text = $1)",
            self.tables.items
        );
        let item_exists: bool = sqlx::query_scalar(&exists_sql)
            .persistent(false)
            .bind(&asset.item_id)
            .fetch_one(&self.pool)
            .await?;
        if item_exists {
            Err(StoreError::Conflict(format!(
                "{} photo already exists for item {}",
                asset.source, asset.item_id
            )))
        } else {
            Err(StoreError::NotFound(format!("catalog item {}", asset.item_id)))
        }
    }

    async fn list_links(
        &self,
        retailer: &str,
        page: &PageRequest,
    ) -> Result<Vec<PriceLink>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT id::text AS id, item_id::text AS item_id, retailer, raw_url, canonical_url, \
             needs_review, updated_at FROM {} WHERE lower(retailer) = lower(",
            self.tables.links
        ));
        qb.push_bind(retailer.to_string()).push(")");
        if let Some(after) = &page.after {
            qb.push(" AND id::text > ").push_bind(after.clone());
        }
        qb.push(" ORDER BY id::text LIMIT ")
            .push_bind(page.limit as i64);

        let rows = qb.build().persistent(false).fetch_all(&self.pool).await?;
        rows.iter().map(link_from_row).collect()
    }

    async fn update_link(&self, link: &PriceLink) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET canonical_url = $2, needs_review = $3, updated_at = now() \
             WHERE id::text = $1",
            self.tables.links
        );
        let res = sqlx::query(&sql)
            .persistent(false)
            .bind(&link.id)
            .bind(link.canonical_url.as_deref())
            .bind(link.needs_review)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("price link {}", link.id)));
        }
        Ok(())
    }

    async fn clear_legacy_image(
        &self,
        item_id: &str,
        expected_url: &str,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {} SET image_url = NULL, updated_at = now() \
             WHERE id::text = $1 AND btrim(image_url) = $2",
            self.tables.items
        );
        let res = sqlx::query(&sql)
            .persistent(false)
            .bind(item_id)
            .bind(expected_url)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}
