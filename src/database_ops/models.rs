//! Row types shared by the store implementations and the reconciliation passes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Catalog row as seen by the reconcilers. Only `image_url` is ever written
/// back (nulled by the optional legacy cleanup).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CatalogItem {
    pub fn new(id: impl Into<String>, image_url: Option<&str>) -> Self {
        Self {
            id: id.into(),
            brand: None,
            model: None,
            category: None,
            image_url: image_url.map(str::to_string),
            created_at: None,
            updated_at: None,
        }
    }

    /// Legacy image reference, trimmed; blank values count as absent.
    pub fn legacy_image(&self) -> Option<&str> {
        self.image_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

/// Where a photo row came from. Stored as a plain text column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PhotoSource {
    LegacyBackfill,
    Community,
    Other(String),
}

impl PhotoSource {
    pub fn as_str(&self) -> &str {
        match self {
            PhotoSource::LegacyBackfill => "legacy-backfill",
            PhotoSource::Community => "community",
            PhotoSource::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for PhotoSource {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "legacy-backfill" | "legacy_backfill" => PhotoSource::LegacyBackfill,
            "community" => PhotoSource::Community,
            _ => PhotoSource::Other(raw.trim().to_string()),
        }
    }
}

impl From<String> for PhotoSource {
    fn from(raw: String) -> Self {
        PhotoSource::from(raw.as_str())
    }
}

impl From<PhotoSource> for String {
    fn from(source: PhotoSource) -> Self {
        source.as_str().to_string()
    }
}

impl fmt::Display for PhotoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoAsset {
    pub id: String,
    pub item_id: String,
    pub url: String,
    pub is_primary: bool,
    pub likes_count: i32,
    pub source: PhotoSource,
    pub created_at: Option<DateTime<Utc>>,
}

/// Insert payload for [`PhotoAsset`]; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewPhotoAsset {
    pub item_id: String,
    pub url: String,
    pub is_primary: bool,
    pub likes_count: i32,
    pub source: PhotoSource,
}

impl NewPhotoAsset {
    /// The single primary row promoted from an item's legacy `image_url`.
    pub fn legacy_primary(item_id: &str, url: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            url: url.to_string(),
            is_primary: true,
            likes_count: 0,
            source: PhotoSource::LegacyBackfill,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLink {
    pub id: String,
    pub item_id: String,
    pub retailer: String,
    pub raw_url: String,
    pub canonical_url: Option<String>,
    pub needs_review: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PriceLink {
    pub fn new(id: impl Into<String>, item_id: impl Into<String>, retailer: &str, raw_url: &str) -> Self {
        Self {
            id: id.into(),
            item_id: item_id.into(),
            retailer: retailer.to_string(),
            raw_url: raw_url.to_string(),
            canonical_url: None,
            needs_review: false,
            updated_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn photo_source_round_trips_through_text() {
        assert_eq!(PhotoSource::from("legacy-backfill"), PhotoSource::LegacyBackfill);
        assert_eq!(PhotoSource::from("Community"), PhotoSource::Community);
        assert_eq!(
            PhotoSource::from("retailer-feed"),
            PhotoSource::Other("retailer-feed".into())
        );
        assert_eq!(String::from(PhotoSource::LegacyBackfill), "legacy-backfill");
    }

    #[test]
    fn blank_legacy_image_counts_as_absent() {
        assert_eq!(CatalogItem::new("a", Some("  ")).legacy_image(), None);
        assert_eq!(CatalogItem::new("a", None).legacy_image(), None);
        assert_eq!(
            CatalogItem::new("a", Some(" https://img/a.jpg ")).legacy_image(),
            Some("https://img/a.jpg")
        );
    }

    #[test]
    fn photo_source_serializes_as_string() {
        let json = serde_json::to_string(&PhotoSource::LegacyBackfill).unwrap();
        assert_eq!(json, "\"legacy-backfill\"");
    }
}
