//! Retailer link canonicalization.
//!
//! A retailer is described by data: the domains it serves, the shape of its
//! product identifier, the path shapes of its search/listing pages, an ordered
//! list of extraction rules and a canonical template. [`canonicalize`] is pure:
//! the same raw URL and rule set always give the same [`LinkOutcome`], and a
//! canonical URL canonicalizes to itself.

use std::fmt;

use regex::Regex;
use serde::Serialize;
use url::Url;

/// A domain served by the retailer and the host its canonical links use.
/// `domain` matches itself and any subdomain.
#[derive(Debug, Clone)]
pub struct RetailerDomain {
    pub domain: String,
    pub canonical_host: String,
}

impl RetailerDomain {
    pub fn new(domain: &str, canonical_host: &str) -> Self {
        Self {
            domain: domain.to_ascii_lowercase(),
            canonical_host: canonical_host.to_ascii_lowercase(),
        }
    }

    fn matches(&self, host: &str) -> bool {
        host == self.domain
            || host
                .strip_suffix(self.domain.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    }
}

/// Shape a product identifier must have to be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdShape {
    /// Exactly `len` ASCII alphanumerics, normalized to upper case (ASIN).
    Alnum { len: usize },
    /// Between `min` and `max` ASCII digits.
    Digits { min: usize, max: usize },
}

impl IdShape {
    /// Normalized identifier if `raw` fits the shape.
    pub fn accept(&self, raw: &str) -> Option<String> {
        match *self {
            IdShape::Alnum { len } => (raw.len() == len
                && raw.bytes().all(|b| b.is_ascii_alphanumeric()))
            .then(|| raw.to_ascii_uppercase()),
            IdShape::Digits { min, max } => ((min..=max).contains(&raw.len())
                && raw.bytes().all(|b| b.is_ascii_digit()))
            .then(|| raw.to_string()),
        }
    }
}

/// One way of pulling the product identifier out of a URL.
#[derive(Debug, Clone)]
pub enum ExtractRule {
    /// The identifier is one of the `span` path segments following `marker`.
    /// The last one that fits the id shape wins, so a numeric slug ahead of
    /// the id is never taken for it.
    PathMarker { marker: Vec<String>, span: usize },
    /// The identifier is the value of a query parameter (name compared
    /// case-insensitively).
    QueryParam { name: String },
    /// First capture group of a regex run against the URL path.
    PathPattern(Regex),
}

impl ExtractRule {
    pub fn marker(segments: &[&str]) -> Self {
        Self::marker_span(segments, 1)
    }

    pub fn marker_span(segments: &[&str], span: usize) -> Self {
        ExtractRule::PathMarker {
            marker: segments.iter().map(|s| s.to_ascii_lowercase()).collect(),
            span: span.max(1),
        }
    }

    pub fn query(name: &str) -> Self {
        ExtractRule::QueryParam {
            name: name.to_string(),
        }
    }

    fn extract(&self, url: &Url, segments: &[&str], shape: IdShape) -> Option<String> {
        match self {
            ExtractRule::PathMarker { marker, span } => {
                if marker.is_empty() || segments.len() <= marker.len() {
                    return None;
                }
                (0..=segments.len() - marker.len() - 1)
                    .filter(|&start| {
                        marker
                            .iter()
                            .zip(&segments[start..])
                            .all(|(m, s)| s.eq_ignore_ascii_case(m))
                    })
                    .find_map(|start| {
                        let after = start + marker.len();
                        segments[after..]
                            .iter()
                            .take(*span)
                            .filter_map(|seg| shape.accept(seg))
                            .last()
                    })
            }
            ExtractRule::QueryParam { name } => url
                .query_pairs()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .and_then(|(_, v)| shape.accept(v.trim())),
            ExtractRule::PathPattern(re) => re
                .captures(url.path())
                .and_then(|caps| caps.get(1))
                .and_then(|m| shape.accept(m.as_str())),
        }
    }
}

/// Recognizable search/listing pages, which carry no single product.
#[derive(Debug, Clone)]
pub enum ListingShape {
    /// Path starts with these segments; checked before any extraction.
    PathPrefix(Vec<String>),
    /// Query carries this key; only consulted when no rule matched.
    SearchQuery(String),
}

impl ListingShape {
    pub fn prefix(segments: &[&str]) -> Self {
        ListingShape::PathPrefix(segments.iter().map(|s| s.to_ascii_lowercase()).collect())
    }

    pub fn query(key: &str) -> Self {
        ListingShape::SearchQuery(key.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RetailerRules {
    pub retailer: String,
    pub domains: Vec<RetailerDomain>,
    /// Canonical path with a `{id}` placeholder, e.g. `/dp/{id}`.
    pub template: String,
    pub id_shape: IdShape,
    pub listing: Vec<ListingShape>,
    pub rules: Vec<ExtractRule>,
}

impl RetailerRules {
    /// Amazon storefronts. `/dp/` is tried first, the `asin=` query fallback last.
    pub fn amazon() -> Self {
        let mut domains = vec![RetailerDomain::new("amazon.com", "www.amazon.com")];
        for tld in ["co.uk", "ca", "de", "fr", "it", "es", "co.jp", "com.au", "in", "com.mx"] {
            let domain = format!("amazon.{tld}");
            let host = format!("www.{domain}");
            domains.push(RetailerDomain::new(&domain, &host));
        }
        Self {
            retailer: "Amazon".into(),
            domains,
            template: "/dp/{id}".into(),
            id_shape: IdShape::Alnum { len: 10 },
            listing: vec![
                ListingShape::prefix(&["s"]),
                ListingShape::prefix(&["b"]),
                ListingShape::prefix(&["stores"]),
                ListingShape::prefix(&["gp", "search"]),
                ListingShape::prefix(&["gp", "browse.html"]),
                ListingShape::prefix(&["gp", "bestsellers"]),
                ListingShape::prefix(&["gp", "new-releases"]),
                ListingShape::prefix(&["deals"]),
                ListingShape::query("k"),
                ListingShape::query("field-keywords"),
            ],
            rules: vec![
                ExtractRule::marker(&["dp"]),
                ExtractRule::marker(&["gp", "product"]),
                ExtractRule::marker(&["gp", "aw", "d"]),
                ExtractRule::marker(&["exec", "obidos", "asin"]),
                ExtractRule::marker(&["o", "asin"]),
                ExtractRule::query("asin"),
            ],
        }
    }

    /// Walmart: `/ip/{slug}/{id}` or `/ip/{id}`.
    pub fn walmart() -> Self {
        Self {
            retailer: "Walmart".into(),
            domains: vec![RetailerDomain::new("walmart.com", "www.walmart.com")],
            template: "/ip/{id}".into(),
            id_shape: IdShape::Digits { min: 6, max: 12 },
            listing: vec![
                ListingShape::prefix(&["search"]),
                ListingShape::prefix(&["browse"]),
                ListingShape::prefix(&["cp"]),
                ListingShape::query("q"),
            ],
            rules: vec![ExtractRule::marker_span(&["ip"], 2)],
        }
    }

    pub fn is_retailer(&self, name: &str) -> bool {
        self.retailer.eq_ignore_ascii_case(name.trim())
    }

    fn domain_for(&self, host: &str) -> Option<&RetailerDomain> {
        self.domains.iter().find(|d| d.matches(host))
    }

    fn render(&self, canonical_host: &str, id: &str) -> String {
        format!("https://{canonical_host}{}", self.template.replace("{id}", id))
    }

    /// Whether `url` is exactly a canonical link this rule set produces.
    pub fn is_canonical(&self, url: &str) -> bool {
        matches!(canonicalize(url, self), LinkOutcome::Canonical(c) if c == url)
    }
}

/// Registry of retailer rule sets, looked up by case-insensitive name.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    retailers: Vec<RetailerRules>,
}

impl RuleSet {
    pub fn builtin() -> Self {
        Self {
            retailers: vec![RetailerRules::amazon(), RetailerRules::walmart()],
        }
    }

    /// Adds or replaces the rules for `rules.retailer`.
    pub fn with(mut self, rules: RetailerRules) -> Self {
        self.retailers.retain(|r| !r.is_retailer(&rules.retailer));
        self.retailers.push(rules);
        self
    }

    pub fn get(&self, retailer: &str) -> Option<&RetailerRules> {
        self.retailers.iter().find(|r| r.is_retailer(retailer))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.retailers.iter().map(|r| r.retailer.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewReason {
    Unparsable,
    ForeignHost,
    Listing,
    NoProductId,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewReason::Unparsable => "unparsable",
            ReviewReason::ForeignHost => "foreign-host",
            ReviewReason::Listing => "listing",
            ReviewReason::NoProductId => "no-product-id",
        }
    }
}

impl fmt::Display for ReviewReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Canonical(String),
    NeedsReview(ReviewReason),
}

pub fn canonicalize(raw_url: &str, rules: &RetailerRules) -> LinkOutcome {
    let url = match Url::parse(raw_url.trim()) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => u,
        _ => return LinkOutcome::NeedsReview(ReviewReason::Unparsable),
    };
    let host = match url.host_str() {
        Some(h) => h.trim_end_matches('.').to_ascii_lowercase(),
        None => return LinkOutcome::NeedsReview(ReviewReason::Unparsable),
    };
    let Some(domain) = rules.domain_for(&host) else {
        return LinkOutcome::NeedsReview(ReviewReason::ForeignHost);
    };

    let segments: Vec<&str> = url
        .path_segments()
        .map(|segs| segs.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let listing_path = rules.listing.iter().any(|shape| match shape {
        ListingShape::PathPrefix(prefix) => {
            segments.len() >= prefix.len()
                && prefix
                    .iter()
                    .zip(&segments)
                    .all(|(p, s)| s.eq_ignore_ascii_case(p))
        }
        ListingShape::SearchQuery(_) => false,
    });
    if listing_path {
        return LinkOutcome::NeedsReview(ReviewReason::Listing);
    }

    if let Some(id) = rules
        .rules
        .iter()
        .find_map(|rule| rule.extract(&url, &segments, rules.id_shape))
    {
        return LinkOutcome::Canonical(rules.render(&domain.canonical_host, &id));
    }

    let search_query = rules.listing.iter().any(|shape| match shape {
        ListingShape::SearchQuery(key) => url.query_pairs().any(|(k, _)| k == key.as_str()),
        ListingShape::PathPrefix(_) => false,
    });
    if search_query {
        LinkOutcome::NeedsReview(ReviewReason::Listing)
    } else {
        LinkOutcome::NeedsReview(ReviewReason::NoProductId)
    }
}
