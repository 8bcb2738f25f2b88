use futures::{stream, StreamExt};
use tracing::{debug, info, instrument};

use super::error::{ReconcileError, StoreError};
use super::link_canonical::{canonicalize, LinkOutcome, RetailerRules, ReviewReason, RuleSet};
use super::models::PriceLink;
use super::pass::{call_store, PassKind, PassOptions, PassSummary};
use super::store::{CatalogStore, PageRequest};

/// What the pass decided for one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Store `canonical_url = Some(..)`, `needs_review = false`.
    Canonicalize(String),
    /// Store `canonical_url = None`, `needs_review = true`.
    Flag(ReviewReason),
    /// Stored state already matches; nothing to write.
    Unchanged,
    /// Raw URL is unresolvable but a valid canonical is already stored and
    /// not flagged; left as is.
    KeepCanonical,
}

/// Decides the write for a link without touching the store.
pub fn plan_link(link: &PriceLink, rules: &RetailerRules) -> LinkAction {
    match canonicalize(&link.raw_url, rules) {
        LinkOutcome::Canonical(c) => {
            if link.canonical_url.as_deref() == Some(c.as_str()) && !link.needs_review {
                LinkAction::Unchanged
            } else {
                LinkAction::Canonicalize(c)
            }
        }
        LinkOutcome::NeedsReview(reason) => {
            let valid_canonical = link
                .canonical_url
                .as_deref()
                .filter(|c| rules.is_canonical(c));
            if let Some(c) = valid_canonical {
                if link.needs_review {
                    // Contradictory stored state: keep the canonical, drop the flag.
                    LinkAction::Canonicalize(c.to_string())
                } else {
                    LinkAction::KeepCanonical
                }
            } else if link.needs_review && link.canonical_url.is_none() {
                LinkAction::Unchanged
            } else {
                LinkAction::Flag(reason)
            }
        }
    }
}

enum LinkResult {
    Canonicalized,
    Flagged(ReviewReason),
    Skipped,
    Failed {
        id: String,
        source: StoreError,
    },
}

pub struct LinkCanonicalizer<'a, S: CatalogStore + ?Sized> {
    store: &'a S,
    rules: RuleSet,
    opts: PassOptions,
}

impl<'a, S: CatalogStore + ?Sized> LinkCanonicalizer<'a, S> {
    pub fn new(store: &'a S, opts: PassOptions) -> Self {
        Self {
            store,
            rules: RuleSet::builtin(),
            opts,
        }
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    /// Canonicalizes every price link of `retailer`.
    ///
    /// Errors only when the retailer has no rule set or the links cannot be
    /// enumerated; per-link write failures end up in the summary.
    #[instrument(skip(self), fields(dry_run = self.opts.dry_run))]
    pub async fn run(&self, retailer: &str) -> Result<PassSummary, ReconcileError> {
        let rules = self
            .rules
            .get(retailer)
            .ok_or_else(|| ReconcileError::UnknownRetailer(retailer.to_string()))?;
        let mut summary = PassSummary::new(
            PassKind::LinkCanonicalize,
            Some(rules.retailer.clone()),
            self.opts.dry_run,
        );

        let mut page = PageRequest::first(self.opts.page_size);
        while let Some(len) = self.opts.next_page_len(summary.processed) {
            page.limit = len;
            let links = call_store(&self.opts, "list_links", || {
                self.store.list_links(&rules.retailer, &page)
            })
            .await
            .map_err(|source| ReconcileError::Enumeration {
                what: format!("price links for {}", rules.retailer),
                source,
            })?;
            let Some(last) = links.last() else { break };
            let next = page.next_after(&last.id);
            let fetched = links.len();
            debug!(fetched, after = ?page.after, "price link page");

            let mut results = stream::iter(links)
                .map(|link| self.process(link, rules))
                .buffer_unordered(self.opts.workers.max(1));
            while let Some(result) = results.next().await {
                match result {
                    LinkResult::Canonicalized => summary.record_changed(),
                    LinkResult::Flagged(reason) => summary.record_flagged(reason.as_str()),
                    LinkResult::Skipped => summary.record_skipped(),
                    LinkResult::Failed { id, source } => {
                        summary.record_failure(&id, "update_link", source)
                    }
                }
            }

            if fetched < len {
                break;
            }
            page = next;
        }

        info!(
            retailer = %rules.retailer,
            processed = summary.processed,
            canonicalized = summary.changed,
            skipped = summary.skipped,
            flagged = summary.flagged,
            errored = summary.errored,
            "link canonicalization finished"
        );
        Ok(summary)
    }

    async fn process(&self, link: PriceLink, rules: &RetailerRules) -> LinkResult {
        let (updated, result) = match plan_link(&link, rules) {
            LinkAction::Unchanged | LinkAction::KeepCanonical => return LinkResult::Skipped,
            LinkAction::Canonicalize(c) => (
                PriceLink {
                    canonical_url: Some(c),
                    needs_review: false,
                    ..link
                },
                LinkResult::Canonicalized,
            ),
            LinkAction::Flag(reason) => (
                PriceLink {
                    canonical_url: None,
                    needs_review: true,
                    ..link
                },
                LinkResult::Flagged(reason),
            ),
        };
        if self.opts.dry_run {
            debug!(link_id = %updated.id, canonical = ?updated.canonical_url, "dry run: would update link");
            return result;
        }
        match call_store(&self.opts, "update_link", || self.store.update_link(&updated)).await {
            Ok(()) => result,
            Err(source) => LinkResult::Failed {
                id: updated.id,
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(raw: &str) -> PriceLink {
        PriceLink::new("L1", "X", "Amazon", raw)
    }

    #[test]
    fn plans_canonical_write_once() {
        let rules = RetailerRules::amazon();
        let mut l = link("https://www.amazon.com/Name/dp/B07XYZ1234/ref=sr_1_1");
        let LinkAction::Canonicalize(c) = plan_link(&l, &rules) else {
            panic!("expected canonicalize");
        };
        l.canonical_url = Some(c);
        assert_eq!(plan_link(&l, &rules), LinkAction::Unchanged);
    }

    #[test]
    fn clears_stale_review_flag_when_rule_now_matches() {
        let rules = RetailerRules::amazon();
        let mut l = link("https://www.amazon.com/dp/B07XYZ1234");
        l.needs_review = true;
        assert_eq!(
            plan_link(&l, &rules),
            LinkAction::Canonicalize("https://www.amazon.com/dp/B07XYZ1234".into())
        );
    }

    #[test]
    fn never_flips_canonical_back_to_review() {
        let rules = RetailerRules::amazon();
        let mut l = link("https://www.amazon.com/s?k=golf+driver");
        l.canonical_url = Some("https://www.amazon.com/dp/B07XYZ1234".into());
        assert_eq!(plan_link(&l, &rules), LinkAction::KeepCanonical);
    }

    #[test]
    fn stale_review_flag_next_to_valid_canonical_is_cleared() {
        let rules = RetailerRules::amazon();
        let mut l = link("https://www.amazon.com/s?k=golf+driver");
        l.canonical_url = Some("https://www.amazon.com/dp/B07XYZ1234".into());
        l.needs_review = true;
        assert_eq!(
            plan_link(&l, &rules),
            LinkAction::Canonicalize("https://www.amazon.com/dp/B07XYZ1234".into())
        );
    }

    #[test]
    fn invalid_stored_canonical_is_replaced_by_flag() {
        let rules = RetailerRules::amazon();
        let mut l = link("https://www.amazon.com/s?k=golf+driver");
        l.canonical_url = Some("https://www.amazon.com/s?k=golf+driver".into());
        assert_eq!(plan_link(&l, &rules), LinkAction::Flag(ReviewReason::Listing));
    }
}
