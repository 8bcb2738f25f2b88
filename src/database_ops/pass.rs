//! Shared plumbing for the batch passes: options, per-call timeout with
//! retry, and the run summary printed at the end.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::error::{ReconcileError, StoreError};
use crate::util::env::{env_flag, env_parse, env_parse_opt};

/// Failures kept verbatim in a summary; counts stay exact past this.
pub const MAX_RECORDED_FAILURES: usize = 200;

#[derive(Debug, Clone)]
pub struct PassOptions {
    pub page_size: usize,
    /// Items processed concurrently; 1 keeps the pass strictly sequential.
    pub workers: usize,
    pub call_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    /// Stop after this many rows have been processed.
    pub limit: Option<usize>,
    pub dry_run: bool,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            page_size: 500,
            workers: 1,
            call_timeout: Duration::from_secs(15),
            max_retries: 3,
            backoff: Duration::from_millis(300),
            limit: None,
            dry_run: false,
        }
    }
}

impl PassOptions {
    /// Reads `RECONCILE_*` overrides on top of the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            page_size: env_parse("RECONCILE_PAGE_SIZE", d.page_size).max(1),
            workers: env_parse("RECONCILE_WORKERS", d.workers).max(1),
            call_timeout: Duration::from_millis(env_parse(
                "RECONCILE_TIMEOUT_MS",
                d.call_timeout.as_millis() as u64,
            )),
            max_retries: env_parse("RECONCILE_MAX_RETRIES", d.max_retries),
            backoff: Duration::from_millis(env_parse(
                "RECONCILE_BACKOFF_MS",
                d.backoff.as_millis() as u64,
            )),
            limit: env_parse_opt("RECONCILE_LIMIT"),
            dry_run: env_flag("RECONCILE_DRY_RUN", d.dry_run),
        }
    }

    /// Page size for the next fetch given how many rows are already done.
    pub(crate) fn next_page_len(&self, processed: usize) -> Option<usize> {
        match self.limit {
            Some(limit) if processed >= limit => None,
            Some(limit) => Some(self.page_size.min(limit - processed)),
            None => Some(self.page_size),
        }
    }
}

/// Runs one store call under `call_timeout`, retrying timeouts and transport
/// failures with linear backoff.
pub async fn call_store<T, F, Fut>(
    opts: &PassOptions,
    op: &'static str,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let result = match tokio::time::timeout(opts.call_timeout, call()).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::Timeout {
                op,
                after: opts.call_timeout,
            }),
        };
        match result {
            Ok(v) => return Ok(v),
            Err(err) if err.is_retryable() && attempt < opts.max_retries => {
                attempt += 1;
                let wait = opts.backoff * attempt;
                debug!(op, attempt, wait_ms = wait.as_millis() as u64, error = %err, "retrying store call");
                tokio::time::sleep(wait).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassKind {
    MediaBackfill,
    LinkCanonicalize,
}

impl PassKind {
    pub fn label(&self) -> &'static str {
        match self {
            PassKind::MediaBackfill => "media backfill",
            PassKind::LinkCanonicalize => "link canonicalize",
        }
    }

    fn changed_label(&self) -> &'static str {
        match self {
            PassKind::MediaBackfill => "migrated",
            PassKind::LinkCanonicalize => "canonicalized",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub id: String,
    pub stage: &'static str,
    pub message: String,
}

/// End-of-run report. Every processed row lands in exactly one of
/// `changed`, `skipped`, `flagged` or `errored`.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub pass: PassKind,
    pub scope: Option<String>,
    pub dry_run: bool,
    pub processed: usize,
    /// Migrated photos or canonicalized links.
    pub changed: usize,
    pub skipped: usize,
    pub flagged: usize,
    pub errored: usize,
    /// Legacy `image_url` values nulled by the cleanup option.
    pub cleared: usize,
    pub review_reasons: BTreeMap<String, usize>,
    pub failures: Vec<RowFailure>,
}

impl PassSummary {
    pub fn new(pass: PassKind, scope: Option<String>, dry_run: bool) -> Self {
        Self {
            pass,
            scope,
            dry_run,
            processed: 0,
            changed: 0,
            skipped: 0,
            flagged: 0,
            errored: 0,
            cleared: 0,
            review_reasons: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    pub fn record_changed(&mut self) {
        self.processed += 1;
        self.changed += 1;
    }

    pub fn record_skipped(&mut self) {
        self.processed += 1;
        self.skipped += 1;
    }

    pub fn record_flagged(&mut self, reason: &str) {
        self.processed += 1;
        self.flagged += 1;
        *self.review_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    /// A row whose write (or read) failed; the pass keeps going.
    pub fn record_failure(&mut self, id: &str, stage: &'static str, source: StoreError) {
        self.processed += 1;
        self.errored += 1;
        let err = ReconcileError::Persistence {
            id: id.to_string(),
            stage,
            source,
        };
        warn!(pass = self.pass.label(), error = %err, "row failed; continuing");
        if self.failures.len() < MAX_RECORDED_FAILURES {
            self.failures.push(RowFailure {
                id: id.to_string(),
                stage,
                message: err.to_string(),
            });
        }
    }

    pub fn has_errors(&self) -> bool {
        self.errored > 0
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pass.label())?;
        if let Some(scope) = &self.scope {
            write!(f, " [{scope}]")?;
        }
        if self.dry_run {
            write!(f, " (dry run)")?;
        }
        write!(
            f,
            ": processed={} {}={} skipped={} flagged={} errored={}",
            self.processed,
            self.pass.changed_label(),
            self.changed,
            self.skipped,
            self.flagged,
            self.errored
        )?;
        if self.cleared > 0 {
            write!(f, " cleared={}", self.cleared)?;
        }
        for (reason, count) in &self.review_reasons {
            write!(f, "\n  review/{reason}: {count}")?;
        }
        for failure in &self.failures {
            write!(f, "\n  error {} [{}]: {}", failure.id, failure.stage, failure.message)?;
        }
        if self.errored > self.failures.len() {
            write!(f, "\n  … {} more errors not shown", self.errored - self.failures.len())?;
        }
        Ok(())
    }
}
