//! Catalog reconciliation: store access plus the media and price-link passes.

pub mod error;
pub mod link_canonical;
pub mod link_reconcile;
pub mod media_reconcile;
pub mod memory_store;
pub mod models;
pub mod pass;
pub mod pg_store;
pub mod store;

pub use error::{ReconcileError, StoreError};
pub use link_canonical::{canonicalize, LinkOutcome, RetailerRules, ReviewReason, RuleSet};
pub use link_reconcile::LinkCanonicalizer;
pub use media_reconcile::{resolve_display_photo, DisplayPhoto, MediaOptions, MediaReconciler};
pub use memory_store::InMemoryStore;
pub use pass::{PassOptions, PassSummary};
pub use pg_store::{PgCatalogStore, TableNames};
pub use store::CatalogStore;
