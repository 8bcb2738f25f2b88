use anyhow::{bail, Context, Result};
use catalog_reconcile::database_ops::{
    LinkCanonicalizer, MediaOptions, MediaReconciler, PassOptions, PassSummary, PgCatalogStore,
    RuleSet, TableNames,
};
use catalog_reconcile::util::db::Db;
use catalog_reconcile::util::env;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "reconcile",
    version,
    about = "Backfill legacy catalog photos and canonicalize retailer price links"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Promote legacy item image_url values into primary photo rows
    Media {
        #[command(flatten)]
        pass: PassArgs,
        #[command(flatten)]
        media: MediaArgs,
    },
    /// Rewrite a retailer's price links to canonical product URLs
    Links {
        #[command(flatten)]
        pass: PassArgs,
        /// Retailer whose links are canonicalized
        #[arg(long, default_value = "Amazon")]
        retailer: String,
    },
    /// Run the media backfill, then link canonicalization
    All {
        #[command(flatten)]
        pass: PassArgs,
        #[command(flatten)]
        media: MediaArgs,
        /// Retailer whose links are canonicalized
        #[arg(long, default_value = "Amazon")]
        retailer: String,
    },
    /// List retailers with built-in canonicalization rules
    Retailers,
}

#[derive(Args, Debug)]
struct PassArgs {
    /// Optional override for the database URL
    #[arg(long)]
    db_url: Option<String>,
    /// Only report what would change; no writes
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Stop after this many rows
    #[arg(long)]
    limit: Option<usize>,
    /// Rows processed concurrently (default: env RECONCILE_WORKERS or 1)
    #[arg(long)]
    workers: Option<usize>,
    /// Rows fetched per page (default: env RECONCILE_PAGE_SIZE or 500)
    #[arg(long)]
    page_size: Option<usize>,
    /// Per store call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Print the summary as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct MediaArgs {
    /// Only items in this category
    #[arg(long)]
    category: Option<String>,
    /// Null the legacy image_url once a photo with the same URL exists
    #[arg(long, default_value_t = false)]
    clear_legacy: bool,
}

impl PassArgs {
    fn options(&self) -> PassOptions {
        let mut opts = PassOptions::from_env();
        if self.dry_run {
            opts.dry_run = true;
        }
        if let Some(limit) = self.limit {
            opts.limit = Some(limit);
        }
        if let Some(workers) = self.workers {
            opts.workers = workers.max(1);
        }
        if let Some(page_size) = self.page_size {
            opts.page_size = page_size.max(1);
        }
        if let Some(ms) = self.timeout_ms {
            opts.call_timeout = Duration::from_millis(ms);
        }
        opts
    }
}

impl From<MediaArgs> for MediaOptions {
    fn from(args: MediaArgs) -> Self {
        MediaOptions {
            category: args.category,
            clear_legacy: args.clear_legacy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    catalog_reconcile::tracing::init_tracing("info,sqlx=warn")?;
    env::bootstrap_cli("reconcile");

    let cli = Cli::parse();
    match cli.command {
        Commands::Media { pass, media } => {
            let opts = pass.options();
            let store = open_store(pass.db_url.clone(), opts.workers).await?;
            let summary = MediaReconciler::new(&store, opts)
                .with_media_options(media.into())
                .run()
                .await
                .context("media backfill aborted")?;
            report(&summary, pass.json)?;
        }
        Commands::Links { pass, retailer } => {
            let opts = pass.options();
            ensure_known_retailer(&retailer)?;
            let store = open_store(pass.db_url.clone(), opts.workers).await?;
            let summary = LinkCanonicalizer::new(&store, opts)
                .run(&retailer)
                .await
                .context("link canonicalization aborted")?;
            report(&summary, pass.json)?;
        }
        Commands::All {
            pass,
            media,
            retailer,
        } => {
            let opts = pass.options();
            ensure_known_retailer(&retailer)?;
            let store = open_store(pass.db_url.clone(), opts.workers).await?;
            let media_summary = MediaReconciler::new(&store, opts.clone())
                .with_media_options(media.into())
                .run()
                .await
                .context("media backfill aborted")?;
            report(&media_summary, pass.json)?;
            let link_summary = LinkCanonicalizer::new(&store, opts)
                .run(&retailer)
                .await
                .context("link canonicalization aborted")?;
            report(&link_summary, pass.json)?;
        }
        Commands::Retailers => {
            for name in RuleSet::builtin().names() {
                println!("{name}");
            }
        }
    }
    Ok(())
}

fn ensure_known_retailer(retailer: &str) -> Result<()> {
    let rules = RuleSet::builtin();
    if rules.get(retailer).is_none() {
        let known: Vec<&str> = rules.names().collect();
        bail!("no canonicalization rules for retailer {retailer:?}; known: {known:?}");
    }
    Ok(())
}

fn resolve_database_url(db_url: Option<String>) -> Result<String> {
    if let Some(url) = db_url {
        let trimmed = url.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    env::db_url().context("resolve_database_url: missing database URL")
}

async fn open_store(db_url: Option<String>, workers: usize) -> Result<PgCatalogStore> {
    let database_url = resolve_database_url(db_url)?;
    env::preflight_check(
        "reconcile",
        &[],
        &[
            "CATALOG_ITEMS_TABLE",
            "PHOTO_ASSETS_TABLE",
            "PRICE_LINKS_TABLE",
            "RECONCILE_WORKERS",
            "RECONCILE_PAGE_SIZE",
            "RECONCILE_TIMEOUT_MS",
        ],
    )?;
    let tables = TableNames::from_env()?;
    let max_conns = env::env_parse("DB_MAX_CONNS", 5u32).max(workers as u32);
    info!(url = %env::redact_dsn(&database_url), max_conns, ?tables, "connecting");
    let db = Db::connect(&database_url, max_conns)
        .await
        .context("Db::connect failed")?;
    Ok(PgCatalogStore::new(db.pool, tables))
}

/// Per-row errors are part of the report, not a failed exit.
fn report(summary: &PassSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(summary)?);
    } else {
        println!("{summary}");
    }
    if summary.has_errors() {
        info!(
            pass = summary.pass.label(),
            errored = summary.errored,
            "pass finished with row errors; re-run to retry them"
        );
    }
    Ok(())
}
