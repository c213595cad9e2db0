use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use stock_cards::{
    export_csv, sort_cards, AggregationController, CacheStore, Config, HttpSource,
    RefreshOutcome, SortOrder, SqliteCache, StockCard,
};

#[derive(Parser)]
#[command(name = "stock-cards")]
#[command(about = "Joins exchange feeds into stock cards with an offline SQLite cache", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one refresh cycle (remote, or cache with --offline)
    Refresh {
        #[arg(long, default_value_t = false)]
        offline: bool,
    },
    /// Print the cached cards
    Show {
        #[arg(long, value_enum)]
        sort: Option<SortArg>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print when the cache was last replaced
    Status,
    /// Write the cached cards to a CSV file
    Export { path: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Asc,
    Desc,
}

impl From<SortArg> for SortOrder {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Asc => SortOrder::Ascending,
            SortArg::Desc => SortOrder::Descending,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stock_cards=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let cache = Arc::new(
        SqliteCache::open(&config.db_path)
            .with_context(|| format!("Failed to open cache {}", config.db_path.display()))?,
    );

    match cli.command {
        Command::Refresh { offline } => run_refresh(&config, cache, offline).await,
        Command::Show { sort, limit } => run_show(cache.as_ref(), sort, limit),
        Command::Status => run_status(cache.as_ref()),
        Command::Export { path } => run_export(cache.as_ref(), &path),
    }
}

async fn run_refresh(config: &Config, cache: Arc<SqliteCache>, offline: bool) -> Result<()> {
    let source = Arc::new(HttpSource::new(&config.base_url, config.fetch_timeout)?);
    let controller =
        AggregationController::new(source, cache).with_fetch_timeout(config.fetch_timeout);

    match controller.refresh(!offline).await {
        RefreshOutcome::Published { origin, count } => {
            println!("✓ Published {} cards ({:?})", count, origin);
        }
        RefreshOutcome::Empty(reason) => {
            println!("✗ No data available ({:?})", reason);
        }
    }

    Ok(())
}

fn run_show(cache: &dyn CacheStore, sort: Option<SortArg>, limit: Option<usize>) -> Result<()> {
    let mut cards = cache.read_all()?;
    if cards.is_empty() {
        println!("Cache is empty. Run: stock-cards refresh");
        return Ok(());
    }

    if let Some(order) = sort {
        sort_cards(&mut cards, order.into());
    }

    let shown = limit.unwrap_or(cards.len()).min(cards.len());
    for card in &cards[..shown] {
        print_card(card);
    }
    println!("\n{} of {} cards", shown, cards.len());

    Ok(())
}

fn print_card(card: &StockCard) {
    let ratios = card.ratio_summary();
    println!(
        "{:<8} {:<12} open {:>10} close {:>10} avg {:>10} chg {:>8} ({:?}, {:?})  PE {} / DY {} / PB {}",
        card.code,
        card.name,
        card.opening_price,
        card.closing_price,
        card.monthly_average_price,
        card.change,
        card.change_direction(),
        card.price_trend(),
        ratios.pe_ratio,
        ratios.dividend_yield,
        ratios.pb_ratio,
    );
}

fn run_status(cache: &dyn CacheStore) -> Result<()> {
    match cache.metadata()? {
        Some(meta) => {
            println!("Last refresh: {}", meta.refreshed_at.to_rfc3339());
            println!("Cards:        {}", meta.record_count);
            println!("Fingerprint:  {}", meta.fingerprint);
        }
        None => println!("Cache has never been written"),
    }
    Ok(())
}

fn run_export(cache: &dyn CacheStore, path: &std::path::Path) -> Result<()> {
    let cards = cache.read_all()?;
    let written = export_csv(path, &cards)?;
    println!("✓ Exported {} cards to {}", written, path.display());
    Ok(())
}
