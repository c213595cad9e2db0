// Stock Cards - Core Library
// Joins three exchange feeds into stock cards, caches them in SQLite, and
// falls back to the cache when offline. Used by the CLI, the API server,
// and tests.

pub mod config;
pub mod controller;
pub mod db;
pub mod export;
pub mod join;
pub mod records;
pub mod session;
pub mod sort;
pub mod source;

// Re-export commonly used types
pub use config::Config;
pub use controller::{AggregationController, RefreshOutcome, DEFAULT_FETCH_TIMEOUT};
pub use db::{
    fingerprint, get_all_cards, get_cache_meta, insert_cards, setup_database, verify_count,
    CacheMeta, CacheStore, SqliteCache, StoreError,
};
pub use export::{export_csv, write_cards};
pub use join::{join, join_with_stats, JoinStats};
pub use records::{
    ChangeDirection, DailyTradingRow, EntityIdentifier, IdentifierError, MonthlyAverageRow,
    PriceTrend, RatioSummary, StockCard, ValuationRow,
};
pub use session::{DataOrigin, EmptyReason, Phase, SessionState, SortOrder};
pub use sort::sort_cards;
pub use source::{decode_rows, FetchError, Feed, HttpSource, RemoteSource, StaticSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
