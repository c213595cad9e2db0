// 🗄️ Local Cache Store - Last good set of stock cards in SQLite
//
// The table is replaced wholesale after every successful fetch-and-join,
// inside one transaction, so readers see either the old set or the new
// one, never a mix.

use crate::records::{EntityIdentifier, StockCard};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cache connection lock poisoned")]
    Poisoned,

    #[error("corrupt cache row: {0}")]
    Corrupt(String),
}

/// Summary of the last full replace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheMeta {
    pub refreshed_at: DateTime<Utc>,
    pub record_count: usize,
    pub fingerprint: String,
}

/// Durable copy of the last published card set.
pub trait CacheStore: Send + Sync {
    /// All cached cards, in the order they were written.
    fn read_all(&self) -> Result<Vec<StockCard>, StoreError>;

    /// Replace the whole table with `cards` (not a merge).
    fn replace_all(&self, cards: &[StockCard]) -> Result<(), StoreError>;

    fn metadata(&self) -> Result<Option<CacheMeta>, StoreError>;
}

/// SHA-256 over the ordered card set.
pub fn fingerprint(cards: &[StockCard]) -> String {
    let mut hasher = Sha256::new();
    for card in cards {
        for field in card_fields(card) {
            hasher.update(field.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"\x1e");
    }
    format!("{:x}", hasher.finalize())
}

fn card_fields(card: &StockCard) -> [&str; 14] {
    [
        card.code.as_str(),
        &card.name,
        &card.opening_price,
        &card.closing_price,
        &card.highest_price,
        &card.lowest_price,
        &card.change,
        &card.trade_volume,
        &card.transaction,
        &card.trade_value,
        &card.pe_ratio,
        &card.dividend_yield,
        &card.pb_ratio,
        &card.monthly_average_price,
    ]
}

/// Bumped whenever the table layout changes. v2: `position` is the key,
/// so repeated codes keep one row per card.
pub const SCHEMA_VERSION: i32 = 2;

pub fn setup_database(conn: &Connection) -> Result<(), StoreError> {
    // WAL for crash recovery (in-memory databases report "memory" and keep going)
    conn.pragma_update(None, "journal_mode", "WAL")?;

    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current_version < SCHEMA_VERSION {
        // Only cached data lives here; the next online refresh fills it again.
        conn.execute_batch(
            "DROP TABLE IF EXISTS stock_card;
             DROP TABLE IF EXISTS cache_meta;",
        )?;
        debug!(from = current_version, to = SCHEMA_VERSION, "rebuilt cache schema");
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS stock_card (
            position INTEGER PRIMARY KEY NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            opening_price TEXT NOT NULL,
            closing_price TEXT NOT NULL,
            highest_price TEXT NOT NULL,
            lowest_price TEXT NOT NULL,
            change TEXT NOT NULL,
            trade_volume TEXT NOT NULL,
            \"transaction\" TEXT NOT NULL,
            trade_value TEXT NOT NULL,
            pe_ratio TEXT NOT NULL,
            dividend_yield TEXT NOT NULL,
            pb_ratio TEXT NOT NULL,
            monthly_average_price TEXT NOT NULL
        )",
        [],
    )?;

    // Single row, rewritten together with stock_card
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cache_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            refreshed_at TEXT NOT NULL,
            record_count INTEGER NOT NULL,
            fingerprint TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stock_card_code ON stock_card(code)",
        [],
    )?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

    Ok(())
}

pub fn insert_cards(conn: &Connection, cards: &[StockCard]) -> Result<usize, StoreError> {
    // One row per card: a code repeated by the join is stored as often as it was published.
    let mut stmt = conn.prepare(
        "INSERT INTO stock_card (
            code, position, name, opening_price, closing_price, highest_price,
            lowest_price, change, trade_volume, \"transaction\", trade_value,
            pe_ratio, dividend_yield, pb_ratio, monthly_average_price
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
    )?;

    for (position, card) in cards.iter().enumerate() {
        stmt.execute(params![
            card.code.as_str(),
            position as i64,
            card.name,
            card.opening_price,
            card.closing_price,
            card.highest_price,
            card.lowest_price,
            card.change,
            card.trade_volume,
            card.transaction,
            card.trade_value,
            card.pe_ratio,
            card.dividend_yield,
            card.pb_ratio,
            card.monthly_average_price,
        ])?;
    }

    Ok(cards.len())
}

pub fn get_all_cards(conn: &Connection) -> Result<Vec<StockCard>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT code, name, opening_price, closing_price, highest_price,
                lowest_price, change, trade_volume, \"transaction\", trade_value,
                pe_ratio, dividend_yield, pb_ratio, monthly_average_price
         FROM stock_card
         ORDER BY position ASC",
    )?;

    let rows = stmt
        .query_map([], |row| {
            let code: String = row.get(0)?;
            Ok((
                code,
                StockCardColumns {
                    name: row.get(1)?,
                    opening_price: row.get(2)?,
                    closing_price: row.get(3)?,
                    highest_price: row.get(4)?,
                    lowest_price: row.get(5)?,
                    change: row.get(6)?,
                    trade_volume: row.get(7)?,
                    transaction: row.get(8)?,
                    trade_value: row.get(9)?,
                    pe_ratio: row.get(10)?,
                    dividend_yield: row.get(11)?,
                    pb_ratio: row.get(12)?,
                    monthly_average_price: row.get(13)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(code, cols)| {
            let code = EntityIdentifier::new(&code)
                .map_err(|e| StoreError::Corrupt(format!("code {:?}: {}", code, e)))?;
            Ok(cols.into_card(code))
        })
        .collect()
}

pub fn get_cache_meta(conn: &Connection) -> Result<Option<CacheMeta>, StoreError> {
    let row = conn
        .query_row(
            "SELECT refreshed_at, record_count, fingerprint FROM cache_meta WHERE id = 1",
            [],
            |row| {
                let refreshed_at: String = row.get(0)?;
                let record_count: i64 = row.get(1)?;
                let fingerprint: String = row.get(2)?;
                Ok((refreshed_at, record_count, fingerprint))
            },
        )
        .optional()?;

    let Some((refreshed_at, record_count, fingerprint)) = row else {
        return Ok(None);
    };

    let refreshed_at = DateTime::parse_from_rfc3339(&refreshed_at)
        .map_err(|e| StoreError::Corrupt(format!("refreshed_at {:?}: {}", refreshed_at, e)))?
        .with_timezone(&Utc);

    Ok(Some(CacheMeta {
        refreshed_at,
        record_count: usize::try_from(record_count)
            .map_err(|_| StoreError::Corrupt(format!("record_count {}", record_count)))?,
        fingerprint,
    }))
}

pub fn verify_count(conn: &Connection) -> Result<i64, StoreError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM stock_card", [], |row| row.get(0))?;
    Ok(count)
}

/// Column values of one row, before the code is validated.
struct StockCardColumns {
    name: String,
    opening_price: String,
    closing_price: String,
    highest_price: String,
    lowest_price: String,
    change: String,
    trade_volume: String,
    transaction: String,
    trade_value: String,
    pe_ratio: String,
    dividend_yield: String,
    pb_ratio: String,
    monthly_average_price: String,
}

impl StockCardColumns {
    fn into_card(self, code: EntityIdentifier) -> StockCard {
        StockCard {
            code,
            name: self.name,
            opening_price: self.opening_price,
            closing_price: self.closing_price,
            highest_price: self.highest_price,
            lowest_price: self.lowest_price,
            change: self.change,
            trade_volume: self.trade_volume,
            transaction: self.transaction,
            trade_value: self.trade_value,
            pe_ratio: self.pe_ratio,
            dividend_yield: self.dividend_yield,
            pb_ratio: self.pb_ratio,
            monthly_average_price: self.monthly_average_price,
        }
    }
}

// ============================================================================
// SQLITE CACHE
// ============================================================================

/// [`CacheStore`] over one SQLite connection.
///
/// Each call takes the connection lock for the length of one short
/// statement or transaction.
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        info!(path = %path.display(), "opened card cache");
        Ok(SqliteCache {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(SqliteCache {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl CacheStore for SqliteCache {
    fn read_all(&self) -> Result<Vec<StockCard>, StoreError> {
        let conn = self.lock()?;
        get_all_cards(&conn)
    }

    fn replace_all(&self, cards: &[StockCard]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM stock_card", [])?;
        insert_cards(&tx, cards)?;
        let stored = verify_count(&tx)?;

        // Describe what was stored, not what was passed in
        let fingerprint = fingerprint(&get_all_cards(&tx)?);
        tx.execute(
            "INSERT INTO cache_meta (id, refreshed_at, record_count, fingerprint)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                refreshed_at = excluded.refreshed_at,
                record_count = excluded.record_count,
                fingerprint = excluded.fingerprint",
            params![Utc::now().to_rfc3339(), stored, fingerprint],
        )?;

        tx.commit()?;
        debug!(cards = stored, %fingerprint, "replaced card cache");
        Ok(())
    }

    fn metadata(&self) -> Result<Option<CacheMeta>, StoreError> {
        let conn = self.lock()?;
        get_cache_meta(&conn)
    }
}
