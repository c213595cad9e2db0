// ⚙️ Configuration - Environment-driven settings for the CLI and server

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://openapi.twse.com.tw/v1/";
pub const DEFAULT_DB_PATH: &str = "stock_cards.db";
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Root of the exchange open-data API
    pub base_url: String,

    /// SQLite file holding the card cache
    pub db_path: PathBuf,

    /// Upper bound for each feed request
    pub fetch_timeout: Duration,

    /// Listen address for `stock-server`
    pub bind_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = lookup("STOCK_CARDS_BASE_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let db_path = lookup("STOCK_CARDS_DB_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let timeout_secs = parse_u64(
            lookup("STOCK_CARDS_FETCH_TIMEOUT_SECS"),
            DEFAULT_FETCH_TIMEOUT_SECS,
        )
        .context("STOCK_CARDS_FETCH_TIMEOUT_SECS")?;
        if timeout_secs == 0 {
            anyhow::bail!("STOCK_CARDS_FETCH_TIMEOUT_SECS must be at least 1");
        }

        let bind_addr = lookup("STOCK_CARDS_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr: SocketAddr = bind_addr
            .parse()
            .with_context(|| format!("invalid STOCK_CARDS_BIND_ADDR {:?}", bind_addr))?;

        Ok(Config {
            base_url,
            db_path,
            fetch_timeout: Duration::from_secs(timeout_secs),
            bind_addr,
        })
    }
}

fn parse_u64(value: Option<String>, default: u64) -> Result<u64> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid integer {:?}", raw)),
    }
}
