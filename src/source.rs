// 🌐 Remote Sources - The three exchange feeds
//
// A source only has to hand back rows of the declared shape. The HTTP
// adapter talks to the exchange open-data API; the static adapter serves
// fixed rows for tests and offline runs.

use crate::records::{DailyTradingRow, MonthlyAverageRow, ValuationRow};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub const VALUATION_ENDPOINT: &str = "exchangeReport/BWIBBU_ALL";
pub const MONTHLY_AVERAGE_ENDPOINT: &str = "exchangeReport/STOCK_DAY_AVG_ALL";
pub const DAILY_TRADING_ENDPOINT: &str = "exchangeReport/STOCK_DAY_ALL";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error fetching {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} answered with HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("malformed response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("{endpoint} did not answer within {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
}

/// The three feeds joined into stock cards.
///
/// Each call is independent and takes no parameters; there is no
/// pagination.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_valuations(&self) -> Result<Vec<ValuationRow>, FetchError>;

    async fn fetch_monthly_averages(&self) -> Result<Vec<MonthlyAverageRow>, FetchError>;

    async fn fetch_daily_trading(&self) -> Result<Vec<DailyTradingRow>, FetchError>;
}

/// Decode a feed body row by row.
///
/// The body must be a JSON array. Elements that do not fit the row shape
/// (including rows with a blank code) are skipped.
pub fn decode_rows<T: DeserializeOwned>(endpoint: &str, body: &str) -> Result<Vec<T>, FetchError> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(body).map_err(|e| FetchError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

    let total = values.len();
    let mut rows = Vec::with_capacity(total);
    let mut skipped = 0;

    for value in values {
        match serde_json::from_value::<T>(value) {
            Ok(row) => rows.push(row),
            Err(e) => {
                skipped += 1;
                debug!(endpoint, error = %e, "skipping row");
            }
        }
    }

    if skipped > 0 {
        warn!(endpoint, skipped, total, "skipped rows that failed validation");
    }

    Ok(rows)
}

// ============================================================================
// HTTP SOURCE
// ============================================================================

#[derive(Clone)]
pub struct HttpSource {
    client: Client,
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(HttpSource { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_rows<T: DeserializeOwned>(&self, endpoint: &str) -> Result<Vec<T>, FetchError> {
        let url = format!("{}{}", self.base_url, endpoint);

        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| transport_error(endpoint, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp.text().await.map_err(|e| transport_error(endpoint, e))?;
        let rows = decode_rows(endpoint, &body)?;
        debug!(endpoint, rows = rows.len(), "fetched feed");
        Ok(rows)
    }
}

fn transport_error(endpoint: &str, err: reqwest::Error) -> FetchError {
    FetchError::Transport {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    #[instrument(level = "info", skip(self))]
    async fn fetch_valuations(&self) -> Result<Vec<ValuationRow>, FetchError> {
        self.get_rows(VALUATION_ENDPOINT).await
    }

    #[instrument(level = "info", skip(self))]
    async fn fetch_monthly_averages(&self) -> Result<Vec<MonthlyAverageRow>, FetchError> {
        self.get_rows(MONTHLY_AVERAGE_ENDPOINT).await
    }

    #[instrument(level = "info", skip(self))]
    async fn fetch_daily_trading(&self) -> Result<Vec<DailyTradingRow>, FetchError> {
        self.get_rows(DAILY_TRADING_ENDPOINT).await
    }
}

// ============================================================================
// STATIC SOURCE
// ============================================================================

/// Which feed a [`StaticSource`] should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    Valuation,
    MonthlyAverage,
    DailyTrading,
}

impl Feed {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Feed::Valuation => VALUATION_ENDPOINT,
            Feed::MonthlyAverage => MONTHLY_AVERAGE_ENDPOINT,
            Feed::DailyTrading => DAILY_TRADING_ENDPOINT,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct StaticFeeds {
    valuations: Vec<ValuationRow>,
    averages: Vec<MonthlyAverageRow>,
    trading: Vec<DailyTradingRow>,
    failing: Option<Feed>,
    delay: Option<Duration>,
}

/// In-memory source with swappable rows and failure injection.
#[derive(Debug, Default)]
pub struct StaticSource {
    feeds: Mutex<StaticFeeds>,
}

impl StaticSource {
    pub fn new(
        valuations: Vec<ValuationRow>,
        averages: Vec<MonthlyAverageRow>,
        trading: Vec<DailyTradingRow>,
    ) -> Self {
        StaticSource {
            feeds: Mutex::new(StaticFeeds {
                valuations,
                averages,
                trading,
                failing: None,
                delay: None,
            }),
        }
    }

    pub fn set_rows(
        &self,
        valuations: Vec<ValuationRow>,
        averages: Vec<MonthlyAverageRow>,
        trading: Vec<DailyTradingRow>,
    ) {
        let mut feeds = self.lock();
        feeds.valuations = valuations;
        feeds.averages = averages;
        feeds.trading = trading;
    }

    /// Make one feed fail (or none) on subsequent fetches.
    pub fn set_failing(&self, feed: Option<Feed>) {
        self.lock().failing = feed;
    }

    /// Delay every fetch, to keep a refresh in flight.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StaticFeeds> {
        // Plain data behind the lock; a poisoned guard is still usable.
        self.feeds.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn serve<T: Clone>(
        &self,
        feed: Feed,
        pick: impl Fn(&StaticFeeds) -> &Vec<T>,
    ) -> Result<Vec<T>, FetchError> {
        let (rows, failing, delay) = {
            let feeds = self.lock();
            (pick(&feeds).clone(), feeds.failing, feeds.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if failing == Some(feed) {
            return Err(FetchError::Transport {
                endpoint: feed.endpoint().to_string(),
                message: "injected failure".to_string(),
            });
        }

        Ok(rows)
    }
}

#[async_trait]
impl RemoteSource for StaticSource {
    async fn fetch_valuations(&self) -> Result<Vec<ValuationRow>, FetchError> {
        self.serve(Feed::Valuation, |f| &f.valuations).await
    }

    async fn fetch_monthly_averages(&self) -> Result<Vec<MonthlyAverageRow>, FetchError> {
        self.serve(Feed::MonthlyAverage, |f| &f.averages).await
    }

    async fn fetch_daily_trading(&self) -> Result<Vec<DailyTradingRow>, FetchError> {
        self.serve(Feed::DailyTrading, |f| &f.trading).await
    }
}
