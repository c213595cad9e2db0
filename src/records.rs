// 📇 Records - Raw feed rows, identifiers, and the joined stock card
//
// Three exchange feeds describe the same listed securities:
//   A. valuation ratios       (BWIBBU_ALL)
//   B. monthly average price  (STOCK_DAY_AVG_ALL)
//   C. daily trading figures  (STOCK_DAY_ALL)
// All three are keyed by the security code, which is the join key and an
// indexed column of the local cache.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ENTITY IDENTIFIER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("identifier is empty")]
    Empty,
}

/// Security code shared by every feed and by the cache.
///
/// Compared as an opaque string when joining. Only sorting looks at the
/// numeric value (see [`EntityIdentifier::numeric`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityIdentifier(String);

impl EntityIdentifier {
    /// Validate and wrap a raw code. Surrounding whitespace is trimmed.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdentifierError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(IdentifierError::Empty);
        }
        Ok(EntityIdentifier(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value of the code, if it is made of digits only.
    pub fn numeric(&self) -> Option<u64> {
        self.0.parse::<u64>().ok()
    }
}

impl TryFrom<String> for EntityIdentifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        EntityIdentifier::new(value)
    }
}

impl From<EntityIdentifier> for String {
    fn from(id: EntityIdentifier) -> Self {
        id.0
    }
}

impl fmt::Display for EntityIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

// ============================================================================
// RAW FEED ROWS
// ============================================================================

/// Row kind A: valuation ratios (BWIBBU_ALL)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationRow {
    #[serde(rename = "Code")]
    pub code: EntityIdentifier,

    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "PEratio", default)]
    pub pe_ratio: String,

    #[serde(rename = "DividendYield", default)]
    pub dividend_yield: String,

    #[serde(rename = "PBratio", default)]
    pub pb_ratio: String,
}

/// Row kind B: monthly average price (STOCK_DAY_AVG_ALL)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyAverageRow {
    #[serde(rename = "Code")]
    pub code: EntityIdentifier,

    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "ClosingPrice", default)]
    pub closing_price: String,

    #[serde(rename = "MonthlyAveragePrice", default)]
    pub monthly_average_price: String,
}

/// Row kind C: daily trading figures (STOCK_DAY_ALL)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyTradingRow {
    #[serde(rename = "Code")]
    pub code: EntityIdentifier,

    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "TradeVolume", default)]
    pub trade_volume: String,

    #[serde(rename = "TradeValue", default)]
    pub trade_value: String,

    #[serde(rename = "OpeningPrice", default)]
    pub opening_price: String,

    #[serde(rename = "HighestPrice", default)]
    pub highest_price: String,

    #[serde(rename = "LowestPrice", default)]
    pub lowest_price: String,

    #[serde(rename = "ClosingPrice", default)]
    pub closing_price: String,

    #[serde(rename = "Change", default)]
    pub change: String,

    #[serde(rename = "Transaction", default)]
    pub transaction: String,
}

// ============================================================================
// STOCK CARD (composite record)
// ============================================================================

/// One security with the attributes of all three feeds merged.
///
/// Only produced when every feed had a row for `code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCard {
    pub code: EntityIdentifier,
    pub name: String,

    // Daily trading (C)
    pub opening_price: String,
    pub closing_price: String,
    pub highest_price: String,
    pub lowest_price: String,
    pub change: String,
    pub trade_volume: String,
    pub transaction: String,
    pub trade_value: String,

    // Valuation (A)
    pub pe_ratio: String,
    pub dividend_yield: String,
    pub pb_ratio: String,

    // Monthly average (B)
    pub monthly_average_price: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceTrend {
    AboveAverage,
    AtOrBelowAverage,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeDirection {
    Up,
    Down,
    Flat,
    Unknown,
}

/// Valuation ratios formatted for a detail view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RatioSummary {
    pub pe_ratio: String,
    pub dividend_yield: String,
    pub pb_ratio: String,
}

const NOT_AVAILABLE: &str = "N/A";

impl StockCard {
    /// Merge one row of each feed. Callers guarantee the codes agree.
    pub fn from_rows(
        valuation: &ValuationRow,
        average: &MonthlyAverageRow,
        trading: &DailyTradingRow,
    ) -> Self {
        StockCard {
            code: valuation.code.clone(),
            name: valuation.name.clone(),
            opening_price: trading.opening_price.clone(),
            closing_price: trading.closing_price.clone(),
            highest_price: trading.highest_price.clone(),
            lowest_price: trading.lowest_price.clone(),
            change: trading.change.clone(),
            trade_volume: trading.trade_volume.clone(),
            transaction: trading.transaction.clone(),
            trade_value: trading.trade_value.clone(),
            pe_ratio: valuation.pe_ratio.clone(),
            dividend_yield: valuation.dividend_yield.clone(),
            pb_ratio: valuation.pb_ratio.clone(),
            monthly_average_price: average.monthly_average_price.clone(),
        }
    }

    /// Closing price compared with the monthly average.
    pub fn price_trend(&self) -> PriceTrend {
        match (
            parse_figure(&self.closing_price),
            parse_figure(&self.monthly_average_price),
        ) {
            (Some(close), Some(avg)) if close > avg => PriceTrend::AboveAverage,
            (Some(_), Some(_)) => PriceTrend::AtOrBelowAverage,
            _ => PriceTrend::Unknown,
        }
    }

    pub fn change_direction(&self) -> ChangeDirection {
        match parse_figure(&self.change) {
            Some(v) if v > 0.0 => ChangeDirection::Up,
            Some(v) if v < 0.0 => ChangeDirection::Down,
            Some(_) => ChangeDirection::Flat,
            None => ChangeDirection::Unknown,
        }
    }

    pub fn ratio_summary(&self) -> RatioSummary {
        let or_na = |value: &str| {
            if value.trim().is_empty() {
                NOT_AVAILABLE.to_string()
            } else {
                value.to_string()
            }
        };

        RatioSummary {
            pe_ratio: or_na(&self.pe_ratio),
            dividend_yield: if self.dividend_yield.trim().is_empty() {
                NOT_AVAILABLE.to_string()
            } else {
                format!("{}%", self.dividend_yield)
            },
            pb_ratio: or_na(&self.pb_ratio),
        }
    }
}

/// Exchange figures come as text, sometimes with thousands separators
/// or a leading "+".
fn parse_figure(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    let cleaned = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_identifier_trims_and_rejects_empty() {
        assert_eq!(EntityIdentifier::new(" 1101 ").unwrap().as_str(), "1101");
        assert_eq!(EntityIdentifier::new("   "), Err(IdentifierError::Empty));
        assert_eq!(EntityIdentifier::new(""), Err(IdentifierError::Empty));
    }

    #[test]
    fn test_identifier_numeric() {
        assert_eq!(id("2330").numeric(), Some(2330));
        assert_eq!(id("0050").numeric(), Some(50));
        assert_eq!(id("00632R").numeric(), None);
    }

    #[test]
    fn test_rows_deserialize_from_feed_json() {
        let json = r#"{
            "Code": "1101",
            "Name": "台泥",
            "PEratio": "27.10",
            "DividendYield": "3.45",
            "PBratio": "1.12"
        }"#;
        let row: ValuationRow = serde_json::from_str(json).unwrap();
        assert_eq!(row.code, id("1101"));
        assert_eq!(row.pe_ratio, "27.10");

        // Missing attributes default to empty, missing code is rejected
        let sparse: MonthlyAverageRow = serde_json::from_str(r#"{"Code": "2330"}"#).unwrap();
        assert_eq!(sparse.monthly_average_price, "");
        assert!(serde_json::from_str::<MonthlyAverageRow>(r#"{"Code": " "}"#).is_err());
        assert!(serde_json::from_str::<DailyTradingRow>(r#"{"Name": "x"}"#).is_err());
    }

    #[test]
    fn test_card_takes_fields_from_each_feed() {
        let card = StockCard::from_rows(
            &valuation("1101", "27.10"),
            &average("1101", "600"),
            &trading("1101", "32.25"),
        );

        assert_eq!(card.code, id("1101"));
        assert_eq!(card.name, "Stock 1101");
        assert_eq!(card.pe_ratio, "27.10");
        assert_eq!(card.monthly_average_price, "600");
        assert_eq!(card.closing_price, "32.25");
        assert_eq!(card.trade_volume, "1,000");
    }

    #[test]
    fn test_price_trend_and_change_direction() {
        let mut card = card("2330");
        card.closing_price = "1,050.00".to_string();
        card.monthly_average_price = "1,000.50".to_string();
        assert_eq!(card.price_trend(), PriceTrend::AboveAverage);

        card.closing_price = "--".to_string();
        assert_eq!(card.price_trend(), PriceTrend::Unknown);

        card.change = "-1.5".to_string();
        assert_eq!(card.change_direction(), ChangeDirection::Down);
        card.change = "0.00".to_string();
        assert_eq!(card.change_direction(), ChangeDirection::Flat);
        card.change = "".to_string();
        assert_eq!(card.change_direction(), ChangeDirection::Unknown);
    }

    #[test]
    fn test_ratio_summary_fills_missing_values() {
        let mut card = card("1101");
        card.pe_ratio = String::new();
        let summary = card.ratio_summary();

        assert_eq!(summary.pe_ratio, "N/A");
        assert_eq!(summary.dividend_yield, "3.10%");
        assert_eq!(summary.pb_ratio, "1.20");
    }
}
