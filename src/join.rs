// 🔗 Join Engine - Inner join of the three feeds on security code
//
// A card exists only when valuation, monthly average and daily trading
// rows are all present for the same code. Output order follows the
// valuation feed.

use crate::records::{
    DailyTradingRow, EntityIdentifier, MonthlyAverageRow, StockCard, ValuationRow,
};
use serde::Serialize;
use std::collections::HashMap;

/// Counters describing one join run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JoinStats {
    /// Valuation rows considered
    pub candidates: usize,

    /// Cards produced
    pub matched: usize,

    /// Valuation rows with no monthly average row
    pub missing_average: usize,

    /// Valuation rows with no daily trading row (counted only when the
    /// monthly average row was present)
    pub missing_trading: usize,
}

impl JoinStats {
    pub fn dropped(&self) -> usize {
        self.candidates - self.matched
    }
}

/// Inner-join the three feeds. Pure: no I/O, inputs untouched.
pub fn join(
    valuations: &[ValuationRow],
    averages: &[MonthlyAverageRow],
    trading: &[DailyTradingRow],
) -> Vec<StockCard> {
    join_with_stats(valuations, averages, trading).0
}

/// Same as [`join`], also reporting why rows were dropped.
pub fn join_with_stats(
    valuations: &[ValuationRow],
    averages: &[MonthlyAverageRow],
    trading: &[DailyTradingRow],
) -> (Vec<StockCard>, JoinStats) {
    let mut stats = JoinStats {
        candidates: valuations.len(),
        ..JoinStats::default()
    };

    if valuations.is_empty() || averages.is_empty() || trading.is_empty() {
        stats.missing_average = if averages.is_empty() { valuations.len() } else { 0 };
        stats.missing_trading = valuations.len() - stats.missing_average;
        return (Vec::new(), stats);
    }

    // Later rows overwrite earlier ones: last row per code wins.
    let average_by_code = index_by_code(averages, |row| &row.code);
    let trading_by_code = index_by_code(trading, |row| &row.code);

    let mut cards = Vec::with_capacity(valuations.len().min(trading.len()));

    for valuation in valuations {
        let Some(average) = average_by_code.get(&valuation.code) else {
            stats.missing_average += 1;
            continue;
        };
        let Some(day) = trading_by_code.get(&valuation.code) else {
            stats.missing_trading += 1;
            continue;
        };

        cards.push(StockCard::from_rows(valuation, average, day));
    }

    stats.matched = cards.len();
    (cards, stats)
}

fn index_by_code<'a, T>(
    rows: &'a [T],
    code: impl Fn(&'a T) -> &'a EntityIdentifier,
) -> HashMap<&'a EntityIdentifier, &'a T> {
    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        index.insert(code(row), row);
    }
    index
}
