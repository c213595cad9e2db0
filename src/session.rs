// 🧭 Session State - What the view layer observes
//
// Owned by one AggregationController. The view reads snapshots; only the
// controller's operations change it.

use crate::records::StockCard;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn from_ascending(ascending: bool) -> Self {
        if ascending {
            SortOrder::Ascending
        } else {
            SortOrder::Descending
        }
    }
}

/// Where the published results came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataOrigin {
    Remote,
    Cache,
}

/// Why the last refresh ended with `result_empty = true`.
///
/// The boolean stays the compatibility contract; this only adds detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EmptyReason {
    /// A feed failed or timed out
    SourceUnavailable,

    /// All feeds answered but no code was in all three
    EmptyJoin,

    /// Offline and nothing cached
    CacheEmpty,

    /// Offline and the cache could not be read
    CacheReadFailure,
}

/// Coarse controller lifecycle, derived from the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Uninitialized,
    Loading,
    Ready { empty: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub initialized: bool,
    pub loading: bool,
    pub result_empty: bool,
    pub results: Vec<StockCard>,
    pub selected_record: Option<StockCard>,
    pub dialog_visible: bool,
    pub sort_sheet_visible: bool,

    pub sort_order: Option<SortOrder>,
    pub origin: Option<DataOrigin>,
    pub empty_reason: Option<EmptyReason>,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            initialized: false,
            loading: false,
            result_empty: true,
            results: Vec::new(),
            selected_record: None,
            dialog_visible: false,
            sort_sheet_visible: false,
            sort_order: None,
            origin: None,
            empty_reason: None,
        }
    }
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        if self.loading {
            Phase::Loading
        } else if !self.initialized {
            Phase::Uninitialized
        } else {
            Phase::Ready {
                empty: self.result_empty,
            }
        }
    }

    /// Publish a non-empty card set.
    pub(crate) fn publish(&mut self, cards: Vec<StockCard>, origin: DataOrigin) {
        self.results = cards;
        self.result_empty = false;
        self.origin = Some(origin);
        self.empty_reason = None;
        self.sort_order = None;
    }

    /// Flag an empty outcome. Previously published cards stay in place.
    pub(crate) fn mark_empty(&mut self, reason: EmptyReason) {
        self.result_empty = true;
        self.empty_reason = Some(reason);
    }
}
