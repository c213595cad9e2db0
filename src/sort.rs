// ↕️ Card ordering by numeric security code
//
// Non-numeric codes (ETF suffixes like "00632R") always go after every
// numeric code, whichever direction is requested, and keep their
// relative order.

use crate::records::StockCard;
use crate::session::SortOrder;
use std::cmp::Ordering;

pub fn sort_cards(cards: &mut [StockCard], order: SortOrder) {
    // slice::sort_by is stable: equal keys keep their prior order
    cards.sort_by(|a, b| compare_codes(a.code.numeric(), b.code.numeric(), order));
}

fn compare_codes(a: Option<u64>, b: Option<u64>, order: SortOrder) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => match order {
            SortOrder::Ascending => x.cmp(&y),
            SortOrder::Descending => y.cmp(&x),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
