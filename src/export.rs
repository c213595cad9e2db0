// 📤 CSV export of stock cards

use crate::records::StockCard;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

pub fn write_cards<W: Write>(writer: W, cards: &[StockCard]) -> Result<usize> {
    let mut wtr = csv::Writer::from_writer(writer);
    for card in cards {
        wtr.serialize(card).context("Failed to serialize card")?;
    }
    wtr.flush()?;
    Ok(cards.len())
}

pub fn export_csv(csv_path: &Path, cards: &[StockCard]) -> Result<usize> {
    let file = std::fs::File::create(csv_path)
        .with_context(|| format!("Failed to create {}", csv_path.display()))?;
    write_cards(file, cards)
}
