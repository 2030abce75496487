//! Loads recorded order-book depth for a replay.
//!
//! Each side is a CSV file of `price,volume,exchange_timestamp,local_timestamp` rows, one row per
//! depth level, timestamps in seconds. Rows that share an exchange timestamp bucket are merged
//! into one snapshot by the store, so a file only needs to list levels best-first within each
//! observation.
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::orderbook::{Level, OrderBookStore, Side};

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct ReplayRecord {
    pub price: f64,
    pub volume: f64,
    pub exchange_timestamp: f64,
    pub local_timestamp: f64,
}

fn read_records<R: Read>(reader: R) -> Result<Vec<ReplayRecord>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut records = Vec::new();
    for (row, result) in rdr.deserialize().enumerate() {
        let record: ReplayRecord =
            result.with_context(|| format!("malformed replay row {}", row + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Inserts every record into one side of `store`, one level per row, stamped with its exchange
/// timestamp. Returns the number of rows read.
pub fn load_side<R: Read>(store: &OrderBookStore, side: Side, reader: R) -> Result<usize> {
    let records = read_records(reader)?;
    for record in &records {
        store.insert(
            side,
            record.exchange_timestamp,
            vec![Level::new(record.price, record.volume)],
        );
    }
    Ok(records.len())
}

pub fn from_readers<A: Read, B: Read>(
    asks: A,
    bids: B,
    bucket_resolution: f64,
) -> Result<OrderBookStore> {
    let store = OrderBookStore::with_resolution(bucket_resolution);
    load_side(&store, Side::Ask, asks).context("could not load asks")?;
    load_side(&store, Side::Bid, bids).context("could not load bids")?;
    Ok(store)
}

/// Builds a store from an ask file and a bid file.
pub fn load_replay(
    asks_path: impl AsRef<Path>,
    bids_path: impl AsRef<Path>,
    bucket_resolution: f64,
) -> Result<OrderBookStore> {
    let (asks_path, bids_path) = (asks_path.as_ref(), bids_path.as_ref());
    let asks = std::fs::File::open(asks_path)
        .with_context(|| format!("could not open {}", asks_path.display()))?;
    let bids = std::fs::File::open(bids_path)
        .with_context(|| format!("could not open {}", bids_path.display()))?;
    from_readers(asks, bids, bucket_resolution)
}

#[cfg(test)]
mod tests {
    use super::from_readers;
    use crate::orderbook::DEFAULT_BUCKET_RESOLUTION;

    const ASKS: &str = "price,volume,exchange_timestamp,local_timestamp
100.0,1.0,10.0,10.2
101.0,2.0,10.0,10.2
100.5,3.0,11.0,11.1
";

    const BIDS: &str = "price,volume,exchange_timestamp,local_timestamp
99.0,1.0,10.0,10.2
";

    #[test]
    fn test_that_rows_sharing_a_timestamp_merge_into_one_snapshot() {
        let store =
            from_readers(ASKS.as_bytes(), BIDS.as_bytes(), DEFAULT_BUCKET_RESOLUTION).unwrap();
        assert_eq!(store.asks().len(), 2);
        let first = store.asks().snapshot_at_or_after(10.0).unwrap();
        assert_eq!(first.levels.len(), 2);
        assert_eq!(first.levels[1].price, 101.0);
        assert_eq!(store.bids().len(), 1);
        assert_eq!(store.time_span(), Some((10.0, 11.0)));
    }

    #[test]
    fn test_that_malformed_row_is_reported() {
        let bad = "price,volume,exchange_timestamp,local_timestamp\nabc,1.0,1.0,1.0\n";
        let err =
            from_readers(bad.as_bytes(), BIDS.as_bytes(), DEFAULT_BUCKET_RESOLUTION).unwrap_err();
        assert!(format!("{err:#}").contains("malformed replay row 1"));
    }
}
