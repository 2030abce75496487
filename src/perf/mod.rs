//! Outcome of closed positions and the append-only sink they are written to.
//!
//! [report_statistics] is the only consumer of the statistics cursor: it asks the strategy for
//! everything after the last cursor it saw, writes it out and keeps the new cursor, so a position
//! is never written twice however often it runs.
use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::strategy::{PositionId, ReboundStrategy};

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct ClosedPositionRecord {
    pub position_id: PositionId,
    pub open_time: f64,
    pub close_time: f64,
    pub quote_invested: f64,
    pub quote_returned: f64,
}

impl ClosedPositionRecord {
    pub fn profit(&self) -> f64 {
        self.quote_returned - self.quote_invested
    }
}

/// Positions resolved since a cursor. `cursor` is the value to pass on the next call.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Statistics {
    pub closed: Vec<ClosedPositionRecord>,
    pub errors: usize,
    pub cursor: PositionId,
}

impl Statistics {
    pub fn total_profit(&self) -> f64 {
        self.closed.iter().map(ClosedPositionRecord::profit).sum()
    }
}

pub trait StatisticsSink {
    fn write(&mut self, statistics: &Statistics) -> Result<()>;
}

/// Appends one `open_time,close_time,quote_invested,quote_returned` row per closed position and
/// keeps a running error count.
pub struct CsvStatisticsSink {
    writer: csv::Writer<File>,
    errors: usize,
}

impl CsvStatisticsSink {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let write_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("could not open statistics file {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if write_header {
            writer.write_record(["open_time", "close_time", "quote_invested", "quote_returned"])?;
        }
        Ok(Self { writer, errors: 0 })
    }

    pub fn errors(&self) -> usize {
        self.errors
    }
}

impl StatisticsSink for CsvStatisticsSink {
    fn write(&mut self, statistics: &Statistics) -> Result<()> {
        for record in &statistics.closed {
            self.writer.write_record(&[
                record.open_time.to_string(),
                record.close_time.to_string(),
                record.quote_invested.to_string(),
                record.quote_returned.to_string(),
            ])?;
        }
        self.writer.flush()?;
        self.errors += statistics.errors;
        Ok(())
    }
}

impl StatisticsSink for Vec<Statistics> {
    fn write(&mut self, statistics: &Statistics) -> Result<()> {
        self.push(statistics.clone());
        Ok(())
    }
}

/// Writes everything resolved after `cursor` to `sink` and returns the next cursor.
pub fn report_statistics(
    strategy: &ReboundStrategy,
    cursor: PositionId,
    sink: &mut dyn StatisticsSink,
) -> Result<PositionId> {
    let statistics = strategy.get_statistics(cursor);
    if !statistics.closed.is_empty() || statistics.errors > 0 {
        info!(
            target: strategy.log_target(),
            "STATS: {} closed, {} errored, profit {:.6}",
            statistics.closed.len(),
            statistics.errors,
            statistics.total_profit()
        );
    }
    sink.write(&statistics)?;
    Ok(statistics.cursor)
}

#[cfg(test)]
mod tests {
    use super::{ClosedPositionRecord, CsvStatisticsSink, Statistics, StatisticsSink};

    fn statistics() -> Statistics {
        Statistics {
            closed: vec![ClosedPositionRecord {
                position_id: 1,
                open_time: 10.0,
                close_time: 20.0,
                quote_invested: 100.1,
                quote_returned: 101.9,
            }],
            errors: 2,
            cursor: 3,
        }
    }

    #[test]
    fn test_that_profit_is_returned_minus_invested() {
        assert!((statistics().total_profit() - 1.8).abs() < 1e-9);
    }

    #[test]
    fn test_that_csv_sink_appends_rows_under_one_header() {
        let path = std::env::temp_dir().join("bookrunner_stats_sink_test.csv");
        let _ = std::fs::remove_file(&path);

        let mut sink = CsvStatisticsSink::from_path(&path).unwrap();
        sink.write(&statistics()).unwrap();
        drop(sink);
        let mut sink = CsvStatisticsSink::from_path(&path).unwrap();
        sink.write(&statistics()).unwrap();
        assert_eq!(sink.errors(), 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "open_time,close_time,quote_invested,quote_returned");
        assert_eq!(lines[1], "10,20,100.1,101.9");
        std::fs::remove_file(path).unwrap();
    }
}
