//! CSV bar files: `timestamp,open,high,low,close,volume`.

use crate::domain::bar::Bar;
use crate::domain::error::OrbError;
use crate::domain::request::{BROKER_DATETIME_FORMAT, parse_timestamp};
use std::fs;
use std::path::Path;

const HEADER: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

fn field<'r>(record: &'r csv::StringRecord, index: usize, line: u64) -> Result<&'r str, OrbError> {
    record.get(index).ok_or_else(|| OrbError::Data {
        reason: format!("line {line}: missing {} column", HEADER[index]),
    })
}

fn number(record: &csv::StringRecord, index: usize, line: u64) -> Result<f64, OrbError> {
    field(record, index, line)?
        .trim()
        .parse()
        .map_err(|e| OrbError::Data {
            reason: format!("line {line}: invalid {} value: {e}", HEADER[index]),
        })
}

/// Read every bar in file order. Timestamps may use the brokerage layout
/// (`YYYYMMDD HH:MM:SS`) or ISO-8601. Rows that are not OHLC-consistent are
/// a `Data` error.
pub fn read_bars(path: &Path) -> Result<Vec<Bar>, OrbError> {
    let content = fs::read_to_string(path)?;

    let mut rdr = csv::Reader::from_reader(content.as_bytes());
    let mut bars = Vec::new();

    for result in rdr.records() {
        let record = result.map_err(|e| OrbError::Data {
            reason: format!("{}: CSV parse error: {e}", path.display()),
        })?;
        let line = record.position().map_or(0, |p| p.line());

        let timestamp = parse_timestamp(field(&record, 0, line)?).map_err(|e| OrbError::Data {
            reason: format!("line {line}: {e}"),
        })?;

        let bar = Bar {
            timestamp,
            open: number(&record, 1, line)?,
            high: number(&record, 2, line)?,
            low: number(&record, 3, line)?,
            close: number(&record, 4, line)?,
            volume: number(&record, 5, line)?,
        };
        if let Some(problem) = bar.inconsistency() {
            return Err(OrbError::Data {
                reason: format!("line {line}: {problem}"),
            });
        }
        bars.push(bar);
    }

    Ok(bars)
}

/// Write `bars` with a header row, timestamps in the brokerage layout.
pub fn write_bars(path: &Path, bars: &[Bar]) -> Result<(), OrbError> {
    let mut wtr = csv::Writer::from_path(path).map_err(std::io::Error::from)?;
    wtr.write_record(HEADER).map_err(std::io::Error::from)?;
    for bar in bars {
        wtr.write_record([
            bar.timestamp.format(BROKER_DATETIME_FORMAT).to_string(),
            bar.open.to_string(),
            bar.high.to_string(),
            bar.low.to_string(),
            bar.close.to_string(),
            bar.volume.to_string(),
        ])
        .map_err(std::io::Error::from)?;
    }
    wtr.flush()?;
    Ok(())
}
