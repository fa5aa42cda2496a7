//! Trace Reader
//!
//! Delimited text with a header row. Each data row carries the object key in
//! column 6, the size in bytes (decimal or float) in column 9 and the
//! timestamp in column 11, as `YYYY-MM-DD HH:MM:SS.mmm` or without the
//! millisecond suffix. Anything after the recognized timestamp prefix is
//! ignored.

use std::path::Path;

use chrono::NaiveDateTime;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use crate::domain::TraceRecord;
use crate::error::{Error, Result};

/// Timestamp with milliseconds
pub const TIME_PATTERN: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Timestamp without milliseconds
pub const TIME_PATTERN_SHORT: &str = "%Y-%m-%d %H:%M:%S";

const TIME_PATTERN_LEN: usize = "2006-01-02 15:04:05.000".len();
const TIME_PATTERN_SHORT_LEN: usize = "2006-01-02 15:04:05".len();

const KEY_COLUMN: usize = 6;
const SIZE_COLUMN: usize = 9;
const TIME_COLUMN: usize = 11;

/// Size clamping and scaling applied to every record
#[derive(Debug, Clone, Copy)]
pub struct SizeTransform {
    /// Sizes above this are clamped
    pub max_size: u64,
    /// Sizes above this (after clamping) are scaled
    pub scale_from: u64,
    pub scale_factor: f64,
    /// Chunk size is `size / data_shards`
    pub data_shards: usize,
}

impl SizeTransform {
    pub fn apply(&self, size: u64) -> u64 {
        let size = size.min(self.max_size);
        if size > self.scale_from {
            (size as f64 * self.scale_factor) as u64
        } else {
            size
        }
    }
}

/// One data row of the trace
#[derive(Debug)]
pub enum TraceRow {
    Record(TraceRecord),
    /// Unparseable row; still counts as read
    Malformed(Error),
}

/// Sequential reader over trace rows
pub struct TraceReader<R> {
    lines: Lines<R>,
    transform: SizeTransform,
    /// 1-based line number of the last line read
    line: u64,
}

impl TraceReader<BufReader<tokio::fs::File>> {
    /// Open a trace file and consume its header row.
    pub async fn open(path: impl AsRef<Path>, transform: SizeTransform) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        Self::new(BufReader::new(file), transform, &path.display().to_string()).await
    }
}

impl<R: AsyncBufRead + Unpin> TraceReader<R> {
    /// Wrap `reader` and consume its header row. `name` labels errors.
    pub async fn new(reader: R, transform: SizeTransform, name: &str) -> Result<Self> {
        let mut lines = reader.lines();
        if lines.next_line().await?.is_none() {
            return Err(Error::EmptyTrace(name.to_string()));
        }
        Ok(Self {
            lines,
            transform,
            line: 1,
        })
    }

    /// Next data row, or `None` at end of input. I/O failures are errors;
    /// parse failures are reported as [`TraceRow::Malformed`].
    pub async fn next_row(&mut self) -> Result<Option<TraceRow>> {
        let Some(line) = self.lines.next_line().await? else {
            return Ok(None);
        };
        self.line += 1;
        Ok(Some(match parse_row(self.line, &line, &self.transform) {
            Ok(record) => TraceRow::Record(record),
            Err(e) => TraceRow::Malformed(e),
        }))
    }

    /// Line number of the last line read, header included
    pub fn line(&self) -> u64 {
        self.line
    }
}

/// Parse one data row.
pub fn parse_row(line_no: u64, line: &str, transform: &SizeTransform) -> Result<TraceRecord> {
    let malformed = |reason: String| Error::TraceParse {
        line: line_no,
        reason,
    };
    let fields = split_fields(line);
    if fields.len() <= TIME_COLUMN {
        return Err(malformed(format!(
            "expected at least {} columns, got {}",
            TIME_COLUMN + 1,
            fields.len()
        )));
    }

    let size_field = fields[SIZE_COLUMN].trim();
    let size = size_field
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .ok_or_else(|| malformed(format!("invalid size {:?}", size_field)))?;
    let timestamp = parse_timestamp(&fields[TIME_COLUMN])
        .ok_or_else(|| malformed(format!("invalid timestamp {:?}", fields[TIME_COLUMN])))?;

    let size = transform.apply(size as u64);
    Ok(TraceRecord::new(
        fields[KEY_COLUMN].clone(),
        size,
        transform.data_shards,
        timestamp,
    ))
}

fn parse_timestamp(field: &str) -> Option<NaiveDateTime> {
    field
        .get(..TIME_PATTERN_LEN)
        .and_then(|s| NaiveDateTime::parse_from_str(s, TIME_PATTERN).ok())
        .or_else(|| {
            field
                .get(..TIME_PATTERN_SHORT_LEN)
                .and_then(|s| NaiveDateTime::parse_from_str(s, TIME_PATTERN_SHORT).ok())
        })
}

/// Split a comma-separated row, honoring double-quoted fields and `""`
/// escapes.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.trim_end_matches(['\r', '\n']).chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' if quoted => quoted = false,
            '"' if field.is_empty() => quoted = true,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{NaiveDate, Timelike};

    fn identity() -> SizeTransform {
        SizeTransform {
            max_size: u64::MAX,
            scale_from: u64::MAX,
            scale_factor: 1.0,
            data_shards: 4,
        }
    }

    fn row(key: &str, size: &str, ts: &str) -> String {
        format!("0,1,2,3,4,5,{},7,8,{},10,{}", key, size, ts)
    }

    #[test]
    fn test_parse_row_with_millis() {
        let record = parse_row(2, &row("A", "40", "2017-06-01 12:00:01.250"), &identity()).unwrap();
        assert_eq!(record.key, "A");
        assert_eq!(record.size, 40);
        assert_eq!(record.chunk_size, 10);
        assert_eq!(record.timestamp.nanosecond(), 250_000_000);
    }

    #[test]
    fn test_parse_row_without_millis_and_trailing_text() {
        let record = parse_row(2, &row("B", "1.5e3", "2017-06-01 12:00:01 UTC"), &identity()).unwrap();
        assert_eq!(record.size, 1500);
        let expected = NaiveDate::from_ymd_opt(2017, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 1)
            .unwrap();
        assert_eq!(record.timestamp, expected);
    }

    #[test]
    fn test_malformed_rows() {
        assert_matches!(
            parse_row(3, &row("A", "lots", "2017-06-01 12:00:01"), &identity()),
            Err(Error::TraceParse { line: 3, .. })
        );
        assert!(parse_row(3, &row("A", "10", "yesterday"), &identity()).is_err());
        assert!(parse_row(3, &row("A", "-5", "2017-06-01 12:00:01"), &identity()).is_err());
        assert!(parse_row(3, "a,b,c", &identity()).is_err());
    }

    #[test]
    fn test_quoted_key_with_comma() {
        let line = row("\"dir,\"\"x\"\"\"", "8", "2017-06-01 12:00:01");
        let record = parse_row(2, &line, &identity()).unwrap();
        assert_eq!(record.key, "dir,\"x\"");
    }

    #[test]
    fn test_size_transforms() {
        let transform = SizeTransform {
            max_size: 1000,
            scale_from: 100,
            scale_factor: 0.5,
            data_shards: 4,
        };
        assert_eq!(transform.apply(50), 50);
        assert_eq!(transform.apply(100), 100);
        assert_eq!(transform.apply(400), 200);
        assert_eq!(transform.apply(5000), 500);
    }

    #[tokio::test]
    async fn test_reader_skips_header_and_reports_malformed() {
        let text = format!(
            "header\n{}\n{}\n",
            row("A", "40", "2017-06-01 12:00:00.000"),
            row("B", "x", "2017-06-01 12:00:01.000")
        );
        let mut reader = TraceReader::new(text.as_bytes(), identity(), "mem").await.unwrap();

        assert_matches!(reader.next_row().await.unwrap(), Some(TraceRow::Record(r)) if r.key == "A");
        assert_matches!(
            reader.next_row().await.unwrap(),
            Some(TraceRow::Malformed(Error::TraceParse { line: 3, .. }))
        );
        assert!(reader.next_row().await.unwrap().is_none());
        assert_eq!(reader.line(), 3);
    }

    #[tokio::test]
    async fn test_empty_trace_rejected() {
        let err = TraceReader::new(&b""[..], identity(), "empty.csv")
            .await
            .err()
            .unwrap();
        assert_matches!(err, Error::EmptyTrace(name) if name == "empty.csv");
    }
}
