//! Append-only CSV log of speed measurements.
//!
//! One flat file, header written on creation only, rows appended in
//! completion order. The reader merges the historical `Date`/`Time` column
//! split back into a single UTC timestamp.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use core_types::types::Measurement;
use csv_async::{AsyncReaderBuilder, AsyncWriterBuilder, StringRecord};
use futures::StreamExt;
use log::warn;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::sync::Mutex;

const HEADER: [&str; 4] = ["Date", "Time", "SpeedMbps", "TestTimeSeconds"];
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv_async::Error),
}

/// Durable append-only measurement log backed by a single CSV file.
///
/// Appends are serialized behind a lock so concurrent probe completions
/// cannot interleave rows. Rows are never rewritten or reordered; readers
/// receive the file's order as-is.
pub struct SpeedStore {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl SpeedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one measurement. The header row is written only when the
    /// file is created.
    pub async fn append(&self, measurement: &Measurement) -> Result<(), StoreError> {
        let _guard = self.append_lock.lock().await;
        let write_header = !fs::try_exists(&self.path).await?;
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        let mut writer = AsyncWriterBuilder::new().create_writer(file);
        if write_header {
            writer.write_record(&HEADER).await?;
        }
        writer.write_record(&encode_row(measurement)).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads the entire log. A missing file is an empty log. Rows that fail
    /// to parse (e.g. a torn final line) are skipped with a warning rather
    /// than poisoning the query path.
    pub async fn read_all(&self) -> Result<Vec<Measurement>, StoreError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).await?;
        let mut reader = AsyncReaderBuilder::new().flexible(true).create_reader(file);
        let mut records = reader.records();
        let mut measurements = Vec::new();
        while let Some(record) = records.next().await {
            match record {
                Ok(record) => match parse_row(&record) {
                    Some(measurement) => measurements.push(measurement),
                    None => warn!(
                        "skipping malformed row in {}: {:?}",
                        self.path.display(),
                        record
                    ),
                },
                Err(err) => warn!(
                    "skipping unreadable row in {}: {}",
                    self.path.display(),
                    err
                ),
            }
        }
        Ok(measurements)
    }

    /// Number of measurements currently on disk.
    pub async fn record_count(&self) -> Result<usize, StoreError> {
        Ok(self.read_all().await?.len())
    }
}

fn encode_row(measurement: &Measurement) -> [String; 4] {
    [
        measurement.timestamp.format(DATE_FORMAT).to_string(),
        measurement.timestamp.format(TIME_FORMAT).to_string(),
        measurement.speed_mbps.to_string(),
        measurement
            .test_time_seconds
            .map(|secs| secs.to_string())
            .unwrap_or_default(),
    ]
}

fn parse_row(record: &StringRecord) -> Option<Measurement> {
    let date = NaiveDate::parse_from_str(record.get(0)?, DATE_FORMAT).ok()?;
    let time = NaiveTime::parse_from_str(record.get(1)?, TIME_FORMAT).ok()?;
    let speed_mbps: f64 = record.get(2)?.parse().ok()?;
    let test_time_seconds = record
        .get(3)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse().ok());
    Some(Measurement {
        timestamp: NaiveDateTime::new(date, time).and_utc(),
        speed_mbps,
        test_time_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample(ts: &str, speed: f64, test_secs: i64) -> Measurement {
        Measurement::new(ts.parse().expect("test timestamp"), speed).with_test_time(test_secs)
    }

    #[test]
    fn row_encoding_round_trips() {
        let measurement = sample("2024-05-06T07:08:09Z", 87.3, 12);
        let row = encode_row(&measurement);
        assert_eq!(row[0], "2024-05-06");
        assert_eq!(row[1], "07:08:09");
        let record = StringRecord::from(row.to_vec());
        assert_eq!(parse_row(&record), Some(measurement));
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SpeedStore::new(dir.path().join("never-written.csv"));
        assert!(store.read_all().await.expect("read").is_empty());
        assert_eq!(store.record_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn append_then_read_preserves_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SpeedStore::new(dir.path().join("log.csv"));
        let first = sample("2024-01-01T10:00:00Z", 42.0, 9);
        let second = sample("2024-01-01T10:01:00Z", 45.5, 8);
        store.append(&first).await.expect("append first");
        store.append(&second).await.expect("append second");

        let read = store.read_all().await.expect("read");
        assert_eq!(read, vec![first, second]);
    }

    #[tokio::test]
    async fn header_written_only_on_create() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log.csv");
        let store = SpeedStore::new(&path);
        store
            .append(&sample("2024-01-01T10:00:00Z", 42.0, 9))
            .await
            .expect("append");
        store
            .append(&sample("2024-01-01T10:01:00Z", 43.0, 9))
            .await
            .expect("append");

        let raw = std::fs::read_to_string(&path).expect("read raw");
        let header_lines = raw.lines().filter(|line| line.starts_with("Date,Time")).count();
        assert_eq!(header_lines, 1);
        assert_eq!(raw.lines().count(), 3);
    }

    #[tokio::test]
    async fn torn_row_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log.csv");
        std::fs::write(
            &path,
            "Date,Time,SpeedMbps,TestTimeSeconds\n2024-01-01,10:00:00,42.5,9\n2024-01-01,10:01",
        )
        .expect("seed file");

        let store = SpeedStore::new(&path);
        let read = store.read_all().await.expect("read");
        assert_eq!(read.len(), 1);
        assert_eq!(
            read[0].timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(read[0].speed_mbps, 42.5);
        assert_eq!(read[0].test_time_seconds, Some(9));
    }

    #[tokio::test]
    async fn missing_test_time_reads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log.csv");
        std::fs::write(
            &path,
            "Date,Time,SpeedMbps,TestTimeSeconds\n2024-01-01,10:00:00,42.5,\n",
        )
        .expect("seed file");

        let store = SpeedStore::new(&path);
        let read = store.read_all().await.expect("read");
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].test_time_seconds, None);
    }
}
