//! Bulk load sinks + duplicate export for tripload.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolCopyExt, PgPoolOptions};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, Instrument};
use tripload_core::{TripField, TripRecord, SECOND_PRECISION_FORMAT};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tripload-storage";

const ESTIMATED_RECORD_SIZE: usize = 128;

const COPY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S+00";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMapping {
    pub column: &'static str,
    pub field: TripField,
}

pub const TRIP_COLUMNS: [ColumnMapping; 9] = [
    ColumnMapping { column: "pickup_datetime", field: TripField::Pickup },
    ColumnMapping { column: "dropoff_datetime", field: TripField::Dropoff },
    ColumnMapping { column: "passenger_count", field: TripField::PassengerCount },
    ColumnMapping { column: "trip_distance", field: TripField::TripDistance },
    ColumnMapping { column: "store_and_fwd_flag", field: TripField::StoreAndFwdFlag },
    ColumnMapping { column: "pickup_location_id", field: TripField::PickupLocationId },
    ColumnMapping { column: "dropoff_location_id", field: TripField::DropoffLocationId },
    ColumnMapping { column: "fare_amount", field: TripField::FareAmount },
    ColumnMapping { column: "tip_amount", field: TripField::TipAmount },
];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid destination table name {0:?}")]
    InvalidTable(String),
    #[error("connecting to destination: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("bulk copy failed: {0}")]
    Copy(#[source] sqlx::Error),
    #[error("encoding bulk payload: {0}")]
    Encode(#[from] csv::Error),
    #[error("buffering bulk payload: {0}")]
    Io(#[from] std::io::Error),
    #[error("batch rejected: {0}")]
    Rejected(String),
}

/// Destination for a fully materialized batch. A load either persists the
/// whole batch or fails it as a unit.
#[async_trait]
pub trait BulkSink: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, records: &[TripRecord]) -> Result<u64, SinkError>;
}

#[async_trait]
impl<T: BulkSink + ?Sized> BulkSink for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn load(&self, records: &[TripRecord]) -> Result<u64, SinkError> {
        (**self).load(records).await
    }
}

#[derive(Debug, Clone)]
pub struct PgCopySink {
    pool: PgPool,
    table: String,
    statement: String,
}

impl PgCopySink {
    pub async fn connect(database_url: &str, table: &str) -> Result<Self, SinkError> {
        validate_table_name(table)?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(SinkError::Connect)?;
        Self::with_pool(pool, table)
    }

    pub fn with_pool(pool: PgPool, table: &str) -> Result<Self, SinkError> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            statement: copy_statement(table),
        })
    }

    async fn copy_batch(&self, records: &[TripRecord]) -> Result<u64, SinkError> {
        let payload = encode_copy_payload(records)?;

        let mut stream = self
            .pool
            .copy_in_raw(&self.statement)
            .await
            .map_err(SinkError::Copy)?;
        if let Err(err) = stream.send(payload).await {
            let _ = stream
                .abort(format!("failed to send COPY payload: {err}"))
                .await;
            return Err(SinkError::Copy(err));
        }
        let rows_affected = stream.finish().await.map_err(SinkError::Copy)?;
        info!(rows_affected, "bulk copy finished");
        Ok(rows_affected)
    }
}

#[async_trait]
impl BulkSink for PgCopySink {
    fn name(&self) -> &str {
        "postgres-copy"
    }

    async fn load(&self, records: &[TripRecord]) -> Result<u64, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }

        let span = info_span!("bulk_copy", table = %self.table, rows = records.len());
        self.copy_batch(records).instrument(span).await
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    loaded: Mutex<Vec<TripRecord>>,
    reject_with: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(message: impl Into<String>) -> Self {
        Self {
            loaded: Mutex::new(Vec::new()),
            reject_with: Some(message.into()),
        }
    }

    pub fn loaded(&self) -> Vec<TripRecord> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BulkSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, records: &[TripRecord]) -> Result<u64, SinkError> {
        if let Some(message) = &self.reject_with {
            return Err(SinkError::Rejected(message.clone()));
        }
        let mut loaded = self
            .loaded
            .lock()
            .map_err(|_| SinkError::Rejected("memory sink poisoned".to_string()))?;
        loaded.extend_from_slice(records);
        Ok(records.len() as u64)
    }
}

pub fn copy_statement(table: &str) -> String {
    let columns = TRIP_COLUMNS
        .iter()
        .map(|m| m.column)
        .collect::<Vec<_>>()
        .join(", ");
    format!("COPY {table} ({columns}) FROM STDIN WITH (FORMAT CSV, ENCODING 'UTF8')")
}

pub fn encode_copy_payload(records: &[TripRecord]) -> Result<Vec<u8>, SinkError> {
    let buffer = Vec::with_capacity(records.len() * ESTIMATED_RECORD_SIZE);
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b',')
        .has_headers(false)
        .from_writer(buffer);

    for record in records {
        writer.write_record(
            TRIP_COLUMNS
                .iter()
                .map(|m| m.field.render(record, COPY_TIMESTAMP_FORMAT)),
        )?;
    }
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|err| SinkError::Io(std::io::Error::new(err.error().kind(), err.error().to_string())))
}

fn validate_table_name(table: &str) -> Result<(), SinkError> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if !table.is_empty() && table.split('.').all(valid_part) && table.split('.').count() <= 2 {
        Ok(())
    } else {
        Err(SinkError::InvalidTable(table.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportedFile {
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
}

pub fn encode_duplicates_csv(records: &[TripRecord]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity((records.len() + 1) * ESTIMATED_RECORD_SIZE));
    writer
        .write_record(TripField::ALL.iter().map(|f| f.input_column()))
        .context("writing duplicates header")?;
    for record in records {
        writer
            .write_record(
                TripField::ALL
                    .iter()
                    .map(|f| f.render(record, SECOND_PRECISION_FORMAT)),
            )
            .context("writing duplicate record")?;
    }
    writer.flush().context("flushing duplicates buffer")?;
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("finishing duplicates buffer: {}", err.error()))
}

/// Writes the duplicate set to `path` through a temp file and atomic rename.
pub async fn export_duplicates(path: &Path, records: &[TripRecord]) -> anyhow::Result<ExportedFile> {
    let bytes = encode_duplicates_csv(records)?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating export directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp export file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp export file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp export file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp export {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(ExportedFile {
        path: path.to_path_buf(),
        rows: records.len(),
        bytes: bytes.len() as u64,
        sha256: sha256_hex(&bytes),
    })
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use tempfile::tempdir;

    fn mk_record(minute: u32, flag: &str) -> TripRecord {
        TripRecord {
            pickup: Utc.with_ymd_and_hms(2024, 1, 15, 13, minute, 0).single().unwrap(),
            dropoff: Utc.with_ymd_and_hms(2024, 1, 15, 14, minute, 0).single().unwrap(),
            passenger_count: 1,
            trip_distance: Decimal::new(310, 2),
            store_and_fwd_flag: flag.to_string(),
            pickup_location_id: 48,
            dropoff_location_id: 68,
            fare_amount: Decimal::new(1450, 2),
            tip_amount: Decimal::new(0, 0),
        }
    }

    #[test]
    fn copy_statement_lists_mapped_columns_in_order() {
        let stmt = copy_statement("public.trips");
        assert_eq!(
            stmt,
            "COPY public.trips (pickup_datetime, dropoff_datetime, passenger_count, trip_distance, \
             store_and_fwd_flag, pickup_location_id, dropoff_location_id, fare_amount, tip_amount) \
             FROM STDIN WITH (FORMAT CSV, ENCODING 'UTF8')"
        );
    }

    #[test]
    fn copy_payload_follows_column_mapping() {
        let payload = encode_copy_payload(&[mk_record(30, "No, really")]).expect("encode");
        let text = String::from_utf8(payload).unwrap();
        assert_eq!(
            text,
            "2024-01-15 13:30:00+00,2024-01-15 14:30:00+00,1,3.10,\"No, really\",48,68,14.50,0\n"
        );
    }

    #[test]
    fn table_names_are_restricted_to_identifiers() {
        assert!(validate_table_name("trips").is_ok());
        assert!(validate_table_name("staging.trips_2024").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("trips; drop table x").is_err());
        assert!(validate_table_name("a.b.c").is_err());
        assert!(validate_table_name("1trips").is_err());
    }

    #[tokio::test]
    async fn memory_sink_keeps_batches_and_can_reject() {
        let sink = MemorySink::new();
        let loaded = sink.load(&[mk_record(1, "No"), mk_record(2, "Yes")]).await.expect("load");
        assert_eq!(loaded, 2);
        assert_eq!(sink.loaded().len(), 2);

        let rejecting = MemorySink::rejecting("disk full");
        let err = rejecting.load(&[mk_record(1, "No")]).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected(ref m) if m == "disk full"));
        assert!(rejecting.loaded().is_empty());
    }

    #[tokio::test]
    async fn memory_sink_contents_survive_a_poisoned_lock() {
        let sink = Arc::new(MemorySink::new());
        sink.load(&[mk_record(1, "No")]).await.expect("load");

        let holder = Arc::clone(&sink);
        let _ = std::thread::spawn(move || {
            let _guard = holder.loaded.lock().unwrap();
            panic!("poison the memory sink lock");
        })
        .join();

        assert!(sink.loaded.is_poisoned());
        assert_eq!(sink.loaded().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_export_uses_input_header_and_writes_atomically() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("duplicates.csv");
        let exported = export_duplicates(&path, &[mk_record(5, "Yes")])
            .await
            .expect("export");

        let text = std::fs::read_to_string(&path).expect("read export");
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("tpep_pickup_datetime,tpep_dropoff_datetime,passenger_count,trip_distance,store_and_fwd_flag,PULocationID,DOLocationID,fare_amount,tip_amount")
        );
        assert_eq!(
            lines.next(),
            Some("2024-01-15 13:05:00,2024-01-15 14:05:00,1,3.10,Yes,48,68,14.50,0")
        );
        assert_eq!(lines.next(), None);

        assert_eq!(exported.rows, 1);
        assert_eq!(exported.bytes, text.len() as u64);
        assert_eq!(exported.sha256, sha256_hex(text.as_bytes()));

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
