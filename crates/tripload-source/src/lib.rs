//! Delimited trip-file row source + typed field extraction.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDateTime;
use csv::{ReaderBuilder, StringRecord};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;
use tripload_core::{LocalTripRecord, TripField};

pub const CRATE_NAME: &str = "tripload-source";

pub const TIMESTAMP_FORMATS: [&str; 3] = [
    "%m/%d/%Y %I:%M:%S %p",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub row_number: u64,
    pub fields: HashMap<String, String>,
}

impl RawRow {
    pub fn new(row_number: u64, fields: HashMap<String, String>) -> Self {
        Self { row_number, fields }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("opening input {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("input header is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("reading input: {0}")]
    Read(#[source] csv::Error),
    #[error("row {row}: {message}")]
    Decode { row: u64, message: String },
}

impl SourceError {
    pub fn is_row_scoped(&self) -> bool {
        matches!(self, SourceError::Decode { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("missing field {field}")]
    Missing { field: &'static str },
    #[error("field {field} has invalid value {value:?}: {reason}")]
    Invalid {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Lazy, single-pass row source over delimited text with a header row.
///
/// Yields `Err(SourceError::Decode)` for a row that cannot be decoded and keeps
/// going; an underlying I/O failure is yielded once as `SourceError::Read` and
/// ends the sequence.
pub struct CsvRowSource<R: Read> {
    reader: csv::Reader<R>,
    headers: Vec<String>,
    record: StringRecord,
    rows_read: u64,
    finished: bool,
}

impl CsvRowSource<File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|source| SourceError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Self::with_reader(reader)
    }
}

impl<R: Read> CsvRowSource<R> {
    pub fn from_reader(input: R) -> Result<Self, SourceError> {
        Self::with_reader(ReaderBuilder::new().has_headers(true).from_reader(input))
    }

    fn with_reader(mut reader: csv::Reader<R>) -> Result<Self, SourceError> {
        let headers = reader
            .headers()
            .map_err(SourceError::Read)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();

        let missing = TripField::ALL
            .iter()
            .map(|f| f.input_column())
            .filter(|column| !headers.iter().any(|h| h == column))
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(SourceError::MissingColumns(missing));
        }

        Ok(Self {
            reader,
            headers,
            record: StringRecord::new(),
            rows_read: 0,
            finished: false,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }
}

impl<R: Read> Iterator for CsvRowSource<R> {
    type Item = Result<RawRow, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.reader.read_record(&mut self.record) {
            Ok(false) => {
                self.finished = true;
                None
            }
            Ok(true) => {
                self.rows_read += 1;
                let fields = self
                    .headers
                    .iter()
                    .cloned()
                    .zip(self.record.iter().map(ToString::to_string))
                    .collect();
                Some(Ok(RawRow::new(self.rows_read, fields)))
            }
            Err(err) if err.is_io_error() => {
                self.finished = true;
                Some(Err(SourceError::Read(err)))
            }
            Err(err) => {
                self.rows_read += 1;
                Some(Err(SourceError::Decode {
                    row: self.rows_read,
                    message: err.to_string(),
                }))
            }
        }
    }
}

pub fn extract_trip(row: &RawRow) -> Result<LocalTripRecord, ExtractError> {
    let trip_distance = parse_decimal(row, TripField::TripDistance)?
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

    Ok(LocalTripRecord {
        pickup: parse_timestamp(row, TripField::Pickup)?,
        dropoff: parse_timestamp(row, TripField::Dropoff)?,
        passenger_count: parse_int(row, TripField::PassengerCount)?,
        trip_distance,
        store_and_fwd_flag: field(row, TripField::StoreAndFwdFlag)?.to_string(),
        pickup_location_id: parse_int(row, TripField::PickupLocationId)?,
        dropoff_location_id: parse_int(row, TripField::DropoffLocationId)?,
        fare_amount: parse_decimal(row, TripField::FareAmount)?,
        tip_amount: parse_decimal(row, TripField::TipAmount)?,
    })
}

pub fn parse_local_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

fn field(row: &RawRow, field: TripField) -> Result<&str, ExtractError> {
    row.get(field.input_column()).ok_or(ExtractError::Missing {
        field: field.input_column(),
    })
}

fn invalid(field: TripField, value: &str, reason: impl ToString) -> ExtractError {
    ExtractError::Invalid {
        field: field.input_column(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_timestamp(row: &RawRow, f: TripField) -> Result<NaiveDateTime, ExtractError> {
    let value = field(row, f)?;
    parse_local_timestamp(value).ok_or_else(|| invalid(f, value, "unrecognized date-time format"))
}

fn parse_int(row: &RawRow, f: TripField) -> Result<i32, ExtractError> {
    let value = field(row, f)?;
    value.trim().parse::<i32>().map_err(|e| invalid(f, value, e))
}

fn parse_decimal(row: &RawRow, f: TripField) -> Result<Decimal, ExtractError> {
    let value = field(row, f)?;
    Decimal::from_str(value.trim()).map_err(|e| invalid(f, value, e))
}
