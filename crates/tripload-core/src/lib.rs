//! Core trip record model, field canonicalization and identity keys for tripload.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tripload-core";

pub const SECOND_PRECISION_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One trip row. `Ts` is the timestamp representation: naive local wall-clock
/// time straight out of the file, then an absolute UTC instant after conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trip<Ts> {
    pub pickup: Ts,
    pub dropoff: Ts,
    pub passenger_count: i32,
    pub trip_distance: Decimal,
    pub store_and_fwd_flag: String,
    pub pickup_location_id: i32,
    pub dropoff_location_id: i32,
    pub fare_amount: Decimal,
    pub tip_amount: Decimal,
}

pub type LocalTripRecord = Trip<NaiveDateTime>;

pub type TripRecord = Trip<DateTime<Utc>>;

impl<Ts> Trip<Ts> {
    pub fn normalize(&mut self) {
        self.store_and_fwd_flag = normalize_store_and_fwd_flag(&self.store_and_fwd_flag);
    }

    pub fn with_times<U>(self, pickup: U, dropoff: U) -> Trip<U> {
        Trip {
            pickup,
            dropoff,
            passenger_count: self.passenger_count,
            trip_distance: self.trip_distance,
            store_and_fwd_flag: self.store_and_fwd_flag,
            pickup_location_id: self.pickup_location_id,
            dropoff_location_id: self.dropoff_location_id,
            fare_amount: self.fare_amount,
            tip_amount: self.tip_amount,
        }
    }
}

impl TripRecord {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(&self.pickup, &self.dropoff, self.passenger_count)
    }

    pub fn pickup_after_dropoff(&self) -> bool {
        self.pickup > self.dropoff
    }
}

/// Canonicalizes a store-and-forward code: `N`/`Y` in any casing become
/// `No`/`Yes`, anything else is kept trimmed but otherwise verbatim.
pub fn normalize_store_and_fwd_flag(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("N") {
        "No".to_string()
    } else if trimmed.eq_ignore_ascii_case("Y") {
        "Yes".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(pickup: &DateTime<Utc>, dropoff: &DateTime<Utc>, passenger_count: i32) -> Self {
        Self(format!(
            "{}|{}|{}",
            pickup.format(SECOND_PRECISION_FORMAT),
            dropoff.format(SECOND_PRECISION_FORMAT),
            passenger_count
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TripField {
    Pickup,
    Dropoff,
    PassengerCount,
    TripDistance,
    StoreAndFwdFlag,
    PickupLocationId,
    DropoffLocationId,
    FareAmount,
    TipAmount,
}

impl TripField {
    pub const ALL: [TripField; 9] = [
        TripField::Pickup,
        TripField::Dropoff,
        TripField::PassengerCount,
        TripField::TripDistance,
        TripField::StoreAndFwdFlag,
        TripField::PickupLocationId,
        TripField::DropoffLocationId,
        TripField::FareAmount,
        TripField::TipAmount,
    ];

    pub fn input_column(self) -> &'static str {
        match self {
            TripField::Pickup => "tpep_pickup_datetime",
            TripField::Dropoff => "tpep_dropoff_datetime",
            TripField::PassengerCount => "passenger_count",
            TripField::TripDistance => "trip_distance",
            TripField::StoreAndFwdFlag => "store_and_fwd_flag",
            TripField::PickupLocationId => "PULocationID",
            TripField::DropoffLocationId => "DOLocationID",
            TripField::FareAmount => "fare_amount",
            TripField::TipAmount => "tip_amount",
        }
    }

    pub fn render(self, record: &TripRecord, timestamp_format: &str) -> String {
        match self {
            TripField::Pickup => record.pickup.format(timestamp_format).to_string(),
            TripField::Dropoff => record.dropoff.format(timestamp_format).to_string(),
            TripField::PassengerCount => record.passenger_count.to_string(),
            TripField::TripDistance => record.trip_distance.to_string(),
            TripField::StoreAndFwdFlag => record.store_and_fwd_flag.clone(),
            TripField::PickupLocationId => record.pickup_location_id.to_string(),
            TripField::DropoffLocationId => record.dropoff_location_id.to_string(),
            TripField::FareAmount => record.fare_amount.to_string(),
            TripField::TipAmount => record.tip_amount.to_string(),
        }
    }
}
