use chrono::DateTime;
use chrono_tz::Tz;

#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    /// Decode time. The store replaces it with the write time.
    pub captured_at: DateTime<Tz>,

    pub temperature_celsius: f64,

    pub humidity_percent: u8,
}

/// A reading after it has been written to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReading {
    pub id: i64,

    pub reading: SensorReading,
}
