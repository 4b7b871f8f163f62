//! Storage capability used by the crawler, reader and query service.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::model::{ApiSensor, Location, SensorReading, SensorType};

pub use sqlite::SqliteStore;

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Time bucket for aggregated data points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bucket {
    #[default]
    Hour,
    Day,
}

impl Bucket {
    /// Bucket width in microseconds, the unit readings are stored in.
    pub fn micros(self) -> i64 {
        match self {
            Bucket::Hour => 3_600_000_000,
            Bucket::Day => 86_400_000_000,
        }
    }
}

/// Today's average for one sensor type at a location.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub sensor_type: SensorType,
    /// Time of the latest reading included in the average.
    pub timestamp: DateTime<Utc>,
    pub avg_temperature: f64,
}

/// Parameters of a time-series query. The window is `[start, end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPointsParams {
    pub location_sid: String,
    pub types: Vec<SensorType>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: Bucket,
}

/// One averaged bucket of a time series.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPointRow {
    pub sensor_type: SensorType,
    /// Start of the bucket.
    pub time: DateTime<Utc>,
    pub avg_temperature: f64,
}

/// Query and write operations over the catalog and the readings table.
#[async_trait]
pub trait SensorStore: Send + Sync {
    /// Every location paired with each of its `api` sensors.
    async fn list_api_sensors(&self) -> StoreResult<Vec<ApiSensor>>;

    /// Resolve a sensor by its location and sensor sids.
    async fn location_sensor_id(
        &self,
        location_sid: &str,
        sensor_sid: &str,
    ) -> StoreResult<Option<i64>>;

    /// Append readings in order. Returns the number of rows written.
    async fn insert_readings(&self, readings: &[SensorReading]) -> StoreResult<usize>;

    async fn location_exists(&self, location_sid: &str) -> StoreResult<bool>;

    /// Per-type average of the readings recorded on `day` (UTC).
    async fn day_summary(&self, location_sid: &str, day: NaiveDate) -> StoreResult<Vec<SummaryRow>>;

    /// Averaged readings per type and bucket, ordered by bucket then type.
    async fn data_points(&self, params: &DataPointsParams) -> StoreResult<Vec<DataPointRow>>;

    async fn list_locations(&self) -> StoreResult<Vec<Location>>;
}

#[cfg(test)]
pub mod mock {
    //! Scripted store for component tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockStore {
        pub api_sensors: Vec<ApiSensor>,
        /// `(location_sid, sensor_sid, id)`
        pub sensor_ids: Vec<(String, String, i64)>,
        pub locations: Vec<Location>,
        pub summary: Vec<SummaryRow>,
        pub points: Vec<DataPointRow>,
        pub fail: bool,
        pub inserted: Mutex<Vec<SensorReading>>,
        pub data_calls: Mutex<Vec<DataPointsParams>>,
    }

    impl MockStore {
        fn check(&self) -> StoreResult<()> {
            if self.fail {
                Err(StoreError::Corrupt("mock failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SensorStore for MockStore {
        async fn list_api_sensors(&self) -> StoreResult<Vec<ApiSensor>> {
            self.check()?;
            Ok(self.api_sensors.clone())
        }

        async fn location_sensor_id(
            &self,
            location_sid: &str,
            sensor_sid: &str,
        ) -> StoreResult<Option<i64>> {
            self.check()?;
            Ok(self
                .sensor_ids
                .iter()
                .find(|(l, s, _)| l == location_sid && s == sensor_sid)
                .map(|(_, _, id)| *id))
        }

        async fn insert_readings(&self, readings: &[SensorReading]) -> StoreResult<usize> {
            self.check()?;
            self.inserted.lock().unwrap().extend_from_slice(readings);
            Ok(readings.len())
        }

        async fn location_exists(&self, location_sid: &str) -> StoreResult<bool> {
            self.check()?;
            Ok(self.locations.iter().any(|l| l.sid == location_sid))
        }

        async fn day_summary(&self, _: &str, _: NaiveDate) -> StoreResult<Vec<SummaryRow>> {
            self.check()?;
            Ok(self.summary.clone())
        }

        async fn data_points(&self, params: &DataPointsParams) -> StoreResult<Vec<DataPointRow>> {
            self.check()?;
            self.data_calls.lock().unwrap().push(params.clone());
            Ok(self.points.clone())
        }

        async fn list_locations(&self) -> StoreResult<Vec<Location>> {
            self.check()?;
            Ok(self.locations.clone())
        }
    }
}
