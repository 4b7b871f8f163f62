//! SQLite storage: location catalog and the `sensor_data` fact table.
//!
//! Timestamps are stored as Unix epoch microseconds (UTC) so bucketing is plain
//! integer arithmetic. The connection sits behind a `Mutex` and is only
//! locked for synchronous calls, never across `.await` points.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{
    Bucket, DataPointRow, DataPointsParams, SensorStore, StoreError, StoreResult, SummaryRow,
};
use crate::model::{ApiSensor, Location, LocationSensor, SensorReading, SensorType};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS locations (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        sid         TEXT NOT NULL UNIQUE,
        name        TEXT NOT NULL,
        latitude    REAL NOT NULL,
        longitude   REAL NOT NULL
    );

    CREATE TABLE IF NOT EXISTS location_sensors (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        location_id INTEGER NOT NULL REFERENCES locations(id),
        sid         TEXT NOT NULL,
        type        TEXT NOT NULL CHECK (type IN ('api', 'local')),
        UNIQUE (location_id, sid)
    );

    CREATE TABLE IF NOT EXISTS sensor_data (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        location_sensor_id  INTEGER NOT NULL REFERENCES location_sensors(id),
        recorded_at_us      INTEGER NOT NULL,
        temperature         REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_sensor_data_sensor_ts
        ON sensor_data(location_sensor_id, recorded_at_us);
";

/// SQLite-backed sensor store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    ///
    /// Creates all tables if they don't exist and enables WAL so the API
    /// can read while the reader writes.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        log::debug!("[Store] opened {}", path.display());
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert a location, or return the existing one with the same sid.
    pub fn create_location(
        &self,
        sid: &str,
        name: &str,
        latitude: f64,
        longitude: f64,
    ) -> StoreResult<Location> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO locations (sid, name, latitude, longitude) \
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT(sid) DO NOTHING",
            params![sid, name, latitude, longitude],
        )?;
        let location = conn.query_row(
            "SELECT id, sid, name, latitude, longitude FROM locations WHERE sid = ?1",
            params![sid],
            |row| {
                Ok(Location {
                    id: row.get(0)?,
                    sid: row.get(1)?,
                    name: row.get(2)?,
                    latitude: row.get(3)?,
                    longitude: row.get(4)?,
                })
            },
        )?;
        Ok(location)
    }

    /// Attach a sensor to a location, or return the existing one with the
    /// same sid at that location.
    pub fn create_location_sensor(
        &self,
        location_id: i64,
        sid: &str,
        sensor_type: SensorType,
    ) -> StoreResult<LocationSensor> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO location_sensors (location_id, sid, type) \
             VALUES (?1, ?2, ?3) ON CONFLICT(location_id, sid) DO NOTHING",
            params![location_id, sid, sensor_type.as_str()],
        )?;
        let (id, kind): (i64, String) = conn.query_row(
            "SELECT id, type FROM location_sensors WHERE location_id = ?1 AND sid = ?2",
            params![location_id, sid],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(LocationSensor {
            id,
            location_id,
            sid: sid.to_string(),
            sensor_type: parse_type(&kind)?,
        })
    }
}

fn parse_type(value: &str) -> StoreResult<SensorType> {
    value.parse().map_err(StoreError::Corrupt)
}

fn from_micros(micros: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}us", micros)))
}

fn day_bounds(day: NaiveDate) -> StoreResult<(i64, i64)> {
    let start = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid day: {}", day)))?
        .and_utc()
        .timestamp_micros();
    Ok((start, start + Bucket::Day.micros()))
}

#[async_trait]
impl SensorStore for SqliteStore {
    async fn list_api_sensors(&self) -> StoreResult<Vec<ApiSensor>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT l.id, l.sid, l.name, l.latitude, l.longitude, s.id, s.sid \
             FROM locations l JOIN location_sensors s ON s.location_id = l.id \
             WHERE s.type = 'api' ORDER BY l.sid, s.sid",
        )?;
        let rows = stmt.query_map([], |row| {
            let location = Location {
                id: row.get(0)?,
                sid: row.get(1)?,
                name: row.get(2)?,
                latitude: row.get(3)?,
                longitude: row.get(4)?,
            };
            let sensor = LocationSensor {
                id: row.get(5)?,
                location_id: location.id,
                sid: row.get(6)?,
                sensor_type: SensorType::Api,
            };
            Ok(ApiSensor { location, sensor })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn location_sensor_id(
        &self,
        location_sid: &str,
        sensor_sid: &str,
    ) -> StoreResult<Option<i64>> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT s.id FROM location_sensors s \
                 JOIN locations l ON l.id = s.location_id \
                 WHERE l.sid = ?1 AND s.sid = ?2",
                params![location_sid, sensor_sid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    async fn insert_readings(&self, readings: &[SensorReading]) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sensor_data (location_sensor_id, recorded_at_us, temperature) \
                 VALUES (?1, ?2, ?3)",
            )?;
            for reading in readings {
                stmt.execute(params![
                    reading.location_sensor_id,
                    reading.timestamp.timestamp_micros(),
                    reading.temperature,
                ])?;
            }
        }
        tx.commit()?;
        Ok(readings.len())
    }

    async fn location_exists(&self, location_sid: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM locations WHERE sid = ?1)",
            params![location_sid],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    async fn day_summary(
        &self,
        location_sid: &str,
        day: NaiveDate,
    ) -> StoreResult<Vec<SummaryRow>> {
        let (start, end) = day_bounds(day)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT s.type, MAX(d.recorded_at_us), AVG(d.temperature) \
             FROM sensor_data d \
             JOIN location_sensors s ON s.id = d.location_sensor_id \
             JOIN locations l ON l.id = s.location_id \
             WHERE l.sid = ?1 AND d.recorded_at_us >= ?2 AND d.recorded_at_us < ?3 \
             GROUP BY s.type ORDER BY s.type",
        )?;
        let rows = stmt
            .query_map(params![location_sid, start, end], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(kind, latest, avg)| -> StoreResult<SummaryRow> {
                Ok(SummaryRow {
                    sensor_type: parse_type(&kind)?,
                    timestamp: from_micros(latest)?,
                    avg_temperature: avg,
                })
            })
            .collect()
    }

    async fn data_points(&self, params: &DataPointsParams) -> StoreResult<Vec<DataPointRow>> {
        let include_api = params.types.contains(&SensorType::Api);
        let include_local = params.types.contains(&SensorType::Local);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT s.type, (d.recorded_at_us / ?4) * ?4 AS bucket, AVG(d.temperature) \
             FROM sensor_data d \
             JOIN location_sensors s ON s.id = d.location_sensor_id \
             JOIN locations l ON l.id = s.location_id \
             WHERE l.sid = ?1 AND d.recorded_at_us >= ?2 AND d.recorded_at_us < ?3 \
               AND ((?5 AND s.type = 'api') OR (?6 AND s.type = 'local')) \
             GROUP BY s.type, bucket \
             ORDER BY bucket, s.type",
        )?;
        let rows = stmt
            .query_map(
                params![
                    params.location_sid,
                    params.start.timestamp_micros(),
                    params.end.timestamp_micros(),
                    params.bucket.micros(),
                    include_api,
                    include_local,
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(kind, bucket, avg)| -> StoreResult<DataPointRow> {
                Ok(DataPointRow {
                    sensor_type: parse_type(&kind)?,
                    time: from_micros(bucket)?,
                    avg_temperature: avg,
                })
            })
            .collect()
    }

    async fn list_locations(&self) -> StoreResult<Vec<Location>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, sid, name, latitude, longitude FROM locations ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Location {
                id: row.get(0)?,
                sid: row.get(1)?,
                name: row.get(2)?,
                latitude: row.get(3)?,
                longitude: row.get(4)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }
}
