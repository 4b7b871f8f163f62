//! Catalog and reading types shared by the ingestion and query paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of location sensor.
///
/// `api` sensors are fed by the weather crawler, `local` sensors are
/// physical devices publishing over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Api,
    Local,
}

impl SensorType {
    pub fn as_str(self) -> &'static str {
        match self {
            SensorType::Api => "api",
            SensorType::Local => "local",
        }
    }
}

impl std::fmt::Display for SensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SensorType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(SensorType::Api),
            "local" => Ok(SensorType::Local),
            _ => Err(format!(
                "unknown sensor type '{}', must be api or local",
                s
            )),
        }
    }
}

/// A monitored place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub id: i64,
    pub sid: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// A sensor attached to exactly one location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationSensor {
    pub id: i64,
    pub location_id: i64,
    pub sid: String,
    #[serde(rename = "type")]
    pub sensor_type: SensorType,
}

/// A location paired with one of its `api` sensors, as polled by the crawler.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiSensor {
    pub location: Location,
    pub sensor: LocationSensor,
}

/// Reading returned by the weather provider. Never stored directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherReading {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
}

/// One stored temperature fact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub location_sensor_id: i64,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
}
