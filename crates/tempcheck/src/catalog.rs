//! Location catalog loaded from YAML and written into the store.
//!
//! ```yaml
//! locations:
//!   - sid: warsaw
//!     name: Warsaw
//!     latitude: 52.2297
//!     longitude: 21.0122
//!     sensors:
//!       - sid: openmeteo
//!         type: api
//!       - sid: balcony
//!         type: local
//! ```

use serde::Deserialize;
use std::collections::HashSet;

use crate::config::ConfigError;
use crate::model::SensorType;
use crate::store::{SqliteStore, StoreError};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub locations: Vec<CatalogLocation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogLocation {
    pub sid: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub sensors: Vec<CatalogSensor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSensor {
    pub sid: String,
    #[serde(rename = "type")]
    pub sensor_type: SensorType,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Load(#[from] ConfigError),
    #[error("invalid catalog: {0}")]
    Invalid(String),
    #[error("seed store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub locations: usize,
    pub sensors: usize,
}

fn check_sid(kind: &str, sid: &str) -> Result<(), CatalogError> {
    if sid.is_empty() || sid.contains(['/', '+', '#']) || sid.trim() != sid {
        return Err(CatalogError::Invalid(format!(
            "{} sid {:?} must be non-empty without '/', '+', '#' or surrounding spaces",
            kind, sid
        )));
    }
    Ok(())
}

impl Catalog {
    /// Sids must be usable as topic segments and unique in their scope.
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for location in &self.locations {
            check_sid("location", &location.sid)?;
            if !seen.insert(location.sid.as_str()) {
                return Err(CatalogError::Invalid(format!(
                    "duplicate location sid {:?}",
                    location.sid
                )));
            }
            if !(-90.0..=90.0).contains(&location.latitude)
                || !(-180.0..=180.0).contains(&location.longitude)
            {
                return Err(CatalogError::Invalid(format!(
                    "location {:?} has out of range coordinates",
                    location.sid
                )));
            }

            let mut sensors = HashSet::new();
            for sensor in &location.sensors {
                check_sid("sensor", &sensor.sid)?;
                if !sensors.insert(sensor.sid.as_str()) {
                    return Err(CatalogError::Invalid(format!(
                        "duplicate sensor sid {:?} at {:?}",
                        sensor.sid, location.sid
                    )));
                }
            }
        }
        Ok(())
    }
}

pub fn parse_catalog(yaml: &str) -> Result<Catalog, CatalogError> {
    let catalog: Catalog = crate::config::parse_config(yaml)?;
    catalog.validate()?;
    Ok(catalog)
}

pub fn load_catalog(path: impl AsRef<std::path::Path>) -> Result<Catalog, CatalogError> {
    let catalog: Catalog = crate::config::load_config(path)?;
    catalog.validate()?;
    Ok(catalog)
}

/// Write every location and sensor. Existing sids are left as they are.
pub fn seed(store: &SqliteStore, catalog: &Catalog) -> Result<SeedReport, CatalogError> {
    catalog.validate()?;
    let mut report = SeedReport::default();
    for entry in &catalog.locations {
        let location =
            store.create_location(&entry.sid, &entry.name, entry.latitude, entry.longitude)?;
        report.locations += 1;
        for sensor in &entry.sensors {
            store.create_location_sensor(location.id, &sensor.sid, sensor.sensor_type)?;
            report.sensors += 1;
        }
        log::info!(
            "[Seed] location {} with {} sensors",
            location.sid,
            entry.sensors.len()
        );
    }
    Ok(report)
}
