//! Read-side operations: daily summary, time series and location list.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::model::SensorType;
use crate::store::{Bucket, DataPointsParams, SensorStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("location not found")]
    LocationNotFound,

    #[error("unexpected sensors summary: {rows} rows")]
    UnexpectedSummary { rows: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Daily summary request.
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryQuery {
    #[serde(default)]
    pub location_sid: String,
}

/// One side of a summary. `trend` is reserved and always 0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryItem {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub trend: i32,
}

/// Both keys are always present; a type without readings today is `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub api: Option<SummaryItem>,
    pub local: Option<SummaryItem>,
}

/// Query-string form of a data request, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDataQuery {
    pub location_sid: Option<String>,
    pub start_datetime: Option<String>,
    pub end_datetime: Option<String>,
    pub aggregation: Option<String>,
    /// Comma separated, e.g. `api,local`.
    pub types: Option<String>,
}

/// Validated time-series request.
#[derive(Debug, Clone, PartialEq)]
pub struct DataQuery {
    pub location_sid: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub aggregation: Option<String>,
    pub types: Vec<SensorType>,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, QueryError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(QueryError::Validation(format!("{} is required", name))),
    }
}

fn parse_time(value: &str, name: &str) -> Result<DateTime<Utc>, QueryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QueryError::Validation(format!("{} must be RFC 3339: {}", name, e)))
}

impl DataQuery {
    pub fn parse(raw: &RawDataQuery) -> Result<Self, QueryError> {
        let location_sid = required(&raw.location_sid, "location_sid")?.to_string();
        let start = parse_time(required(&raw.start_datetime, "start_datetime")?, "start_datetime")?;
        let end = parse_time(required(&raw.end_datetime, "end_datetime")?, "end_datetime")?;

        let mut types = Vec::new();
        for part in raw.types.as_deref().unwrap_or_default().split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let sensor_type: SensorType = part.parse().map_err(QueryError::Validation)?;
            if !types.contains(&sensor_type) {
                types.push(sensor_type);
            }
        }

        let aggregation = raw
            .aggregation
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);

        let query = Self {
            location_sid,
            start,
            end,
            aggregation,
            types,
        };
        query.validate()?;
        Ok(query)
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        if self.location_sid.is_empty() {
            return Err(QueryError::Validation("location_sid is required".into()));
        }
        if self.types.is_empty() {
            return Err(QueryError::Validation(
                "types must contain at least one of api, local".into(),
            ));
        }
        if self.start >= self.end {
            return Err(QueryError::Validation(
                "start_datetime must be before end_datetime".into(),
            ));
        }
        self.bucket().map(|_| ())
    }

    /// `day` selects daily buckets, anything unset is hourly.
    pub fn bucket(&self) -> Result<Bucket, QueryError> {
        match self.aggregation.as_deref() {
            None => Ok(Bucket::Hour),
            Some("day") => Ok(Bucket::Day),
            Some(other) => Err(QueryError::Validation(format!(
                "unknown aggregation '{}', must be day",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataPoint {
    #[serde(rename = "type")]
    pub sensor_type: SensorType,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationInfo {
    pub sid: String,
    pub name: String,
}

pub struct QueryService {
    store: Arc<dyn SensorStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn SensorStore>) -> Self {
        Self { store }
    }

    /// Today's (UTC) averages per sensor type.
    pub async fn summary(&self, query: &SummaryQuery) -> Result<Summary, QueryError> {
        self.summary_for_day(query, Utc::now().date_naive()).await
    }

    pub async fn summary_for_day(
        &self,
        query: &SummaryQuery,
        day: NaiveDate,
    ) -> Result<Summary, QueryError> {
        if query.location_sid.trim().is_empty() {
            return Err(QueryError::Validation("location_sid is required".into()));
        }
        if !self.store.location_exists(&query.location_sid).await? {
            return Err(QueryError::LocationNotFound);
        }

        let rows = self.store.day_summary(&query.location_sid, day).await?;
        if rows.len() > 2 {
            return Err(QueryError::UnexpectedSummary { rows: rows.len() });
        }

        let mut summary = Summary::default();
        for row in rows {
            let item = SummaryItem {
                timestamp: row.timestamp,
                temperature: row.avg_temperature,
                trend: 0,
            };
            match row.sensor_type {
                SensorType::Api => summary.api = Some(item),
                SensorType::Local => summary.local = Some(item),
            }
        }
        Ok(summary)
    }

    pub async fn data(&self, query: &DataQuery) -> Result<Vec<DataPoint>, QueryError> {
        query.validate()?;
        if !self.store.location_exists(&query.location_sid).await? {
            return Err(QueryError::LocationNotFound);
        }

        let params = DataPointsParams {
            location_sid: query.location_sid.clone(),
            types: query.types.clone(),
            start: query.start,
            end: query.end,
            bucket: query.bucket()?,
        };
        let rows = self.store.data_points(&params).await?;
        Ok(rows
            .into_iter()
            .map(|row| DataPoint {
                sensor_type: row.sensor_type,
                timestamp: row.time,
                temperature: row.avg_temperature,
            })
            .collect())
    }

    pub async fn locations(&self) -> Result<Vec<LocationInfo>, QueryError> {
        let locations = self.store.list_locations().await?;
        Ok(locations
            .into_iter()
            .map(|l| LocationInfo {
                sid: l.sid,
                name: l.name,
            })
            .collect())
    }
}
