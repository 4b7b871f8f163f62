//! Current-weather source backed by the Open-Meteo forecast API.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::config::WeatherConfig;
use crate::model::WeatherReading;

/// Timestamp format of `current_weather.time` (local time, no zone).
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Errors from weather fetches.
///
/// Everything except [`WeatherError::Parse`] means the provider could not
/// be reached or answered with an unusable response.
#[derive(Debug, thiserror::Error)]
pub enum WeatherError {
    #[error("HTTP error: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("provider returned status {status}")]
    Status { status: u16 },

    #[error("decode response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("parse current weather time {value:?}: {source}")]
    Parse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

impl WeatherError {
    /// True when the provider answered but its data was unparseable.
    pub fn is_parse(&self) -> bool {
        matches!(self, WeatherError::Parse { .. })
    }
}

/// Something that can report the current temperature at a coordinate.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn fetch(&self, latitude: f64, longitude: f64)
        -> Result<Vec<WeatherReading>, WeatherError>;
}

/// Forecast response; everything besides `current_weather` is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenMeteoResponse {
    pub current_weather: CurrentWeather,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrentWeather {
    pub time: String,
    pub temperature: f64,
}

/// Open-Meteo client.
#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpenMeteoClient {
    pub fn new(config: &WeatherConfig) -> Result<Self, WeatherError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("tempcheck/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
        })
    }

    fn build_url(&self, latitude: f64, longitude: f64) -> String {
        format!(
            "{}?current_weather=true&latitude={:.6}&longitude={:.6}",
            self.base_url, latitude, longitude
        )
    }
}

/// Turn a forecast response into readings. The zone-less local time is
/// taken as UTC, which is what Open-Meteo reports unless asked otherwise.
pub fn map_response(response: &OpenMeteoResponse) -> Result<Vec<WeatherReading>, WeatherError> {
    let current = &response.current_weather;
    let timestamp = NaiveDateTime::parse_from_str(&current.time, TIME_FORMAT)
        .map_err(|source| WeatherError::Parse {
            value: current.time.clone(),
            source,
        })?
        .and_utc();
    Ok(vec![WeatherReading {
        timestamp,
        temperature: current.temperature,
    }])
}

#[async_trait]
impl WeatherSource for OpenMeteoClient {
    async fn fetch(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<Vec<WeatherReading>, WeatherError> {
        let url = self.build_url(latitude, longitude);
        log::debug!("[Weather] GET {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WeatherError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let parsed: OpenMeteoResponse =
            serde_json::from_slice(&body).map_err(WeatherError::Decode)?;
        map_response(&parsed)
    }
}
