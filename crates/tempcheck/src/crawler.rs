//! Weather crawler.
//!
//! One pass pulls the current temperature for every location `api` sensor
//! and republishes it on the sensor's bus topic, where the reader picks it
//! up like any physical sensor. Pairs are independent: a failure is recorded
//! with its pair and stage and the pass carries on.

use chrono::SecondsFormat;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;

use crate::bus::{sensor_topic, BusError, MessageBus, MessagePayload};
use crate::model::{ApiSensor, WeatherReading};
use crate::store::{SensorStore, StoreError};
use crate::weather::{WeatherError, WeatherSource};

/// Failure of a single location sensor within a pass.
#[derive(Debug, thiserror::Error)]
pub enum PairError {
    #[error("get weather for {location_sid}/{sensor_sid}: {source}")]
    Fetch {
        location_sid: String,
        sensor_sid: String,
        source: WeatherError,
    },

    #[error("publish temperature data to {topic}: {source}")]
    Publish {
        location_sid: String,
        sensor_sid: String,
        topic: String,
        source: BusError,
    },
}

impl PairError {
    /// `(location_sid, sensor_sid)` of the failed pair.
    pub fn pair(&self) -> (&str, &str) {
        match self {
            PairError::Fetch {
                location_sid,
                sensor_sid,
                ..
            }
            | PairError::Publish {
                location_sid,
                sensor_sid,
                ..
            } => (location_sid, sensor_sid),
        }
    }
}

/// Outcome of a crawl pass that did not fully succeed.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("list api sensors: {0}")]
    Catalog(#[source] StoreError),

    /// Every per-pair failure, one per line.
    #[error("{}", join_errors(.0))]
    Pairs(Vec<PairError>),
}

impl CrawlError {
    /// Individual pair failures (empty for catalog errors).
    pub fn failures(&self) -> &[PairError] {
        match self {
            CrawlError::Pairs(failures) => failures,
            CrawlError::Catalog(_) => &[],
        }
    }
}

fn join_errors(errors: &[PairError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Counters for a completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    /// Pairs fetched and published.
    pub published: usize,
    /// Readings published across all pairs.
    pub readings: usize,
    /// Pairs dropped because shutdown arrived mid-pass.
    pub cancelled: usize,
}

/// Two decimals, rounded to nearest.
pub fn format_temperature(temperature: f64) -> String {
    format!("{:.2}", temperature)
}

/// Wire entries for a batch of weather readings.
pub fn to_payload(readings: &[WeatherReading]) -> Vec<MessagePayload> {
    readings
        .iter()
        .map(|r| {
            vec![
                format_temperature(r.temperature),
                r.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            ]
        })
        .collect()
}

pub struct Crawler {
    store: Arc<dyn SensorStore>,
    weather: Arc<dyn WeatherSource>,
    bus: Arc<dyn MessageBus>,
    concurrency: usize,
}

impl Crawler {
    pub fn new(
        store: Arc<dyn SensorStore>,
        weather: Arc<dyn WeatherSource>,
        bus: Arc<dyn MessageBus>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            weather,
            bus,
            concurrency: concurrency.max(1),
        }
    }

    /// Run one pass over all `api` sensors.
    ///
    /// Returns once every pair has completed, or early when `shutdown`
    /// fires; in-flight pairs are then dropped and counted as cancelled.
    pub async fn crawl(
        &self,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<CrawlReport, CrawlError> {
        let pairs = self
            .store
            .list_api_sensors()
            .await
            .map_err(CrawlError::Catalog)?;
        log::info!("[Crawler] crawling {} api sensors", pairs.len());

        let total = pairs.len();
        let mut report = CrawlReport::default();
        let mut failures = Vec::new();
        let mut completed = 0;

        // Owned items keep the pass future `Send` so it can be spawned.
        let mut pulls = stream::iter(pairs)
            .map(|pair| async move { self.pull(&pair).await })
            .buffer_unordered(self.concurrency);

        loop {
            tokio::select! {
                next = pulls.next() => match next {
                    Some(Ok(readings)) => {
                        completed += 1;
                        report.published += 1;
                        report.readings += readings;
                    }
                    Some(Err(e)) => {
                        completed += 1;
                        log::warn!("[Crawler] {}", e);
                        failures.push(e);
                    }
                    None => break,
                },
                Ok(()) = shutdown.changed() => {
                    report.cancelled = total - completed;
                    log::warn!(
                        "[Crawler] shutdown mid-pass, {} sensors not crawled",
                        report.cancelled
                    );
                    break;
                }
            }
        }

        if failures.is_empty() {
            log::info!(
                "[Crawler] pass complete: {} sensors, {} readings",
                report.published,
                report.readings
            );
            Ok(report)
        } else {
            Err(CrawlError::Pairs(failures))
        }
    }

    /// Fetch and publish one pair. Returns the number of readings published.
    async fn pull(&self, pair: &ApiSensor) -> Result<usize, PairError> {
        let location = &pair.location;
        let sensor = &pair.sensor;

        let readings = self
            .weather
            .fetch(location.latitude, location.longitude)
            .await
            .map_err(|source| PairError::Fetch {
                location_sid: location.sid.clone(),
                sensor_sid: sensor.sid.clone(),
                source,
            })?;

        let topic = sensor_topic(&location.sid, &sensor.sid);
        let payload = to_payload(&readings);
        log::debug!("[Crawler] publishing {:?} to {}", payload, topic);

        self.bus
            .publish(&topic, &payload)
            .await
            .map_err(|source| PairError::Publish {
                location_sid: location.sid.clone(),
                sensor_sid: sensor.sid.clone(),
                topic: topic.clone(),
                source,
            })?;

        Ok(readings.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Subscription;
    use crate::model::{Location, LocationSensor, SensorType};
    use crate::store::mock::MockStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::error::Error as _;
    use std::sync::Mutex;

    struct StubWeather {
        result: fn() -> Result<Vec<WeatherReading>, WeatherError>,
        calls: Mutex<Vec<(f64, f64)>>,
    }

    impl StubWeather {
        fn new(result: fn() -> Result<Vec<WeatherReading>, WeatherError>) -> Self {
            Self {
                result,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WeatherSource for StubWeather {
        async fn fetch(
            &self,
            latitude: f64,
            longitude: f64,
        ) -> Result<Vec<WeatherReading>, WeatherError> {
            self.calls.lock().unwrap().push((latitude, longitude));
            (self.result)()
        }
    }

    #[derive(Default)]
    struct RecordingBus {
        fail: bool,
        published: Mutex<Vec<(String, Vec<MessagePayload>)>>,
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, topic: &str, payload: &[MessagePayload]) -> Result<(), BusError> {
            if self.fail {
                return Err(BusError::Closed);
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
            Ok(())
        }

        async fn subscribe(&self, _filter: &str) -> Result<Subscription, BusError> {
            Err(BusError::Closed)
        }
    }

    fn reading_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap()
    }

    fn warm() -> Result<Vec<WeatherReading>, WeatherError> {
        Ok(vec![WeatherReading {
            timestamp: reading_time(),
            temperature: 22.5,
        }])
    }

    fn unreachable_provider() -> Result<Vec<WeatherReading>, WeatherError> {
        Err(WeatherError::Status { status: 503 })
    }

    fn pair(location_sid: &str, sensor_sid: &str, lat: f64, lon: f64) -> ApiSensor {
        ApiSensor {
            location: Location {
                id: 1,
                sid: location_sid.to_string(),
                name: location_sid.to_string(),
                latitude: lat,
                longitude: lon,
            },
            sensor: LocationSensor {
                id: 10,
                location_id: 1,
                sid: sensor_sid.to_string(),
                sensor_type: SensorType::Api,
            },
        }
    }

    fn store_with(pairs: Vec<ApiSensor>) -> Arc<MockStore> {
        Arc::new(MockStore {
            api_sensors: pairs,
            ..MockStore::default()
        })
    }

    #[test]
    fn temperature_formatting() {
        assert_eq!(format_temperature(22.123456), "22.12");
        assert_eq!(format_temperature(100.999), "101.00");
        assert_eq!(format_temperature(-5.678), "-5.68");
        assert_eq!(format_temperature(0.0), "0.00");
    }

    #[test]
    fn payload_entries_are_pairs() {
        let t = reading_time();
        let readings = vec![
            WeatherReading {
                timestamp: t,
                temperature: 22.5,
            },
            WeatherReading {
                timestamp: t + chrono::Duration::hours(1),
                temperature: 23.0,
            },
        ];
        let payload = to_payload(&readings);
        assert_eq!(
            payload,
            vec![
                vec!["22.50".to_string(), "2024-01-15T14:30:00Z".to_string()],
                vec!["23.00".to_string(), "2024-01-15T15:30:00Z".to_string()],
            ]
        );
        assert!(to_payload(&[]).is_empty());
    }

    #[tokio::test]
    async fn successful_pull_publishes_to_sensor_topic() {
        let weather = Arc::new(StubWeather::new(warm));
        let bus = Arc::new(RecordingBus::default());
        let crawler = Crawler::new(
            store_with(vec![pair("warsaw", "api-sensor", 52.2297, 21.0122)]),
            weather.clone(),
            bus.clone(),
            4,
        );
        let (_tx, rx) = watch::channel(());

        let report = crawler.crawl(rx).await.unwrap();

        assert_eq!(
            report,
            CrawlReport {
                published: 1,
                readings: 1,
                cancelled: 0
            }
        );
        assert_eq!(*weather.calls.lock().unwrap(), vec![(52.2297, 21.0122)]);
        let published = bus.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "sensors/warsaw/api-sensor");
        assert_eq!(
            published[0].1,
            vec![vec![
                "22.50".to_string(),
                reading_time().to_rfc3339_opts(SecondsFormat::Secs, true)
            ]]
        );
    }

    #[tokio::test]
    async fn fetch_failure_is_recorded_and_not_published() {
        let bus = Arc::new(RecordingBus::default());
        let crawler = Crawler::new(
            store_with(vec![pair("warsaw", "api-sensor", 52.2297, 21.0122)]),
            Arc::new(StubWeather::new(unreachable_provider)),
            bus.clone(),
            4,
        );
        let (_tx, rx) = watch::channel(());

        let err = crawler.crawl(rx).await.unwrap_err();

        assert!(err.to_string().contains("get weather"));
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].pair(), ("warsaw", "api-sensor"));
        assert!(err.failures()[0].source().is_some());
        assert!(bus.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_recorded() {
        let crawler = Crawler::new(
            store_with(vec![pair("warsaw", "api-sensor", 52.2297, 21.0122)]),
            Arc::new(StubWeather::new(warm)),
            Arc::new(RecordingBus {
                fail: true,
                ..RecordingBus::default()
            }),
            4,
        );
        let (_tx, rx) = watch::channel(());

        let err = crawler.crawl(rx).await.unwrap_err();

        assert!(err.to_string().contains("publish temperature data"));
        assert!(matches!(err.failures()[0], PairError::Publish { .. }));
    }

    #[tokio::test]
    async fn failures_do_not_stop_other_pairs() {
        let bus = Arc::new(RecordingBus::default());
        let pairs = vec![
            pair("warsaw", "api-1", 52.0, 21.0),
            pair("krakow", "api-2", 50.0, 19.0),
            pair("gdansk", "api-3", 54.0, 18.0),
        ];
        let crawler = Crawler::new(
            store_with(pairs),
            Arc::new(StubWeather::new(warm)),
            bus.clone(),
            1,
        );
        let (_tx, rx) = watch::channel(());

        crawler.crawl(rx).await.unwrap();

        let mut topics: Vec<String> = bus
            .published
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect();
        topics.sort();
        assert_eq!(
            topics,
            vec![
                "sensors/gdansk/api-3",
                "sensors/krakow/api-2",
                "sensors/warsaw/api-1"
            ]
        );
    }

    #[tokio::test]
    async fn every_failure_is_kept_in_aggregate() {
        let pairs = vec![
            pair("warsaw", "api-1", 52.0, 21.0),
            pair("krakow", "api-2", 50.0, 19.0),
        ];
        let crawler = Crawler::new(
            store_with(pairs),
            Arc::new(StubWeather::new(unreachable_provider)),
            Arc::new(RecordingBus::default()),
            2,
        );
        let (_tx, rx) = watch::channel(());

        let err = crawler.crawl(rx).await.unwrap_err();

        assert_eq!(err.failures().len(), 2);
        let message = err.to_string();
        assert!(message.contains("warsaw/api-1"));
        assert!(message.contains("krakow/api-2"));
        assert!(message.contains("provider returned status 503"));
        assert_eq!(message.lines().count(), 2);
    }

    #[tokio::test]
    async fn catalog_failure_aborts_pass() {
        let crawler = Crawler::new(
            Arc::new(MockStore {
                fail: true,
                ..MockStore::default()
            }),
            Arc::new(StubWeather::new(warm)),
            Arc::new(RecordingBus::default()),
            1,
        );
        let (_tx, rx) = watch::channel(());

        let err = crawler.crawl(rx).await.unwrap_err();
        assert!(matches!(err, CrawlError::Catalog(_)));
        assert!(err.failures().is_empty());
    }

    #[tokio::test]
    async fn empty_catalog_is_ok() {
        let crawler = Crawler::new(
            store_with(Vec::new()),
            Arc::new(StubWeather::new(warm)),
            Arc::new(RecordingBus::default()),
            1,
        );
        let (_tx, rx) = watch::channel(());
        assert_eq!(crawler.crawl(rx).await.unwrap(), CrawlReport::default());
    }

    #[tokio::test]
    async fn crawl_runs_on_a_spawned_task() {
        let bus = Arc::new(RecordingBus::default());
        let crawler = Arc::new(Crawler::new(
            store_with(vec![pair("warsaw", "api-sensor", 52.2297, 21.0122)]),
            Arc::new(StubWeather::new(warm)),
            bus.clone(),
            2,
        ));
        let (_tx, rx) = watch::channel(());

        let task = tokio::spawn({
            let crawler = crawler.clone();
            async move { crawler.crawl(rx).await }
        });

        assert_eq!(task.await.unwrap().unwrap().published, 1);
        assert_eq!(bus.published.lock().unwrap().len(), 1);
    }

    /// Hangs forever for coordinates at the equator.
    struct HangingWeather;

    #[async_trait]
    impl WeatherSource for HangingWeather {
        async fn fetch(
            &self,
            latitude: f64,
            _longitude: f64,
        ) -> Result<Vec<WeatherReading>, WeatherError> {
            if latitude == 0.0 {
                std::future::pending::<()>().await;
            }
            if latitude < 0.0 {
                return unreachable_provider();
            }
            warm()
        }
    }

    async fn shutdown_after_publish(bus: &RecordingBus, tx: watch::Sender<()>) {
        while bus.published.lock().unwrap().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn shutdown_mid_pass_counts_cancelled_pairs() {
        let bus = Arc::new(RecordingBus::default());
        let crawler = Crawler::new(
            store_with(vec![
                pair("warsaw", "api-1", 52.0, 21.0),
                pair("equator", "api-2", 0.0, 0.0),
            ]),
            Arc::new(HangingWeather),
            bus.clone(),
            2,
        );
        let (tx, rx) = watch::channel(());

        let (report, ()) = tokio::join!(crawler.crawl(rx), shutdown_after_publish(&bus, tx));

        assert_eq!(
            report.unwrap(),
            CrawlReport {
                published: 1,
                readings: 1,
                cancelled: 1
            }
        );
    }

    #[tokio::test]
    async fn shutdown_mid_pass_keeps_collected_failures() {
        let bus = Arc::new(RecordingBus::default());
        let crawler = Crawler::new(
            store_with(vec![
                pair("warsaw", "api-1", 52.0, 21.0),
                pair("sydney", "api-2", -33.0, 151.0),
                pair("equator", "api-3", 0.0, 0.0),
            ]),
            Arc::new(HangingWeather),
            bus.clone(),
            3,
        );
        let (tx, rx) = watch::channel(());

        let crawl = crawler.crawl(rx);
        let trigger = async {
            // Both finite pairs resolve on their first poll.
            tokio::task::yield_now().await;
            shutdown_after_publish(&bus, tx).await
        };
        let (result, ()) = tokio::join!(crawl, trigger);

        let err = result.unwrap_err();
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].pair(), ("sydney", "api-2"));
        assert_eq!(bus.published.lock().unwrap().len(), 1);
    }
}
