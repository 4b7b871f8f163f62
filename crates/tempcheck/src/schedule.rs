//! Periodic crawl loop driven by a cron expression.

use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;

use crate::crawler::Crawler;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression: {0}")]
    CronParse(String),
}

/// Pad a standard 5-field expression with a zero seconds field; the `cron`
/// crate wants 6.
pub fn normalize_cron_expr(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, ScheduleError> {
    cron::Schedule::from_str(&normalize_cron_expr(expr))
        .map_err(|e| ScheduleError::CronParse(format!("{}: {}", expr, e)))
}

/// Next occurrence strictly after `after`.
pub fn next_run_after(
    schedule: &cron::Schedule,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| ScheduleError::CronParse("no next occurrence".to_string()))
}

async fn run_pass(crawler: &Crawler, shutdown: &watch::Receiver<()>) {
    match crawler.crawl(shutdown.clone()).await {
        Ok(report) if report.cancelled > 0 => {
            log::info!("[Scheduler] pass interrupted after {} sensors", report.published)
        }
        Ok(_) => {}
        Err(e) => log::error!("[Scheduler] crawl failed:\n{}", e),
    }
}

/// Crawl immediately, then at every occurrence of `expr` until shutdown.
/// A failed pass is logged and does not stop the loop.
pub async fn run_crawl_schedule(
    crawler: &Crawler,
    expr: &str,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), ScheduleError> {
    let schedule = parse_schedule(expr)?;
    log::info!("[Scheduler] crawling on schedule '{}'", expr);

    run_pass(crawler, &shutdown).await;

    loop {
        let next = next_run_after(&schedule, Utc::now())?;
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        log::debug!("[Scheduler] next crawl at {}", next);

        tokio::select! {
            _ = tokio::time::sleep(wait) => run_pass(crawler, &shutdown).await,
            _ = shutdown.changed() => {
                log::info!("[Scheduler] shutdown signal received, exiting");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::model::WeatherReading;
    use crate::store::mock::MockStore;
    use crate::weather::{WeatherError, WeatherSource};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn normalize_prepends_seconds_for_5_fields() {
        assert_eq!(normalize_cron_expr("*/30 * * * *"), "0 */30 * * * *");
        assert_eq!(normalize_cron_expr("  0 * * * * "), "0 0 * * * *");
    }

    #[test]
    fn normalize_keeps_6_fields_unchanged() {
        assert_eq!(normalize_cron_expr("0 */15 * * * *"), "0 */15 * * * *");
    }

    #[test]
    fn every_half_hour() {
        let schedule = parse_schedule("*/30 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 15, 14, 10, 5).unwrap();
        let next = next_run_after(&schedule, after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap());
        let next = next_run_after(&schedule, next).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap());
    }

    #[test]
    fn invalid_expression() {
        let err = parse_schedule("not a cron expression").unwrap_err();
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    struct CountingWeather(AtomicUsize);

    #[async_trait::async_trait]
    impl WeatherSource for CountingWeather {
        async fn fetch(&self, _: f64, _: f64) -> Result<Vec<WeatherReading>, WeatherError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn runs_immediately_and_stops_on_shutdown() {
        use crate::model::{ApiSensor, Location, LocationSensor, SensorType};

        let weather = Arc::new(CountingWeather(AtomicUsize::new(0)));
        let store = MockStore {
            api_sensors: vec![ApiSensor {
                location: Location {
                    id: 1,
                    sid: "loc1".into(),
                    name: "Home".into(),
                    latitude: 1.0,
                    longitude: 2.0,
                },
                sensor: LocationSensor {
                    id: 1,
                    location_id: 1,
                    sid: "s1".into(),
                    sensor_type: SensorType::Api,
                },
            }],
            ..MockStore::default()
        };
        let crawler = Arc::new(Crawler::new(
            Arc::new(store),
            weather.clone(),
            Arc::new(MemoryBus::new()),
            1,
        ));
        let (tx, rx) = watch::channel(());

        let task = {
            let crawler = crawler.clone();
            tokio::spawn(async move { run_crawl_schedule(&crawler, "0 0 0 1 1 *", rx).await })
        };

        while weather.0.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(weather.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_schedule_is_rejected_before_crawling() {
        let weather = Arc::new(CountingWeather(AtomicUsize::new(0)));
        let crawler = Crawler::new(
            Arc::new(MockStore::default()),
            weather.clone(),
            Arc::new(MemoryBus::new()),
            1,
        );
        let (_tx, rx) = watch::channel(());
        assert!(run_crawl_schedule(&crawler, "bogus", rx).await.is_err());
        assert_eq!(weather.0.load(Ordering::SeqCst), 0);
    }
}
