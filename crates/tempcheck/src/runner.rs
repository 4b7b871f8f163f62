//! Process wiring for the `tempcheck` subcommands.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use crate::bus::MqttBus;
use crate::catalog::{self, CatalogError};
use crate::config::{load_config_or_default, Config, ConfigError};
use crate::crawler::{CrawlError, Crawler};
use crate::http::{self, ApiState};
use crate::query::QueryService;
use crate::reader::{Reader, ReaderError};
use crate::schedule::{self, ScheduleError};
use crate::store::{SqliteStore, StoreError};
use crate::weather::{OpenMeteoClient, WeatherError};

/// Errors that end a subcommand.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Weather client error: {0}")]
    Weather(#[from] WeatherError),

    #[error("Crawl failed:\n{0}")]
    Crawl(#[from] CrawlError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Init error: {0}")]
    Init(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Initialize logging with env_logger. Respects `RUST_LOG`, defaults to info.
pub fn setup_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Load the config file (defaults if absent) and apply environment overrides.
pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    log::info!("Loading config from: {}", path.display());
    let mut config: Config = load_config_or_default(path)?;
    config.apply_env()?;
    Ok(config)
}

/// Shutdown channel fired on Ctrl+C.
fn shutdown_signal() -> Result<watch::Receiver<()>, RunError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, shutting down gracefully...");
        shutdown_tx.send(()).ok();
    })
    .map_err(|e| RunError::Init(e.to_string()))?;
    Ok(shutdown_rx)
}

fn open_store(config: &Config) -> Result<Arc<SqliteStore>, RunError> {
    log::info!("Opening database at {}", config.database.path.display());
    Ok(Arc::new(SqliteStore::open(&config.database.path)?))
}

pub async fn run_crawler(config: Config, once: bool) -> Result<(), RunError> {
    let shutdown = shutdown_signal()?;
    let store = open_store(&config)?;
    let weather = Arc::new(OpenMeteoClient::new(&config.weather)?);
    let bus = Arc::new(MqttBus::connect(&config.mqtt));

    let crawler = Crawler::new(store, weather, bus.clone(), config.crawler.concurrency);
    let result = if once {
        crawler
            .crawl(shutdown)
            .await
            .map(|report| {
                log::info!(
                    "Crawl finished: {} published, {} cancelled",
                    report.published,
                    report.cancelled
                )
            })
            .map_err(RunError::from)
    } else {
        schedule::run_crawl_schedule(&crawler, &config.crawler.schedule, shutdown)
            .await
            .map_err(RunError::from)
    };

    bus.close().await;
    result
}

pub async fn run_reader(config: Config) -> Result<(), RunError> {
    let shutdown = shutdown_signal()?;
    let store = open_store(&config)?;
    let bus = Arc::new(MqttBus::connect(&config.mqtt));

    let reader = Reader::new(store, bus.clone());
    let result = reader.listen(shutdown).await;

    bus.close().await;
    Ok(result?)
}

pub async fn run_api(config: Config) -> Result<(), RunError> {
    let api_key = config
        .api
        .api_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            RunError::Init("api.api_key (or TEMPCHECK_API_KEY) must be set".to_string())
        })?;

    let shutdown = shutdown_signal()?;
    let store = open_store(&config)?;
    let state = ApiState::new(QueryService::new(store), api_key);

    let listener = tokio::net::TcpListener::bind(&config.api.bind).await?;
    http::serve(listener, state, shutdown).await?;
    Ok(())
}

pub fn run_seed(config: &Config, catalog_path: &Path) -> Result<(), RunError> {
    let catalog = catalog::load_catalog(catalog_path)?;
    let store = SqliteStore::open(&config.database.path)?;
    let report = catalog::seed(&store, &catalog)?;
    log::info!(
        "Seeded {} locations and {} sensors into {}",
        report.locations,
        report.sensors,
        config.database.path.display()
    );
    Ok(())
}
