//! Temperature telemetry pipeline.
//!
//! A [`crawler::Crawler`] pulls current temperatures for every location `api`
//! sensor from a [`weather::WeatherSource`] and publishes them on the sensor
//! bus. A [`reader::Reader`] subscribes to all sensor topics and stores what
//! arrives, whether it came from the crawler or a physical device. The
//! [`query::QueryService`] answers summary and time-series requests over the
//! stored readings and is exposed over HTTP by [`http`].

pub mod bus;
pub mod catalog;
pub mod config;
pub mod crawler;
pub mod http;
pub mod model;
pub mod query;
pub mod reader;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod weather;
