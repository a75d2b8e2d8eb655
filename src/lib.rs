//! Prometheus exporter for Mosquitto broker telemetry.
//!
//! This crate bridges a Mosquitto broker's `$SYS/#` status topics into
//! Prometheus metrics exposed via an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐     ┌─────────────────┐
//! │   MQTT Broker   │────>│     Registry     │────>│   HTTP Server   │
//! │     ($SYS/#)    │     │ (counters/gauges)│     │    (/metrics)   │
//! └─────────────────┘     └──────────────────┘     └─────────────────┘
//! ```
//!
//! The collector owns the broker connection: it connects with retry,
//! subscribes to the status subtree, and classifies every incoming topic
//! against two static tables (ignored topics and counters; everything
//! else is a gauge). Parsed values land in a lazily-growing registry that
//! renders the Prometheus text exposition format on each scrape.
//!
//! # Usage
//!
//! Run the exporter binary, optionally with a configuration file:
//!
//! ```bash
//! mosquitto-exporter --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod collector;
pub mod config;
pub mod http;
pub mod mapping;
pub mod registry;
pub mod tls;

pub use collector::{ConnectionState, MqttCollector};
pub use config::ExporterConfig;
pub use http::HttpServer;
pub use mapping::TopicTables;
pub use registry::{MetricRegistry, SharedRegistry};
