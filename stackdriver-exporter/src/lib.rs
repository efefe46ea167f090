//! Exposes Google Cloud Monitoring metrics in the Prometheus exposition format.
//!
//! Every scrape builds a fresh [`Registry`](stackdriver_exposition::Registry) holding one
//! [`MonitoringCollector`] per project, restricted to the metric type prefixes selected by the
//! `collect` query parameters of the scrape, if any.  The collectors query the Cloud Monitoring
//! API through an [`ApiClient`] with bounded retries, and DELTA metrics can be accumulated into
//! counters and histograms that outlive the scrape.
#![deny(missing_docs)]

pub mod assembler;
pub use self::assembler::{spawn_delta_sweeper, RegistryAssembler};

pub mod client;
pub use self::client::{create_api_client, ApiClient, ApiError, ClientConfig, RetryPolicy};

pub mod collector;
pub use self::collector::{DeltaStores, MonitoringCollector, MonitoringCollectorOptions};

pub mod config;
pub use self::config::{ExporterConfig, LogLevel, WebConfig};

pub mod discovery;

mod error;
pub use self::error::StartupError;

pub mod filters;

pub mod handler;
pub use self::handler::ScrapeHandler;

pub mod prefixes;
pub use self::prefixes::SelectionSet;

pub mod server;
pub use self::server::Router;

#[cfg(test)]
mod testing;
