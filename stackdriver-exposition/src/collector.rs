use std::future::Future;
use std::pin::Pin;

use thiserror::Error as ThisError;

use crate::family::MetricFamily;

/// Convenience type for the future returned by [`Collector::collect`].
pub type CollectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<MetricFamily>, CollectError>> + Send + 'a>>;

/// A source of metric families that is consulted on every gather.
///
/// Collectors are registered with a [`Registry`](crate::Registry), and produce their families
/// on demand, which allows them to fetch values from a remote system at scrape time.
pub trait Collector: Send + Sync {
    /// Gets the identifier of this collector.
    ///
    /// Identifiers must be unique within a single registry.
    fn id(&self) -> &str;

    /// Collects the current metric families.
    fn collect(&self) -> CollectFuture<'_>;
}

/// A collector failed to produce any metric families.
#[derive(Debug, ThisError)]
#[error("{reason}")]
pub struct CollectError {
    reason: String,
}

impl CollectError {
    /// Creates a new [`CollectError`] with the given reason.
    pub fn new<R: Into<String>>(reason: R) -> Self {
        Self { reason: reason.into() }
    }
}
