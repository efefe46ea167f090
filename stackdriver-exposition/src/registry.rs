use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error as ThisError;
use tracing::debug;

use crate::collector::{CollectError, Collector};
use crate::family::{MetricFamily, MetricType};

/// Convenience type for the future returned by [`Gatherer::gather`].
pub type GatherFuture<'a> = Pin<Box<dyn Future<Output = Gathered> + Send + 'a>>;

/// Errors that could occur while registering a collector.
#[derive(Debug, ThisError)]
pub enum RegistryError {
    /// A collector with the same identifier is already registered.
    #[error("collector `{0}` is already registered")]
    AlreadyRegistered(String),
}

/// Errors that could occur while gathering metric families.
///
/// Gather errors never abort a gather: the affected collector output, family or sample is left
/// out of the result and the error is reported alongside it.
#[derive(Debug, ThisError)]
pub enum GatherError {
    /// A collector failed outright.
    #[error("collector `{collector}` failed: {source}")]
    Collector {
        /// Identifier of the failed collector.
        collector: String,
        /// Underlying failure.
        #[source]
        source: CollectError,
    },

    /// Two families with the same name but a different type were collected.
    #[error("metric family `{family}` collected as both {existing} and {incoming}")]
    TypeMismatch {
        /// Family name.
        family: String,
        /// Type of the family collected first.
        existing: MetricType,
        /// Type of the conflicting family.
        incoming: MetricType,
    },

    /// A sample value does not match the type of its family.
    #[error("metric family `{family}` of type {expected} contains a {found} sample")]
    ValueTypeMismatch {
        /// Family name.
        family: String,
        /// Declared family type.
        expected: MetricType,
        /// Type of the offending sample.
        found: MetricType,
    },

    /// Samples of the same family carry different label names.
    #[error("metric family `{family}` has inconsistent label dimensions")]
    InconsistentLabels {
        /// Family name.
        family: String,
    },

    /// The same series was collected more than once.
    #[error("metric family `{family}` collected series {{{labels}}} more than once")]
    DuplicateSeries {
        /// Family name.
        family: String,
        /// Rendered labels of the duplicate series.
        labels: String,
    },
}

/// Result of a gather: the valid metric families, and everything that went wrong.
#[derive(Debug, Default)]
pub struct Gathered {
    /// Metric families, sorted by name, with samples sorted by labels.
    pub families: Vec<MetricFamily>,
    /// Errors encountered while gathering.
    pub errors: Vec<GatherError>,
}

/// A source of gathered metric families.
pub trait Gatherer: Send + Sync {
    /// Gathers the current metric families.
    fn gather(&self) -> GatherFuture<'_>;
}

/// A set of collectors that are gathered together.
///
/// A registry holds no metric values itself: every gather asks each registered collector for its
/// families, concurrently, and merges the results.
#[derive(Default)]
pub struct Registry {
    collectors: Vec<Box<dyn Collector>>,
}

impl Registry {
    /// Creates an empty [`Registry`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a collector.
    ///
    /// ## Errors
    ///
    /// If a collector with the same identifier is already registered, an error variant is returned
    /// and the collector is not registered.
    pub fn register(&mut self, collector: Box<dyn Collector>) -> Result<(), RegistryError> {
        if self.collectors.iter().any(|existing| existing.id() == collector.id()) {
            return Err(RegistryError::AlreadyRegistered(collector.id().to_string()));
        }

        self.collectors.push(collector);
        Ok(())
    }

    /// Gets the number of registered collectors.
    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    /// Returns `true` if no collectors are registered.
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Iterates over the identifiers of the registered collectors.
    pub fn collector_ids(&self) -> impl Iterator<Item = &str> {
        self.collectors.iter().map(|c| c.id())
    }
}

impl Gatherer for Registry {
    fn gather(&self) -> GatherFuture<'_> {
        Box::pin(async move {
            let results = join_all(self.collectors.iter().map(|c| c.collect())).await;

            let mut families = Vec::new();
            let mut errors = Vec::new();
            for (collector, result) in self.collectors.iter().zip(results) {
                match result {
                    Ok(collected) => families.extend(collected),
                    Err(source) => errors
                        .push(GatherError::Collector { collector: collector.id().to_string(), source }),
                }
            }

            let families = merge_families(families, &mut errors);
            Gathered { families, errors }
        })
    }
}

impl<G: Gatherer + ?Sized> Gatherer for Arc<G> {
    fn gather(&self) -> GatherFuture<'_> {
        (**self).gather()
    }
}

/// An ordered list of gatherers whose results are merged.
///
/// Families with the same name coming from different gatherers are merged into one; the checks
/// applied within a single registry (duplicate series, label consistency, type conflicts) are
/// applied again across the merged result.
pub struct Gatherers<'a> {
    gatherers: Vec<&'a dyn Gatherer>,
}

impl<'a> Gatherers<'a> {
    /// Creates a new [`Gatherers`], gathered in the given order.
    pub fn new(gatherers: Vec<&'a dyn Gatherer>) -> Self {
        Self { gatherers }
    }
}

impl Gatherer for Gatherers<'_> {
    fn gather(&self) -> GatherFuture<'_> {
        Box::pin(async move {
            let mut families = Vec::new();
            let mut errors = Vec::new();
            for gatherer in &self.gatherers {
                let gathered = gatherer.gather().await;
                families.extend(gathered.families);
                errors.extend(gathered.errors);
            }

            let families = merge_families(families, &mut errors);
            Gathered { families, errors }
        })
    }
}

fn merge_families(
    families: Vec<MetricFamily>,
    errors: &mut Vec<GatherError>,
) -> Vec<MetricFamily> {
    let mut by_name: BTreeMap<String, MetricFamily> = BTreeMap::new();

    for family in families {
        match by_name.get_mut(&family.name) {
            Some(existing) if existing.metric_type != family.metric_type => {
                errors.push(GatherError::TypeMismatch {
                    family: family.name.clone(),
                    existing: existing.metric_type,
                    incoming: family.metric_type,
                });
            }
            Some(existing) => existing.metrics.extend(family.metrics),
            None => {
                by_name.insert(family.name.clone(), family);
            }
        }
    }

    by_name.into_values().filter_map(|family| validate_family(family, errors)).collect()
}

fn validate_family(
    mut family: MetricFamily,
    errors: &mut Vec<GatherError>,
) -> Option<MetricFamily> {
    let expected = family.metric_type;
    let mut mismatched = Vec::new();
    family.metrics.retain(|metric| {
        let found = metric.value.metric_type();
        if found != expected {
            mismatched.push(found);
        }
        found == expected
    });
    errors.extend(mismatched.into_iter().map(|found| GatherError::ValueTypeMismatch {
        family: family.name.clone(),
        expected,
        found,
    }));

    let mut dimensions = family.metrics.iter().map(|m| m.labels.sorted_keys());
    if let Some(first) = dimensions.next() {
        if dimensions.any(|keys| keys != first) {
            debug!(family = %family.name, "dropping metric family with inconsistent label dimensions");
            errors.push(GatherError::InconsistentLabels { family: family.name.clone() });
            return None;
        }
    }

    let mut seen = HashSet::new();
    let mut deduplicated = Vec::with_capacity(family.metrics.len());
    for metric in family.metrics.drain(..) {
        let series = metric
            .labels
            .sorted_pairs()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Vec<_>>();

        if seen.contains(&series) {
            let labels =
                series.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect::<Vec<_>>().join(",");
            errors.push(GatherError::DuplicateSeries { family: family.name.clone(), labels });
            continue;
        }

        seen.insert(series);
        deduplicated.push(metric);
    }

    if deduplicated.is_empty() {
        return None;
    }

    deduplicated.sort_by(|a, b| a.labels.sorted_pairs().cmp(&b.labels.sorted_pairs()));
    family.metrics = deduplicated;
    Some(family)
}
