//! Metric families, collector registries and the Prometheus text exposition format.
//!
//! A [`Registry`] holds a set of [`Collector`]s. Gathering a registry asks every collector for
//! its current [`MetricFamily`] values, merges families that share a name, and reports any
//! family that cannot be exposed (conflicting types, inconsistent label names, duplicate series)
//! as a [`GatherError`] instead of failing the whole gather. The result is rendered with
//! [`encode_text`].
#![deny(missing_docs)]

mod collector;
pub use self::collector::{CollectError, CollectFuture, Collector};

mod family;
pub use self::family::{HistogramValue, LabelSet, Metric, MetricFamily, MetricType, MetricValue};

pub mod formatting;
pub use self::formatting::{encode_text, TEXT_CONTENT_TYPE};

mod registry;
pub use self::registry::{
    GatherError, GatherFuture, Gathered, Gatherer, Gatherers, Registry, RegistryError,
};
