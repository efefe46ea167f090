use chrono::DateTime;
use stackdriver_delta::{DeltaSample, Fingerprint};
use stackdriver_exposition::{HistogramValue, LabelSet};
use tracing::trace;

use super::naming::{label_name, metric_name};
use crate::client::monitoring::{Distribution, MetricDescriptor, Point, TimeSeries, ValueType};

/// Value of the newest point of a time series.
#[derive(Clone, Debug, PartialEq)]
pub enum PointValue {
    /// A boolean, integer or double value.
    Scalar(f64),
    /// A distribution.
    Distribution(HistogramValue),
}

/// The newest point of a time series, with its Prometheus identity.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesSample {
    /// Metric name.
    pub name: String,
    /// Labels.
    pub labels: LabelSet,
    /// Value.
    pub value: PointValue,
    /// End time of the point, in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// Converts a time series to a sample of its newest point.
///
/// Returns `None` for series without a usable point, for value types without a Prometheus
/// counterpart (strings and money), and, when `drop_delegated_project` is set, for series whose
/// `project_id` label names another project.
pub fn convert_series(
    project_id: &str,
    descriptor: &MetricDescriptor,
    series: &TimeSeries,
    drop_delegated_projects: bool,
) -> Option<SeriesSample> {
    let labels = series_labels(descriptor, series);
    if drop_delegated_projects {
        if let Some(owner) = labels.get("project_id").filter(|owner| *owner != project_id) {
            trace!(metric_type = %descriptor.metric_type, owner, "dropping series of delegated project");
            return None;
        }
    }

    // Points are returned newest first.
    let point = series.points.first()?;
    let timestamp_ms = DateTime::parse_from_rfc3339(&point.interval.end_time).ok()?.timestamp_millis();
    let value_type =
        if series.value_type == ValueType::Unspecified { descriptor.value_type } else { series.value_type };
    let value = point_value(value_type, point)?;

    Some(SeriesSample {
        name: metric_name(&series.resource.resource_type, &series.metric.metric_type),
        labels,
        value,
        timestamp_ms,
    })
}

/// Builds the labels of a series: the unit, then metric labels, then resource labels.
///
/// Keys are normalized, and the first occurrence of a key wins.
fn series_labels(descriptor: &MetricDescriptor, series: &TimeSeries) -> LabelSet {
    let mut keys = vec!["unit".to_string()];
    let mut labels = LabelSet::new();
    labels.push("unit", descriptor.unit.as_str());

    let mut metric_labels = series.metric.labels.iter().collect::<Vec<_>>();
    metric_labels.sort_unstable();
    let mut resource_labels = series.resource.labels.iter().collect::<Vec<_>>();
    resource_labels.sort_unstable();

    for (key, value) in metric_labels.into_iter().chain(resource_labels) {
        let key = label_name(key);
        if key.is_empty() || keys.contains(&key) {
            continue;
        }
        keys.push(key.clone());
        labels.push(key, value.as_str());
    }

    labels
}

fn point_value(value_type: ValueType, point: &Point) -> Option<PointValue> {
    let value = &point.value;
    match value_type {
        ValueType::Bool => value.bool_value.map(|b| PointValue::Scalar(if b { 1.0 } else { 0.0 })),
        ValueType::Int64 => value.int64_value.map(|i| PointValue::Scalar(i as f64)),
        ValueType::Double => value.double_value.map(PointValue::Scalar),
        ValueType::Distribution => {
            value.distribution_value.as_ref().and_then(histogram).map(PointValue::Distribution)
        }
        ValueType::String | ValueType::Money | ValueType::Unspecified => None,
    }
}

/// Converts a distribution to a histogram with cumulative bucket counts.
///
/// Returns `None` if the bucket layout is unknown.
pub fn histogram(distribution: &Distribution) -> Option<HistogramValue> {
    let options = &distribution.bucket_options;
    let bounds: Vec<f64> = if let Some(explicit) = &options.explicit_buckets {
        explicit.bounds.clone()
    } else if let Some(linear) = &options.linear_buckets {
        (0..=linear.num_finite_buckets.max(0))
            .map(|i| linear.offset + i as f64 * linear.width)
            .collect()
    } else if let Some(exponential) = &options.exponential_buckets {
        (0..=exponential.num_finite_buckets.max(0))
            .map(|i| exponential.scale * exponential.growth_factor.powi(i as i32))
            .collect()
    } else {
        return None;
    };

    let mut cumulative = 0u64;
    let buckets = bounds
        .into_iter()
        .enumerate()
        .map(|(i, bound)| {
            let count = distribution.bucket_counts.get(i).copied().unwrap_or(0).max(0) as u64;
            cumulative += count;
            (bound, cumulative)
        })
        .collect();

    let count = distribution.count.max(0) as u64;
    Some(HistogramValue { buckets, count, sum: distribution.mean * count as f64 })
}

/// A value that can be accumulated across delta points.
pub trait DeltaValue: Clone + Send {
    /// Adds a previously accumulated value to this one.
    fn add(&mut self, previous: &Self);
}

impl DeltaValue for f64 {
    fn add(&mut self, previous: &Self) {
        *self += previous;
    }
}

impl DeltaValue for HistogramValue {
    fn add(&mut self, previous: &Self) {
        let same_layout = self.buckets.len() == previous.buckets.len()
            && self.buckets.iter().zip(&previous.buckets).all(|(a, b)| a.0 == b.0);
        // A changed bucket layout restarts the accumulation.
        if !same_layout {
            return;
        }

        for (bucket, previous) in self.buckets.iter_mut().zip(&previous.buckets) {
            bucket.1 += previous.1;
        }
        self.count += previous.count;
        self.sum += previous.sum;
    }
}

/// A delta point tracked by a delta store.
#[derive(Clone, Debug, PartialEq)]
pub struct DeltaPoint<V> {
    fingerprint: Fingerprint,
    /// Metric name.
    pub name: String,
    /// Labels.
    pub labels: LabelSet,
    /// Accumulated value.
    pub value: V,
    /// End time of the newest accumulated point, in milliseconds since the Unix epoch.
    pub report_time_ms: i64,
}

/// An accumulated delta counter.
pub type CounterSample = DeltaPoint<f64>;

/// An accumulated delta histogram.
pub type HistogramSample = DeltaPoint<HistogramValue>;

impl<V> DeltaPoint<V> {
    /// Creates a delta point of the given project.
    pub fn new(project_id: &str, name: String, labels: LabelSet, value: V, report_time_ms: i64) -> Self {
        let fingerprint = Fingerprint::new(project_id, &name, labels.iter());
        Self { fingerprint, name, labels, value, report_time_ms }
    }
}

impl<V: DeltaValue> DeltaSample for DeltaPoint<V> {
    fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    fn report_time_ms(&self) -> i64 {
        self.report_time_ms
    }

    fn accumulate(&mut self, previous: &Self) {
        self.value.add(&previous.value);
    }
}
