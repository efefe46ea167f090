use std::fmt;

/// The type of a metric family, as written on its `# TYPE` line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MetricType {
    /// A monotonically increasing value.
    Counter,
    /// A value that can go up and down.
    Gauge,
    /// A bucketed distribution of observations.
    Histogram,
}

impl MetricType {
    /// Gets the name of this type in the Prometheus [exposition format].
    ///
    /// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered set of label pairs attached to a single sample.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelSet {
    pairs: Vec<(String, String)>,
}

impl LabelSet {
    /// Creates an empty [`LabelSet`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a label pair.
    ///
    /// Pairs are kept in insertion order.
    pub fn push<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.pairs.push((key.into(), value.into()));
    }

    /// Returns `true` if this set has no labels.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Gets the value of the label with the given key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Iterates over the label pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Gets the label keys, sorted.
    pub fn sorted_keys(&self) -> Vec<&str> {
        let mut keys = self.pairs.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>();
        keys.sort_unstable();
        keys
    }

    /// Gets the label pairs, sorted by key.
    ///
    /// Two label sets describe the same series if their sorted pairs are equal.
    pub fn sorted_pairs(&self) -> Vec<(&str, &str)> {
        let mut pairs = self.iter().collect::<Vec<_>>();
        pairs.sort_unstable();
        pairs
    }
}

impl<K, V> FromIterator<(K, V)> for LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        LabelSet { pairs: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

/// A bucketed histogram sample.
///
/// Bucket counts are cumulative, and the implicit `+Inf` bucket is `count`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistogramValue {
    /// Finite upper bounds and their cumulative counts, in increasing bound order.
    pub buckets: Vec<(f64, u64)>,
    /// Total number of observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
}

/// The value of a single sample.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    /// A counter value.
    Counter(f64),
    /// A gauge value.
    Gauge(f64),
    /// A histogram value.
    Histogram(HistogramValue),
}

impl MetricValue {
    /// Gets the metric type this value belongs to.
    pub fn metric_type(&self) -> MetricType {
        match self {
            MetricValue::Counter(_) => MetricType::Counter,
            MetricValue::Gauge(_) => MetricType::Gauge,
            MetricValue::Histogram(_) => MetricType::Histogram,
        }
    }
}

/// A single labeled sample within a [`MetricFamily`].
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// Labels identifying the series.
    pub labels: LabelSet,
    /// Sample value.
    pub value: MetricValue,
    /// Optional sample timestamp, in milliseconds since the Unix epoch.
    pub timestamp_ms: Option<i64>,
}

impl Metric {
    /// Creates a new [`Metric`] without a timestamp.
    pub fn new(labels: LabelSet, value: MetricValue) -> Self {
        Self { labels, value, timestamp_ms: None }
    }

    /// Sets the sample timestamp, in milliseconds since the Unix epoch.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }
}

/// A named group of samples sharing a type and help text.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricFamily {
    /// Family name.
    pub name: String,
    /// Help text.
    pub help: String,
    /// Family type.
    pub metric_type: MetricType,
    /// Samples.
    pub metrics: Vec<Metric>,
}

impl MetricFamily {
    /// Creates an empty [`MetricFamily`].
    pub fn new<N, H>(name: N, help: H, metric_type: MetricType) -> Self
    where
        N: Into<String>,
        H: Into<String>,
    {
        Self { name: name.into(), help: help.into(), metric_type, metrics: Vec::new() }
    }

    /// Adds a sample to this family.
    #[must_use]
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metrics.push(metric);
        self
    }

    /// Adds a sample to this family.
    pub fn push(&mut self, metric: Metric) {
        self.metrics.push(metric);
    }
}
