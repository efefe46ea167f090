//! Cloud Monitoring v3 resources, limited to the fields the collector reads.
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer};

/// Kind of measurement a metric reports.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    /// An instantaneous measurement.
    Gauge,
    /// The change over the sampling window.
    Delta,
    /// A value accumulated since a start time.
    Cumulative,
    /// Anything else.
    #[default]
    #[serde(other)]
    Unspecified,
}

/// Type of the values a metric reports.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    /// `true` or `false`.
    Bool,
    /// A 64-bit integer.
    Int64,
    /// A double precision float.
    Double,
    /// A string.
    String,
    /// A bucketed distribution.
    Distribution,
    /// An amount of money.
    Money,
    /// Anything else.
    #[default]
    #[serde(other)]
    Unspecified,
}

/// Metadata attached to a metric descriptor.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptorMetadata {
    /// Delay before a point is visible to reads, e.g. `"180s"`.
    #[serde(default)]
    pub ingest_delay: Option<String>,
    /// Sampling period of the metric, e.g. `"60s"`.
    #[serde(default)]
    pub sample_period: Option<String>,
}

/// Definition of a metric type.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptor {
    /// Resource name, `projects/<project>/metricDescriptors/<type>`.
    #[serde(default)]
    pub name: String,
    /// Metric type, e.g. `compute.googleapis.com/instance/cpu/utilization`.
    #[serde(rename = "type")]
    pub metric_type: String,
    /// Kind of measurement.
    #[serde(default)]
    pub metric_kind: MetricKind,
    /// Type of the values.
    #[serde(default)]
    pub value_type: ValueType,
    /// Unit of the values, in UCUM notation.
    #[serde(default)]
    pub unit: String,
    /// Description of the metric.
    #[serde(default)]
    pub description: String,
    /// Additional metadata.
    #[serde(default)]
    pub metadata: Option<MetricDescriptorMetadata>,
}

/// A page of metric descriptors.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptorPage {
    /// Descriptors on this page.
    #[serde(default)]
    pub metric_descriptors: Vec<MetricDescriptor>,
    /// Token of the next page, empty or absent on the last page.
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Metric type and labels of a time series.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SeriesMetric {
    /// Metric type.
    #[serde(rename = "type", default)]
    pub metric_type: String,
    /// Metric labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Monitored resource of a time series.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct MonitoredResource {
    /// Resource type, e.g. `gce_instance`.
    #[serde(rename = "type", default)]
    pub resource_type: String,
    /// Resource labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Time interval of a point.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PointInterval {
    /// Start of the interval, RFC 3339.
    #[serde(default)]
    pub start_time: Option<String>,
    /// End of the interval, RFC 3339.
    pub end_time: String,
}

/// Linear bucket layout.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinearBuckets {
    /// Number of finite buckets.
    #[serde(default)]
    pub num_finite_buckets: i64,
    /// Width of each bucket.
    #[serde(default)]
    pub width: f64,
    /// Lower bound of the first finite bucket.
    #[serde(default)]
    pub offset: f64,
}

/// Exponential bucket layout.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExponentialBuckets {
    /// Number of finite buckets.
    #[serde(default)]
    pub num_finite_buckets: i64,
    /// Growth factor between bucket bounds.
    #[serde(default)]
    pub growth_factor: f64,
    /// Lower bound of the first finite bucket.
    #[serde(default)]
    pub scale: f64,
}

/// Explicit bucket layout.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ExplicitBuckets {
    /// Bucket boundaries, increasing.
    #[serde(default)]
    pub bounds: Vec<f64>,
}

/// Bucket layout of a distribution; exactly one is set.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketOptions {
    /// Linear layout.
    #[serde(default)]
    pub linear_buckets: Option<LinearBuckets>,
    /// Exponential layout.
    #[serde(default)]
    pub exponential_buckets: Option<ExponentialBuckets>,
    /// Explicit layout.
    #[serde(default)]
    pub explicit_buckets: Option<ExplicitBuckets>,
}

/// A distribution value.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    /// Number of values.
    #[serde(default, deserialize_with = "int64")]
    pub count: i64,
    /// Arithmetic mean of the values.
    #[serde(default)]
    pub mean: f64,
    /// Bucket layout.
    #[serde(default)]
    pub bucket_options: BucketOptions,
    /// Per-bucket counts, not cumulative; trailing zero buckets may be omitted.
    #[serde(default, deserialize_with = "int64_list")]
    pub bucket_counts: Vec<i64>,
}

/// A typed value; exactly one field is set.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypedValue {
    /// Boolean value.
    #[serde(default)]
    pub bool_value: Option<bool>,
    /// Integer value.
    #[serde(default, deserialize_with = "optional_int64")]
    pub int64_value: Option<i64>,
    /// Double value.
    #[serde(default)]
    pub double_value: Option<f64>,
    /// String value.
    #[serde(default)]
    pub string_value: Option<String>,
    /// Distribution value.
    #[serde(default)]
    pub distribution_value: Option<Distribution>,
}

/// A single data point of a time series.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Point {
    /// Interval the point covers.
    pub interval: PointInterval,
    /// Value of the point.
    pub value: TypedValue,
}

/// A time series.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeries {
    /// Metric type and labels.
    #[serde(default)]
    pub metric: SeriesMetric,
    /// Monitored resource.
    #[serde(default)]
    pub resource: MonitoredResource,
    /// Kind of measurement.
    #[serde(default)]
    pub metric_kind: MetricKind,
    /// Type of the values.
    #[serde(default)]
    pub value_type: ValueType,
    /// Data points, newest first.
    #[serde(default)]
    pub points: Vec<Point>,
}

/// A page of time series.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPage {
    /// Time series on this page.
    #[serde(default)]
    pub time_series: Vec<TimeSeries>,
    /// Token of the next page, empty or absent on the last page.
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// The time window of a time series query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimeWindow {
    /// Start of the window.
    pub start: DateTime<Utc>,
    /// End of the window.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Gets the start of the window, formatted for the API.
    pub fn start_time(&self) -> String {
        self.start.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Gets the end of the window, formatted for the API.
    pub fn end_time(&self) -> String {
        self.end.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start_time(), self.end_time())
    }
}

// 64-bit integers are encoded as JSON strings, though plain numbers are accepted as well.
#[derive(Deserialize)]
#[serde(untagged)]
enum Int64 {
    Number(i64),
    Text(String),
}

impl Int64 {
    fn into_i64<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            Int64::Number(n) => Ok(n),
            Int64::Text(s) => s.parse().map_err(|_| E::custom(format!("invalid int64 `{s}`"))),
        }
    }
}

fn int64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Int64::deserialize(deserializer)?.into_i64()
}

fn optional_int64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Option::<Int64>::deserialize(deserializer)?.map(Int64::into_i64).transpose()
}

fn int64_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<i64>, D::Error> {
    Vec::<Int64>::deserialize(deserializer)?.into_iter().map(Int64::into_i64).collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_descriptor_page_decodes() {
        let page: MetricDescriptorPage = serde_json::from_str(
            r#"{
                "metricDescriptors": [{
                    "name": "projects/p/metricDescriptors/pubsub.googleapis.com/subscription/num_undelivered_messages",
                    "type": "pubsub.googleapis.com/subscription/num_undelivered_messages",
                    "metricKind": "GAUGE",
                    "valueType": "INT64",
                    "unit": "1",
                    "description": "Number of unacked messages.",
                    "metadata": {"samplePeriod": "60s", "ingestDelay": "120s"},
                    "launchStage": "GA"
                }, {
                    "type": "custom.googleapis.com/new_kind",
                    "metricKind": "SOMETHING_NEW",
                    "valueType": "SOMETHING_ELSE"
                }],
                "nextPageToken": "abc"
            }"#,
        )
        .unwrap();

        let descriptor = &page.metric_descriptors[0];
        assert_eq!(descriptor.metric_kind, MetricKind::Gauge);
        assert_eq!(descriptor.value_type, ValueType::Int64);
        assert_eq!(descriptor.metadata.as_ref().unwrap().ingest_delay.as_deref(), Some("120s"));
        assert_eq!(page.metric_descriptors[1].metric_kind, MetricKind::Unspecified);
        assert_eq!(page.metric_descriptors[1].value_type, ValueType::Unspecified);
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_time_series_page_decodes_int64_strings() {
        let page: TimeSeriesPage = serde_json::from_str(
            r#"{
                "timeSeries": [{
                    "metric": {"type": "loadbalancing.googleapis.com/https/request_count", "labels": {"response_code": "200"}},
                    "resource": {"type": "https_lb_rule", "labels": {"project_id": "p"}},
                    "metricKind": "DELTA",
                    "valueType": "DISTRIBUTION",
                    "points": [{
                        "interval": {"startTime": "2024-05-01T10:00:00Z", "endTime": "2024-05-01T10:01:00Z"},
                        "value": {"distributionValue": {
                            "count": "6",
                            "mean": 2.5,
                            "bucketOptions": {"explicitBuckets": {"bounds": [1, 5]}},
                            "bucketCounts": ["1", 4, "1"]
                        }}
                    }, {
                        "interval": {"endTime": "2024-05-01T10:00:00Z"},
                        "value": {"int64Value": "42"}
                    }]
                }]
            }"#,
        )
        .unwrap();

        let series = &page.time_series[0];
        assert_eq!(series.metric_kind, MetricKind::Delta);
        assert_eq!(series.resource.resource_type, "https_lb_rule");
        let distribution = series.points[0].value.distribution_value.as_ref().unwrap();
        assert_eq!(distribution.count, 6);
        assert_eq!(distribution.bucket_counts, vec![1, 4, 1]);
        assert_eq!(distribution.bucket_options.explicit_buckets.as_ref().unwrap().bounds, vec![1.0, 5.0]);
        assert_eq!(series.points[1].value.int64_value, Some(42));
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_invalid_int64_is_rejected() {
        let result = serde_json::from_str::<TypedValue>(r#"{"int64Value": "forty-two"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_window_formatting() {
        let window = TimeWindow {
            start: Utc.with_ymd_and_hms(2024, 5, 1, 9, 55, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        };
        assert_eq!(window.start_time(), "2024-05-01T09:55:00Z");
        assert_eq!(window.end_time(), "2024-05-01T10:00:00Z");
    }
}
