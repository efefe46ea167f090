//! Prometheus names of Cloud Monitoring metrics and labels.

/// Namespace of every collected metric.
pub const NAMESPACE: &str = "stackdriver";

/// Normalizes a name to lowercase words joined by `_`.
///
/// Every run of characters outside `[a-zA-Z0-9]` becomes a single `_`, and leading or trailing
/// separators are dropped: `compute.googleapis.com/instance/cpu/usage_time` becomes
/// `compute_googleapis_com_instance_cpu_usage_time`.
pub fn normalize_name(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Builds the Prometheus label name of a metric or resource label key.
///
/// The key is normalized, and prefixed with `_` when it starts with a digit, so the result is
/// either empty or matches `[a-z_][a-z0-9_]*`.
pub fn label_name(key: &str) -> String {
    let name = normalize_name(key);
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{name}")
    } else {
        name
    }
}

/// Builds the metric name of a metric type observed on a resource type.
pub fn metric_name(resource_type: &str, metric_type: &str) -> String {
    format!("{NAMESPACE}_{}_{}", normalize_name(resource_type), normalize_name(metric_type))
}
