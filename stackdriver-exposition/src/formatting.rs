//! Helpers for rendering metric families in the Prometheus exposition format.

use crate::family::{LabelSet, Metric, MetricFamily, MetricValue};

/// Content type of the Prometheus [text format], version 0.0.4.
///
/// [text format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-based-format
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Renders the given metric families in the Prometheus [exposition format].
///
/// Families are written in the order given. Histograms are expanded into their `_bucket`, `_sum`
/// and `_count` series, with the implicit `+Inf` bucket derived from the observation count.
/// Metric names and label keys are sanitized, so the output always parses.
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn encode_text(families: &[MetricFamily]) -> String {
    let mut output = String::new();

    for family in families {
        let name = sanitize_metric_name(&family.name);
        if !family.help.is_empty() {
            write_help_line(&mut output, &name, &family.help);
        }
        write_type_line(&mut output, &name, family.metric_type.as_str());

        for metric in &family.metrics {
            write_metric(&mut output, &name, metric);
        }
        output.push('\n');
    }

    output
}

fn write_metric(buffer: &mut String, name: &str, metric: &Metric) {
    let labels = &metric.labels;
    let ts = metric.timestamp_ms;

    match &metric.value {
        MetricValue::Counter(value) | MetricValue::Gauge(value) => {
            write_metric_line::<&str>(buffer, name, None, labels, None, *value, ts);
        }
        MetricValue::Histogram(histogram) => {
            for (le, count) in &histogram.buckets {
                write_metric_line(
                    buffer,
                    name,
                    Some("bucket"),
                    labels,
                    Some(("le", format_value(*le))),
                    *count as f64,
                    ts,
                );
            }
            write_metric_line(
                buffer,
                name,
                Some("bucket"),
                labels,
                Some(("le", "+Inf")),
                histogram.count as f64,
                ts,
            );
            write_metric_line::<&str>(buffer, name, Some("sum"), labels, None, histogram.sum, ts);
            write_metric_line::<&str>(
                buffer,
                name,
                Some("count"),
                labels,
                None,
                histogram.count as f64,
                ts,
            );
        }
    }
}

/// Writes a help (description) line in the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_help_line(buffer: &mut String, name: &str, desc: &str) {
    buffer.push_str("# HELP ");
    buffer.push_str(name);
    buffer.push(' ');
    let desc = sanitize_description(desc);
    buffer.push_str(&desc);
    buffer.push('\n');
}

/// Writes a metric type line in the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_type_line(buffer: &mut String, name: &str, metric_type: &str) {
    buffer.push_str("# TYPE ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(metric_type);
    buffer.push('\n');
}

/// Writes a metric in the Prometheus [exposition format].
///
/// Label keys are sanitized; `name` is written as given.  When `suffix` is specified, it is
/// appended to the `name`, which is useful for writing the bucket, sum and count series of a
/// histogram.  Likewise, `additional_label` would typically be used to specify a data
/// type-specific label, such as `le` for histogram buckets.
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_metric_line<T>(
    buffer: &mut String,
    name: &str,
    suffix: Option<&'static str>,
    labels: &LabelSet,
    additional_label: Option<(&'static str, T)>,
    value: f64,
    timestamp_ms: Option<i64>,
) where
    T: std::fmt::Display,
{
    buffer.push_str(name);
    if let Some(suffix) = suffix {
        buffer.push('_');
        buffer.push_str(suffix);
    }

    if !labels.is_empty() || additional_label.is_some() {
        buffer.push('{');

        let mut first = true;
        for (key, value) in labels.iter() {
            if first {
                first = false;
            } else {
                buffer.push(',');
            }
            buffer.push_str(&sanitize_label_key(key));
            buffer.push_str("=\"");
            buffer.push_str(&sanitize_label_value(value));
            buffer.push('"');
        }

        if let Some((name, value)) = additional_label {
            if !first {
                buffer.push(',');
            }
            buffer.push_str(name);
            buffer.push_str("=\"");
            buffer.push_str(value.to_string().as_str());
            buffer.push('"');
        }

        buffer.push('}');
    }

    buffer.push(' ');
    buffer.push_str(&format_value(value));
    if let Some(ts) = timestamp_ms {
        buffer.push(' ');
        buffer.push_str(&ts.to_string());
    }
    buffer.push('\n');
}

/// Formats a sample value the way Prometheus parses it.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() { "+Inf" } else { "-Inf" }.to_string()
    } else {
        value.to_string()
    }
}

/// Sanitizes a metric name to be valid under the Prometheus [data model].
///
/// [data model]: https://prometheus.io/docs/concepts/data_model/#metric-names-and-labels
pub fn sanitize_metric_name(name: &str) -> String {
    // The first character must be [a-zA-Z_:], and all subsequent characters must be [a-zA-Z0-9_:].
    name.chars()
        .enumerate()
        .map(|(i, c)| {
            if i == 0 && valid_metric_name_start_character(c)
                || i != 0 && valid_metric_name_character(c)
            {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Sanitizes a label key to be valid under the Prometheus [data model].
///
/// [data model]: https://prometheus.io/docs/concepts/data_model/#metric-names-and-labels
pub fn sanitize_label_key(key: &str) -> String {
    // The first character must be [a-zA-Z_], and all subsequent characters must be [a-zA-Z0-9_].
    key.chars()
        .enumerate()
        .map(|(i, c)| {
            if i == 0 && valid_label_key_start_character(c)
                || i != 0 && valid_label_key_character(c)
            {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Sanitizes a label value to be valid under the Prometheus [data model].
///
/// [data model]: https://prometheus.io/docs/concepts/data_model/#metric-names-and-labels
pub fn sanitize_label_value(value: &str) -> String {
    sanitize_label_value_or_description(value, false)
}

/// Sanitizes a metric description to be valid under the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn sanitize_description(value: &str) -> String {
    sanitize_label_value_or_description(value, true)
}

fn sanitize_label_value_or_description(value: &str, is_desc: bool) -> String {
    // All Unicode characters are valid, but backslashes, double quotes, and line feeds must be
    // escaped.
    let mut sanitized = String::with_capacity(value.len());

    let mut previous_backslash = false;
    for c in value.chars() {
        match c {
            '\n' => sanitized.push_str("\\n"),
            // Double quotes are only escaped in label values.
            '"' if !is_desc => {
                previous_backslash = false;
                sanitized.push_str("\\\"");
            }
            // A backslash either escapes the next character or is itself escaped by the previous
            // one; an already escaped pair is emitted as-is.
            '\\' => {
                if previous_backslash {
                    sanitized.push_str("\\\\");
                }
                previous_backslash = !previous_backslash;
            }
            c => {
                // A held backslash that escapes nothing is emitted escaped.
                if previous_backslash {
                    previous_backslash = false;
                    sanitized.push_str("\\\\");
                }
                sanitized.push(c);
            }
        }
    }

    if previous_backslash {
        sanitized.push_str("\\\\");
    }

    sanitized
}

#[inline]
fn valid_metric_name_start_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [a-zA-Z_:].
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

#[inline]
fn valid_metric_name_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [a-zA-Z0-9_:].
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

#[inline]
fn valid_label_key_start_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [a-zA-Z_].
    c.is_ascii_alphabetic() || c == '_'
}

#[inline]
fn valid_label_key_character(c: char) -> bool {
    // Essentially, needs to match the regex pattern of [a-zA-Z0-9_].
    c.is_ascii_alphanumeric() || c == '_'
}
