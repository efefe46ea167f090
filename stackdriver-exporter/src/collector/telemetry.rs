use std::time::Duration;

use parking_lot::Mutex;
use stackdriver_exposition::{LabelSet, Metric, MetricFamily, MetricValue};

#[derive(Default)]
struct State {
    api_calls: u64,
    scrapes: u64,
    scrape_errors: u64,
    last_scrape_error: bool,
    last_scrape_timestamp: f64,
    last_scrape_duration: f64,
}

/// Self-telemetry of the collection of one project.
///
/// The counters live as long as the process, across every collector built for the project.
#[derive(Default)]
pub struct ScrapeTelemetry {
    state: Mutex<State>,
}

impl ScrapeTelemetry {
    /// Creates a new [`ScrapeTelemetry`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a call to the API.
    pub fn record_api_call(&self) {
        self.state.lock().api_calls += 1;
    }

    /// Records a finished scrape.
    pub fn record_scrape(&self, failed: bool, finished_at_secs: f64, duration: Duration) {
        let mut state = self.state.lock();
        state.scrapes += 1;
        if failed {
            state.scrape_errors += 1;
        }
        state.last_scrape_error = failed;
        state.last_scrape_timestamp = finished_at_secs;
        state.last_scrape_duration = duration.as_secs_f64();
    }

    /// Gets the telemetry as metric families labeled with the project.
    pub fn families(&self, project_id: &str) -> Vec<MetricFamily> {
        let state = self.state.lock();
        let family = |name: &str, help: &str, value: MetricValue| {
            let labels = [("project_id", project_id)].into_iter().collect::<LabelSet>();
            MetricFamily::new(name, help, value.metric_type()).with_metric(Metric::new(labels, value))
        };

        vec![
            family(
                "stackdriver_monitoring_api_calls_total",
                "Total number of Google Stackdriver Monitoring API calls made.",
                MetricValue::Counter(state.api_calls as f64),
            ),
            family(
                "stackdriver_monitoring_scrapes_total",
                "Total number of Google Stackdriver Monitoring metrics scrapes.",
                MetricValue::Counter(state.scrapes as f64),
            ),
            family(
                "stackdriver_monitoring_scrape_errors_total",
                "Total number of Google Stackdriver Monitoring metrics scrape errors.",
                MetricValue::Counter(state.scrape_errors as f64),
            ),
            family(
                "stackdriver_monitoring_last_scrape_error",
                "Whether the last metrics scrape from Google Stackdriver Monitoring resulted in an error (1 for error, 0 for success).",
                MetricValue::Gauge(if state.last_scrape_error { 1.0 } else { 0.0 }),
            ),
            family(
                "stackdriver_monitoring_last_scrape_timestamp",
                "Number of seconds since 1970 since last metrics scrape from Google Stackdriver Monitoring.",
                MetricValue::Gauge(state.last_scrape_timestamp),
            ),
            family(
                "stackdriver_monitoring_last_scrape_duration_seconds",
                "Duration of the last metrics scrape from Google Stackdriver Monitoring.",
                MetricValue::Gauge(state.last_scrape_duration),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(families: &[MetricFamily], name: &str) -> MetricValue {
        let family = families.iter().find(|f| f.name == name).unwrap();
        assert_eq!(family.metrics[0].labels.get("project_id"), Some("p"));
        family.metrics[0].value.clone()
    }

    #[test]
    fn test_scrapes_are_counted() {
        let telemetry = ScrapeTelemetry::new();
        telemetry.record_api_call();
        telemetry.record_api_call();
        telemetry.record_scrape(true, 100.0, Duration::from_millis(1500));
        telemetry.record_scrape(false, 160.0, Duration::from_millis(500));

        let families = telemetry.families("p");
        assert_eq!(value(&families, "stackdriver_monitoring_api_calls_total"), MetricValue::Counter(2.0));
        assert_eq!(value(&families, "stackdriver_monitoring_scrapes_total"), MetricValue::Counter(2.0));
        assert_eq!(value(&families, "stackdriver_monitoring_scrape_errors_total"), MetricValue::Counter(1.0));
        assert_eq!(value(&families, "stackdriver_monitoring_last_scrape_error"), MetricValue::Gauge(0.0));
        assert_eq!(value(&families, "stackdriver_monitoring_last_scrape_timestamp"), MetricValue::Gauge(160.0));
        assert_eq!(
            value(&families, "stackdriver_monitoring_last_scrape_duration_seconds"),
            MetricValue::Gauge(0.5)
        );
    }
}
