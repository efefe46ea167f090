//! The scrape endpoint.
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use parking_lot::Mutex;
use stackdriver_exposition::{
    encode_text, CollectFuture, Collector, Gatherer, Gatherers, LabelSet, Metric, MetricFamily,
    MetricType, MetricValue, Registry, RegistryError, TEXT_CONTENT_TYPE,
};
use tracing::{debug, error};

use crate::assembler::RegistryAssembler;
use crate::prefixes::SelectionSet;

/// Version reported by the build info metric.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Default)]
struct HandlerState {
    requests: BTreeMap<u16, u64>,
    in_flight: u64,
}

/// Counts the scrapes served by every handler of the process.
#[derive(Clone)]
pub struct HandlerTelemetry {
    state: Arc<Mutex<HandlerState>>,
}

impl HandlerTelemetry {
    /// Creates a new [`HandlerTelemetry`].
    pub fn new() -> Self {
        let mut state = HandlerState::default();
        for code in [200, 500, 503] {
            state.requests.insert(code, 0);
        }
        HandlerTelemetry { state: Arc::new(Mutex::new(state)) }
    }

    fn start(&self) -> InFlight {
        self.state.lock().in_flight += 1;
        InFlight { telemetry: self.clone() }
    }

    fn record(&self, status: StatusCode) {
        *self.state.lock().requests.entry(status.as_u16()).or_default() += 1;
    }
}

impl Default for HandlerTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight {
    telemetry: HandlerTelemetry,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.telemetry.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

impl Collector for HandlerTelemetry {
    fn id(&self) -> &str {
        "promhttp"
    }

    fn collect(&self) -> CollectFuture<'_> {
        let state = self.state.lock();
        let mut requests = MetricFamily::new(
            "promhttp_metric_handler_requests_total",
            "Total number of scrapes by HTTP status code.",
            MetricType::Counter,
        );
        for (code, count) in &state.requests {
            let labels = [("code", code.to_string())].into_iter().collect::<LabelSet>();
            requests.push(Metric::new(labels, MetricValue::Counter(*count as f64)));
        }
        let in_flight = MetricFamily::new(
            "promhttp_metric_handler_requests_in_flight",
            "Current number of scrapes being served.",
            MetricType::Gauge,
        )
        .with_metric(Metric::new(LabelSet::new(), MetricValue::Gauge(state.in_flight as f64)));

        let families = vec![requests, in_flight];
        Box::pin(async move { Ok(families) })
    }
}

struct BuildInfo;

impl Collector for BuildInfo {
    fn id(&self) -> &str {
        "build_info"
    }

    fn collect(&self) -> CollectFuture<'_> {
        let labels = [
            ("version", VERSION),
            ("os", std::env::consts::OS),
            ("arch", std::env::consts::ARCH),
        ]
        .into_iter()
        .collect::<LabelSet>();
        let family = MetricFamily::new(
            "stackdriver_exporter_build_info",
            "A metric with a constant '1' value labeled by version, os and arch from which stackdriver_exporter was built.",
            MetricType::Gauge,
        )
        .with_metric(Metric::new(labels, MetricValue::Gauge(1.0)));
        Box::pin(async move { Ok(vec![family]) })
    }
}

/// Creates the registry of the exporter's own metrics.
///
/// ## Errors
///
/// If the collectors cannot be registered, an error is returned.
pub fn process_registry(telemetry: &HandlerTelemetry) -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();
    registry.register(Box::new(BuildInfo))?;
    registry.register(Box::new(telemetry.clone()))?;
    Ok(registry)
}

/// Extracts the prefixes selected by the `collect` parameters of a query string.
///
/// Without any `collect` parameter every prefix is selected. A `collect` parameter, even an
/// empty one, restricts the scrape to the listed prefixes.
pub fn parse_selection(query: Option<&str>) -> SelectionSet {
    form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .filter(|(key, _)| key == "collect")
        .map(|(_, value)| value.into_owned())
        .collect()
}

/// Serves scrapes of the process registry, of a fresh monitoring registry, or of both.
pub struct ScrapeHandler {
    assembler: Option<Arc<RegistryAssembler>>,
    process: Option<Arc<Registry>>,
    telemetry: HandlerTelemetry,
}

impl ScrapeHandler {
    /// Creates a handler serving the monitoring metrics, preceded by `process` when given.
    pub fn monitoring(
        assembler: Arc<RegistryAssembler>,
        process: Option<Arc<Registry>>,
        telemetry: HandlerTelemetry,
    ) -> Self {
        ScrapeHandler { assembler: Some(assembler), process, telemetry }
    }

    /// Creates a handler serving only the exporter's own metrics.
    pub fn process(process: Arc<Registry>, telemetry: HandlerTelemetry) -> Self {
        ScrapeHandler { assembler: None, process: Some(process), telemetry }
    }

    /// Handles a scrape with the given query string.
    pub async fn handle(&self, query: Option<&str>) -> Response<Full<Bytes>> {
        let _in_flight = self.telemetry.start();
        let response = self.scrape(query).await;
        self.telemetry.record(response.status());
        response
    }

    async fn scrape(&self, query: Option<&str>) -> Response<Full<Bytes>> {
        let registry = match &self.assembler {
            Some(assembler) => {
                let selection = parse_selection(query);
                debug!(filtered = !selection.is_empty(), "serving scrape");
                match assembler.build(&selection) {
                    Ok(registry) => Some(registry),
                    Err(e) => {
                        error!(error = %e, "failed to build scrape registry");
                        return text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("failed to build collectors: {e}\n"),
                        );
                    }
                }
            }
            None => None,
        };

        let mut gatherers: Vec<&dyn Gatherer> = Vec::new();
        if let Some(process) = &self.process {
            gatherers.push(&**process);
        }
        if let Some(registry) = &registry {
            gatherers.push(registry);
        }
        let gathered = Gatherers::new(gatherers).gather().await;
        for e in &gathered.errors {
            error!(error = %e, "error gathering metrics");
        }

        let mut response = Response::new(Full::new(Bytes::from(encode_text(&gathered.families))));
        response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_CONTENT_TYPE));
        response
    }
}

/// Creates a plain-text response.
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::BodyExt;

    use super::*;
    use crate::collector::{DeltaStores, MonitoringCollectorOptions};
    use crate::filters::MetricFilter;
    use crate::testing::gauge_per_prefix_api;

    fn assembler(extra_filters: Vec<MetricFilter>) -> Arc<RegistryAssembler> {
        let options = MonitoringCollectorOptions {
            metric_type_prefixes: vec!["compute.googleapis.com/".to_string(), "pubsub.googleapis.com/".to_string()],
            extra_filters,
            ..Default::default()
        };
        let api = gauge_per_prefix_api();
        Arc::new(RegistryAssembler::new(
            vec!["p".to_string()],
            options,
            api.client(),
            DeltaStores::new(Duration::from_secs(60)),
        ))
    }

    async fn body(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_selection() {
        assert!(parse_selection(None).is_empty());
        assert!(parse_selection(Some("other=1")).is_empty());

        let selection = parse_selection(Some("collect=compute.googleapis.com%2F&collect=a%2Fb&x=y"));
        assert!(selection.contains("compute.googleapis.com/"));
        assert!(selection.contains("a/b"));
        assert!(!selection.contains("y"));

        let empty = parse_selection(Some("collect="));
        assert!(!empty.is_empty());
        assert!(empty.contains(""));
    }

    #[tokio::test]
    async fn test_full_and_filtered_scrapes() {
        let telemetry = HandlerTelemetry::new();
        let process = Arc::new(process_registry(&telemetry).unwrap());
        let handler = ScrapeHandler::monitoring(assembler(Vec::new()), Some(process), telemetry);

        let response = handler.handle(None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], TEXT_CONTENT_TYPE);
        let full = body(response).await;
        assert!(full.contains("stackdriver_gce_instance_compute_googleapis_com_up{"));
        assert!(full.contains("stackdriver_gce_instance_pubsub_googleapis_com_up{"));
        assert!(full.contains("stackdriver_exporter_build_info{"));
        assert!(full.contains("promhttp_metric_handler_requests_in_flight 1"));

        let filtered = body(handler.handle(Some("collect=pubsub.googleapis.com/")).await).await;
        assert!(!filtered.contains("stackdriver_gce_instance_compute_googleapis_com_up"));
        assert!(filtered.contains("stackdriver_gce_instance_pubsub_googleapis_com_up{"));
        assert!(filtered.contains("promhttp_metric_handler_requests_total{code=\"200\"} 1"));

        let unknown = body(handler.handle(Some("collect=unknown")).await).await;
        assert!(!unknown.contains("googleapis_com_up"));
        assert!(unknown.contains("stackdriver_monitoring_scrapes_total{project_id=\"p\"} 3"));
    }

    #[tokio::test]
    async fn test_build_failure_is_a_server_error() {
        let telemetry = HandlerTelemetry::new();
        let filters =
            vec![MetricFilter { targeted_metric_prefix: "compute".to_string(), filter_query: String::new() }];
        let handler = ScrapeHandler::monitoring(assembler(filters), None, telemetry.clone());

        let response = handler.handle(None).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body(response).await.starts_with("failed to build collectors: invalid extra filter"));

        let process = ScrapeHandler::process(Arc::new(process_registry(&telemetry).unwrap()), telemetry);
        let own = body(process.handle(None).await).await;
        assert!(own.contains("promhttp_metric_handler_requests_total{code=\"500\"} 1"));
        assert!(!own.contains("stackdriver_monitoring"));
    }
}
