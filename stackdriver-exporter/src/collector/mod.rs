//! Collection of Cloud Monitoring time series as Prometheus metric families.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use stackdriver_delta::DeltaStore;
use stackdriver_exposition::{
    CollectError, CollectFuture, Collector, Metric, MetricFamily, MetricValue, RegistryError,
};
use thiserror::Error as ThisError;
use tracing::{debug, error, warn};

use crate::client::monitoring::{MetricDescriptor, MetricKind, TimeWindow};
use crate::client::{ApiClient, ApiError};
use crate::config::parse_duration;
use crate::filters::{check_filter_query, MetricFilter, QueryProblem};
use crate::prefixes::{select_prefixes, SelectionSet};

mod descriptors;
pub use self::descriptors::DescriptorCache;

pub mod naming;

mod series;
pub use self::series::{
    convert_series, histogram, CounterSample, DeltaPoint, DeltaValue, HistogramSample, PointValue,
    SeriesSample,
};

mod telemetry;
pub use self::telemetry::ScrapeTelemetry;

// Descriptors of one collector whose time series are fetched at the same time.
const DESCRIPTOR_CONCURRENCY: usize = 8;

/// Errors that could occur while building a collector.
#[derive(Debug, ThisError)]
pub enum CollectorInitError {
    /// The project identifier is empty.
    #[error("project id must not be empty")]
    EmptyProjectId,

    /// The request interval is zero.
    #[error("metrics interval must be greater than zero")]
    ZeroInterval,

    /// An extra filter query is malformed.
    #[error("invalid extra filter `{filter}`: {problem}")]
    InvalidFilter {
        /// The offending filter.
        filter: MetricFilter,
        /// What is wrong with it.
        problem: QueryProblem,
    },

    /// The collector could not be registered.
    #[error("failed to register collector: {0}")]
    Registration(#[from] RegistryError),
}

/// Settings of a [`MonitoringCollector`].
#[derive(Clone, Debug, PartialEq)]
pub struct MonitoringCollectorOptions {
    /// Normalized prefixes of the metric types to collect.
    pub metric_type_prefixes: Vec<String>,
    /// Extra filters appended to time series queries.
    pub extra_filters: Vec<MetricFilter>,
    /// Width of the window in which the newest point is searched.
    pub request_interval: Duration,
    /// Offset of the end of the window from now.
    pub request_offset: Duration,
    /// Whether the window is moved back by the ingest delay of each metric.
    pub ingest_delay: bool,
    /// Whether missing labels are filled with empty values.
    pub fill_missing_labels: bool,
    /// Whether series of other projects are dropped.
    pub drop_delegated_projects: bool,
    /// Whether delta metrics are accumulated into counters and histograms.
    pub aggregate_deltas: bool,
    /// Lifetime of cached metric descriptors; zero disables the cache.
    pub descriptor_cache_ttl: Duration,
    /// Whether only first-party metric descriptors are cached.
    pub descriptor_cache_only_google: bool,
}

impl Default for MonitoringCollectorOptions {
    fn default() -> Self {
        MonitoringCollectorOptions {
            metric_type_prefixes: Vec::new(),
            extra_filters: Vec::new(),
            request_interval: Duration::from_secs(5 * 60),
            request_offset: Duration::ZERO,
            ingest_delay: false,
            fill_missing_labels: true,
            drop_delegated_projects: false,
            aggregate_deltas: false,
            descriptor_cache_ttl: Duration::ZERO,
            descriptor_cache_only_google: true,
        }
    }
}

impl MonitoringCollectorOptions {
    /// Derives the options of a single scrape, restricted to the selected prefixes.
    ///
    /// `self` is left untouched.
    pub fn scoped(&self, selection: &SelectionSet) -> MonitoringCollectorOptions {
        MonitoringCollectorOptions {
            metric_type_prefixes: select_prefixes(&self.metric_type_prefixes, selection),
            ..self.clone()
        }
    }
}

/// Delta stores shared by every collector of the process.
#[derive(Clone)]
pub struct DeltaStores {
    /// Accumulated delta counters.
    pub counters: Arc<DeltaStore<CounterSample>>,
    /// Accumulated delta histograms.
    pub histograms: Arc<DeltaStore<HistogramSample>>,
}

impl DeltaStores {
    /// Creates empty stores whose series expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        DeltaStores { counters: Arc::new(DeltaStore::new(ttl)), histograms: Arc::new(DeltaStore::new(ttl)) }
    }

    /// Creates empty stores whose expiry is measured with `clock`.
    pub fn with_clock(clock: quanta::Clock, ttl: Duration) -> Self {
        DeltaStores {
            counters: Arc::new(DeltaStore::with_clock(clock.clone(), ttl)),
            histograms: Arc::new(DeltaStore::with_clock(clock, ttl)),
        }
    }

    /// Gets the lifetime of a series after its last update.
    pub fn ttl(&self) -> Duration {
        self.counters.ttl()
    }

    /// Evicts expired series from both stores, returning how many were evicted.
    pub fn sweep(&self) -> usize {
        self.counters.sweep() + self.histograms.sweep()
    }
}

/// State of a project that outlives the collectors built for it.
#[derive(Clone)]
pub struct ProjectState {
    /// Cached metric descriptors.
    pub descriptors: Arc<DescriptorCache>,
    /// Scrape self-telemetry.
    pub telemetry: Arc<ScrapeTelemetry>,
}

impl ProjectState {
    /// Creates the state of a project.
    pub fn new(options: &MonitoringCollectorOptions) -> Self {
        ProjectState {
            descriptors: Arc::new(DescriptorCache::new(
                options.descriptor_cache_ttl,
                options.descriptor_cache_only_google,
            )),
            telemetry: Arc::new(ScrapeTelemetry::new()),
        }
    }
}

/// Metrics collected for a single metric descriptor.
struct DescriptorMetrics {
    help: String,
    metrics: Vec<(String, Metric)>,
}

/// Collects the metrics of one project.
pub struct MonitoringCollector {
    id: String,
    project_id: String,
    client: ApiClient,
    options: MonitoringCollectorOptions,
    deltas: DeltaStores,
    state: ProjectState,
}

impl MonitoringCollector {
    /// Creates a new [`MonitoringCollector`].
    ///
    /// ## Errors
    ///
    /// If the project identifier is empty, the request interval is zero, or an extra filter query
    /// is malformed, an error variant is returned.
    pub fn new(
        project_id: impl Into<String>,
        client: ApiClient,
        options: MonitoringCollectorOptions,
        deltas: DeltaStores,
        state: ProjectState,
    ) -> Result<Self, CollectorInitError> {
        let project_id = project_id.into();
        if project_id.is_empty() {
            return Err(CollectorInitError::EmptyProjectId);
        }
        if options.request_interval.is_zero() {
            return Err(CollectorInitError::ZeroInterval);
        }
        for filter in &options.extra_filters {
            check_filter_query(&filter.filter_query)
                .map_err(|problem| CollectorInitError::InvalidFilter { filter: filter.clone(), problem })?;
        }

        Ok(MonitoringCollector {
            id: format!("monitoring/{project_id}"),
            project_id,
            client,
            options,
            deltas,
            state,
        })
    }

    /// Gets the project this collector collects.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Gets the options of this collector.
    pub fn options(&self) -> &MonitoringCollectorOptions {
        &self.options
    }

    async fn collect_all(&self) -> Result<Vec<MetricFamily>, CollectError> {
        let started = quanta::Instant::now();
        let (mut families, failed) = self.collect_metrics(Utc::now()).await;

        let finished_at = Utc::now().timestamp_millis() as f64 / 1000.0;
        self.state.telemetry.record_scrape(failed, finished_at, started.elapsed());
        families.extend(self.state.telemetry.families(&self.project_id));
        Ok(families)
    }

    async fn collect_metrics(&self, now: DateTime<Utc>) -> (Vec<MetricFamily>, bool) {
        let mut failed = false;

        let listed = futures::future::join_all(
            self.options.metric_type_prefixes.iter().map(|prefix| self.descriptors(prefix)),
        )
        .await;
        let mut descriptors = Vec::new();
        for (prefix, result) in self.options.metric_type_prefixes.iter().zip(listed) {
            match result {
                Ok(listed) => descriptors.extend(listed),
                Err(e) => {
                    error!(project_id = %self.project_id, %prefix, error = %e, "failed to list metric descriptors");
                    failed = true;
                }
            }
        }

        let results = stream::iter(descriptors)
            .map(|descriptor| async move {
                let result = self.collect_descriptor(&descriptor, now).await;
                (descriptor, result)
            })
            .buffer_unordered(DESCRIPTOR_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let mut families: BTreeMap<String, MetricFamily> = BTreeMap::new();
        for (descriptor, result) in results {
            let collected = match result {
                Ok(collected) => collected,
                Err(e) => {
                    error!(
                        project_id = %self.project_id,
                        metric_type = %descriptor.metric_type,
                        error = %e,
                        "failed to collect time series"
                    );
                    failed = true;
                    continue;
                }
            };

            for (name, metric) in collected.metrics {
                families
                    .entry(name)
                    .or_insert_with_key(|name| {
                        MetricFamily::new(name.clone(), collected.help.clone(), metric.value.metric_type())
                    })
                    .push(metric);
            }
        }

        let mut families = families.into_values().collect::<Vec<_>>();
        if self.options.fill_missing_labels {
            families.iter_mut().for_each(fill_missing_labels);
        }
        (families, failed)
    }

    async fn descriptors(&self, prefix: &str) -> Result<Vec<MetricDescriptor>, ApiError> {
        if let Some(cached) = self.state.descriptors.lookup(prefix) {
            debug!(project_id = %self.project_id, %prefix, "using cached metric descriptors");
            return Ok(cached);
        }

        let filter = format!("metric.type = starts_with(\"{prefix}\")");
        let mut descriptors = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            self.state.telemetry.record_api_call();
            let page =
                self.client.list_metric_descriptors(&self.project_id, &filter, page_token.as_deref()).await?;
            descriptors.extend(page.metric_descriptors);
            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        self.state.descriptors.store(prefix, &descriptors);
        Ok(descriptors)
    }

    async fn collect_descriptor(
        &self,
        descriptor: &MetricDescriptor,
        now: DateTime<Utc>,
    ) -> Result<DescriptorMetrics, ApiError> {
        let window = self.window(descriptor, now);
        let filter = self.time_series_filter(&descriptor.metric_type);
        let aggregate = self.options.aggregate_deltas && descriptor.metric_kind == MetricKind::Delta;
        let store_key = format!("projects/{}/metricDescriptors/{}", self.project_id, descriptor.metric_type);
        debug!(project_id = %self.project_id, metric_type = %descriptor.metric_type, %window, "collecting time series");

        let mut metrics = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            self.state.telemetry.record_api_call();
            let page = self
                .client
                .list_time_series(&self.project_id, &filter, &window, page_token.as_deref())
                .await?;

            for series in &page.time_series {
                let Some(sample) = convert_series(
                    &self.project_id,
                    descriptor,
                    series,
                    self.options.drop_delegated_projects,
                ) else {
                    continue;
                };

                let kind = match series.metric_kind {
                    MetricKind::Unspecified => descriptor.metric_kind,
                    kind => kind,
                };
                match (sample.value, aggregate) {
                    (PointValue::Scalar(value), true) => {
                        let point = CounterSample::new(
                            &self.project_id,
                            sample.name,
                            sample.labels,
                            value,
                            sample.timestamp_ms,
                        );
                        self.deltas.counters.accumulate(&store_key, point);
                    }
                    (PointValue::Distribution(histogram), true) => {
                        let point = HistogramSample::new(
                            &self.project_id,
                            sample.name,
                            sample.labels,
                            histogram,
                            sample.timestamp_ms,
                        );
                        self.deltas.histograms.accumulate(&store_key, point);
                    }
                    (value, false) => {
                        let metric = Metric::new(sample.labels, metric_value(kind, value))
                            .with_timestamp(sample.timestamp_ms);
                        metrics.push((sample.name, metric));
                    }
                }
            }

            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        if aggregate {
            for counter in self.deltas.counters.list(&store_key) {
                let metric = Metric::new(counter.labels, MetricValue::Counter(counter.value))
                    .with_timestamp(counter.report_time_ms);
                metrics.push((counter.name, metric));
            }
            for histogram in self.deltas.histograms.list(&store_key) {
                let metric = Metric::new(histogram.labels, MetricValue::Histogram(histogram.value))
                    .with_timestamp(histogram.report_time_ms);
                metrics.push((histogram.name, metric));
            }
        }

        let help = if descriptor.description.is_empty() {
            descriptor.metric_type.clone()
        } else {
            descriptor.description.clone()
        };
        Ok(DescriptorMetrics { help, metrics })
    }

    fn window(&self, descriptor: &MetricDescriptor, now: DateTime<Utc>) -> TimeWindow {
        let mut end = subtract(now, self.options.request_offset);

        let ingest_delay = descriptor.metadata.as_ref().and_then(|m| m.ingest_delay.as_deref());
        if let (true, Some(delay)) = (self.options.ingest_delay, ingest_delay) {
            match parse_duration(delay) {
                Ok(delay) => end = subtract(end, delay),
                Err(e) => warn!(metric_type = %descriptor.metric_type, delay, error = %e, "ignoring invalid ingest delay"),
            }
        }

        TimeWindow { start: subtract(end, self.options.request_interval), end }
    }

    fn time_series_filter(&self, metric_type: &str) -> String {
        let mut filter = format!("metric.type=\"{metric_type}\"");
        if self.options.drop_delegated_projects {
            filter = format!("project=\"{}\" AND {filter}", self.project_id);
        }
        for extra in self.options.extra_filters.iter().filter(|extra| extra.applies_to(metric_type)) {
            filter = format!("{filter} AND ({})", extra.filter_query);
        }
        filter
    }
}

impl Collector for MonitoringCollector {
    fn id(&self) -> &str {
        &self.id
    }

    fn collect(&self) -> CollectFuture<'_> {
        Box::pin(self.collect_all())
    }
}

fn subtract(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|duration| time.checked_sub_signed(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn metric_value(kind: MetricKind, value: PointValue) -> MetricValue {
    match (kind, value) {
        (_, PointValue::Distribution(histogram)) => MetricValue::Histogram(histogram),
        (MetricKind::Cumulative, PointValue::Scalar(value)) => MetricValue::Counter(value),
        (_, PointValue::Scalar(value)) => MetricValue::Gauge(value),
    }
}

/// Completes every sample of a family with an empty value for the label keys it lacks.
fn fill_missing_labels(family: &mut MetricFamily) {
    let mut keys: Vec<String> = Vec::new();
    for metric in &family.metrics {
        for (key, _) in metric.labels.iter() {
            if !keys.iter().any(|known| known == key) {
                keys.push(key.to_string());
            }
        }
    }

    for metric in &mut family.metrics {
        for key in &keys {
            if metric.labels.get(key).is_none() {
                metric.labels.push(key.clone(), "");
            }
        }
    }
}
