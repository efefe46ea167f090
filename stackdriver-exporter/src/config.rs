//! Command-line configuration.
use std::net::SocketAddr;
use std::time::Duration;

use getopts::{Matches, Options};
use thiserror::Error as ThisError;

use crate::client::{ClientConfig, RetryPolicy};
use crate::collector::MonitoringCollectorOptions;
use crate::filters::{parse_extra_filters, EXTRA_FILTER_SEPARATOR};
use crate::prefixes::normalize_prefixes;

const LISTEN_ADDRESS: &str = "web.listen-address";
const TELEMETRY_PATH: &str = "web.telemetry-path";
const STACKDRIVER_TELEMETRY_PATH: &str = "web.stackdriver-telemetry-path";
const PROJECT_ID: &str = "google.project-id";
const PROJECTS_FILTER: &str = "google.projects.filter";
const MAX_RETRIES: &str = "stackdriver.max-retries";
const HTTP_TIMEOUT: &str = "stackdriver.http-timeout";
const MAX_BACKOFF: &str = "stackdriver.max-backoff";
const BACKOFF_JITTER: &str = "stackdriver.backoff-jitter";
const RETRY_STATUSES: &str = "stackdriver.retry-statuses";
const METRICS_PREFIXES: &str = "monitoring.metrics-prefixes";
const METRICS_INTERVAL: &str = "monitoring.metrics-interval";
const METRICS_OFFSET: &str = "monitoring.metrics-offset";
const METRICS_INGEST_DELAY: &str = "monitoring.metrics-ingest-delay";
const FILL_MISSING_LABELS: &str = "collector.fill-missing-labels";
const DROP_DELEGATED_PROJECTS: &str = "monitoring.drop-delegated-projects";
const FILTERS: &str = "monitoring.filters";
const AGGREGATE_DELTAS: &str = "monitoring.aggregate-deltas";
const AGGREGATE_DELTAS_TTL: &str = "monitoring.aggregate-deltas-ttl";
const DESCRIPTOR_CACHE_TTL: &str = "monitoring.descriptor-cache-ttl";
const DESCRIPTOR_CACHE_ONLY_GOOGLE: &str = "monitoring.descriptor-cache-only-google";
const LOG_LEVEL: &str = "log.level";

/// Errors that could occur while parsing a duration.
#[derive(Debug, ThisError, Eq, PartialEq)]
pub enum DurationError {
    /// The duration is empty.
    #[error("empty duration")]
    Empty,

    /// A number is not followed by a unit.
    #[error("missing unit in duration `{0}`")]
    MissingUnit(String),

    /// A unit is not one of `ns`, `us`, `µs`, `ms`, `s`, `m` or `h`.
    #[error("unknown unit `{unit}` in duration `{value}`")]
    UnknownUnit {
        /// The unknown unit.
        unit: String,
        /// The duration it appears in.
        value: String,
    },

    /// The duration is otherwise malformed, or too large.
    #[error("invalid duration `{0}`")]
    Invalid(String),
}

/// Parses a duration such as `1h30m`, `10s` or `250ms`.
///
/// A duration is a sequence of decimal numbers, each with an optional fraction and a unit.
/// A bare `0` is accepted as well.
pub fn parse_duration(value: &str) -> Result<Duration, DurationError> {
    if value.is_empty() {
        return Err(DurationError::Empty);
    }
    if value == "0" {
        return Ok(Duration::ZERO);
    }

    let invalid = || DurationError::Invalid(value.to_string());
    let mut nanos = 0f64;
    let mut rest = value;
    while !rest.is_empty() {
        let number_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid());
        }
        let number: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        if unit_len == 0 {
            return Err(DurationError::MissingUnit(value.to_string()));
        }
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            unit => {
                return Err(DurationError::UnknownUnit { unit: unit.to_string(), value: value.to_string() })
            }
        };
        nanos += number * scale;
        rest = &rest[unit_len..];
    }

    if nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Errors that could occur while reading the command line.
#[derive(Debug, ThisError)]
pub enum ConfigError {
    /// The arguments could not be parsed.
    #[error("{0}")]
    Parse(#[from] getopts::Fail),

    /// No metric type prefix was given.
    #[error("at least one --monitoring.metrics-prefixes is required")]
    MissingPrefixes,

    /// A duration flag is malformed.
    #[error("invalid value for --{flag}: {source}")]
    InvalidDuration {
        /// The flag.
        flag: &'static str,
        /// The parse error.
        source: DurationError,
    },

    /// A numeric flag is malformed.
    #[error("invalid value for --{flag}: `{value}` is not a valid number")]
    InvalidNumber {
        /// The flag.
        flag: &'static str,
        /// The given value.
        value: String,
    },

    /// A boolean flag is malformed.
    #[error("invalid value for --{flag}: `{value}` is neither true nor false")]
    InvalidBool {
        /// The flag.
        flag: &'static str,
        /// The given value.
        value: String,
    },

    /// The listen address is malformed.
    #[error("invalid value for --web.listen-address: `{0}`")]
    InvalidAddress(String),

    /// A path does not start with a slash.
    #[error("invalid value for --{flag}: `{value}` must start with `/`")]
    InvalidPath {
        /// The flag.
        flag: &'static str,
        /// The given value.
        value: String,
    },

    /// The log level is unknown.
    #[error("invalid value for --log.level: `{0}` is not one of debug, info, warn, error")]
    InvalidLogLevel(String),
}

/// Severity threshold of the log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    /// Everything, including per-request details.
    Debug,
    /// Startup and lifecycle events.
    Info,
    /// Recoverable problems.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// Gets the level as a log filter directive.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Settings of the HTTP listener.
#[derive(Clone, Debug, PartialEq)]
pub struct WebConfig {
    /// Address the listener binds to.
    pub listen_address: SocketAddr,
    /// Path of the exporter's own metrics.
    pub telemetry_path: String,
    /// Path of the Cloud Monitoring metrics.
    pub stackdriver_telemetry_path: String,
}

impl WebConfig {
    /// Whether both kinds of metrics are served on the same path.
    pub fn shared_path(&self) -> bool {
        self.telemetry_path == self.stackdriver_telemetry_path
    }
}

/// The complete configuration of the exporter.
#[derive(Clone, Debug, PartialEq)]
pub struct ExporterConfig {
    /// HTTP listener.
    pub web: WebConfig,
    /// Explicitly listed projects.
    pub project_ids: Vec<String>,
    /// Search filter selecting additional projects.
    pub projects_filter: Option<String>,
    /// API client.
    pub client: ClientConfig,
    /// Collection policy, with normalized prefixes and parsed extra filters.
    pub collector: MonitoringCollectorOptions,
    /// How long an accumulated delta series outlives its last point.
    pub aggregate_deltas_ttl: Duration,
    /// Log threshold.
    pub log_level: LogLevel,
}

/// Gets the command-line options of the exporter.
pub fn options() -> Options {
    let mut opts = Options::new();

    opts.optopt("", LISTEN_ADDRESS, "address on which to expose metrics (default: :9255)", "ADDRESS");
    opts.optopt("", TELEMETRY_PATH, "path under which to expose Prometheus metrics (default: /metrics)", "PATH");
    opts.optopt(
        "",
        STACKDRIVER_TELEMETRY_PATH,
        "path under which to expose Stackdriver metrics (default: /metrics)",
        "PATH",
    );
    opts.optmulti("", PROJECT_ID, "Google project id; repeat for multiple projects", "ID");
    opts.optopt("", PROJECTS_FILTER, "Google projects search filter", "FILTER");
    opts.optopt("", MAX_RETRIES, "max number of retries of a failed API call (default: 0)", "INTEGER");
    opts.optopt("", HTTP_TIMEOUT, "how long to wait for a result from the API (default: 10s)", "DURATION");
    opts.optopt("", MAX_BACKOFF, "max time between two retries (default: 5s)", "DURATION");
    opts.optopt("", BACKOFF_JITTER, "base of the exponential backoff (default: 1s)", "DURATION");
    opts.optmulti("", RETRY_STATUSES, "HTTP status that triggers a retry; repeatable (default: 503)", "STATUS");
    opts.optmulti("", METRICS_PREFIXES, "metric type prefix to collect; repeatable, required", "PREFIX");
    opts.optopt("", METRICS_INTERVAL, "interval in which the newest point is searched (default: 5m)", "DURATION");
    opts.optopt("", METRICS_OFFSET, "offset of the interval into the past (default: 0s)", "DURATION");
    opts.optflagopt("", METRICS_INGEST_DELAY, "move the interval back by each metric's ingest delay", "BOOL");
    opts.optflagopt("", FILL_MISSING_LABELS, "fill missing labels with empty values (default: true)", "BOOL");
    opts.optflagopt("", DROP_DELEGATED_PROJECTS, "drop series of attached projects", "BOOL");
    opts.optmulti("", FILTERS, "extra filter as <metric prefix>:<query>; repeatable", "FILTER");
    opts.optflagopt("", AGGREGATE_DELTAS, "accumulate DELTA metrics into counters", "BOOL");
    opts.optopt(
        "",
        AGGREGATE_DELTAS_TTL,
        "how long an accumulated delta series is exported after its last point (default: 30m)",
        "DURATION",
    );
    opts.optopt("", DESCRIPTOR_CACHE_TTL, "how long metric descriptors are cached (default: 0s)", "DURATION");
    opts.optflagopt(
        "",
        DESCRIPTOR_CACHE_ONLY_GOOGLE,
        "only cache descriptors of *.googleapis.com metrics (default: true)",
        "BOOL",
    );
    opts.optopt("", LOG_LEVEL, "only log messages with the given severity or above (default: info)", "LEVEL");
    opts.optflag("h", "help", "print this help menu");
    opts.optflag("", "version", "print the version");

    opts
}

/// Renders the usage text.
pub fn usage(program: &str, opts: &Options) -> String {
    let brief = format!("Usage: {} --{} PREFIX [options]", program, METRICS_PREFIXES);
    opts.usage(&brief)
}

impl ExporterConfig {
    /// Parses and validates the given arguments, excluding the program name.
    ///
    /// ## Errors
    ///
    /// If an argument is unknown or a value is malformed, an error is returned.
    pub fn from_args<S: AsRef<std::ffi::OsStr>>(args: &[S]) -> Result<Self, ConfigError> {
        let matches = options().parse(args)?;
        Self::from_matches(&matches)
    }

    /// Builds the configuration from parsed arguments.
    ///
    /// ## Errors
    ///
    /// If a value is malformed or no metric type prefix is given, an error is returned.
    pub fn from_matches(matches: &Matches) -> Result<Self, ConfigError> {
        let prefixes = matches.opt_strs(METRICS_PREFIXES);
        if prefixes.iter().all(|prefix| prefix.is_empty()) {
            return Err(ConfigError::MissingPrefixes);
        }
        let prefixes = prefixes.into_iter().filter(|prefix| !prefix.is_empty()).collect();

        let web = WebConfig {
            listen_address: listen_address(matches.opt_str(LISTEN_ADDRESS).as_deref().unwrap_or(":9255"))?,
            telemetry_path: path(matches, TELEMETRY_PATH)?,
            stackdriver_telemetry_path: path(matches, STACKDRIVER_TELEMETRY_PATH)?,
        };

        let retry_statuses = matches
            .opt_strs(RETRY_STATUSES)
            .into_iter()
            .map(|status| {
                status.parse::<u16>().map_err(|_| ConfigError::InvalidNumber { flag: RETRY_STATUSES, value: status })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: number(matches, MAX_RETRIES, defaults.max_retries)?,
            retry_statuses: if retry_statuses.is_empty() { defaults.retry_statuses } else { retry_statuses },
            backoff_jitter: duration(matches, BACKOFF_JITTER, defaults.backoff_jitter)?,
            max_backoff: duration(matches, MAX_BACKOFF, defaults.max_backoff)?,
        };
        let client_defaults = ClientConfig::default();
        let client = ClientConfig {
            timeout: duration(matches, HTTP_TIMEOUT, client_defaults.timeout)?,
            retry,
            ..client_defaults
        };

        let collector_defaults = MonitoringCollectorOptions::default();
        let collector = MonitoringCollectorOptions {
            metric_type_prefixes: normalize_prefixes(prefixes),
            extra_filters: parse_extra_filters(&matches.opt_strs(FILTERS), EXTRA_FILTER_SEPARATOR),
            request_interval: duration(matches, METRICS_INTERVAL, collector_defaults.request_interval)?,
            request_offset: duration(matches, METRICS_OFFSET, collector_defaults.request_offset)?,
            ingest_delay: flag(matches, METRICS_INGEST_DELAY, collector_defaults.ingest_delay)?,
            fill_missing_labels: flag(matches, FILL_MISSING_LABELS, collector_defaults.fill_missing_labels)?,
            drop_delegated_projects: flag(
                matches,
                DROP_DELEGATED_PROJECTS,
                collector_defaults.drop_delegated_projects,
            )?,
            aggregate_deltas: flag(matches, AGGREGATE_DELTAS, collector_defaults.aggregate_deltas)?,
            descriptor_cache_ttl: duration(
                matches,
                DESCRIPTOR_CACHE_TTL,
                collector_defaults.descriptor_cache_ttl,
            )?,
            descriptor_cache_only_google: flag(
                matches,
                DESCRIPTOR_CACHE_ONLY_GOOGLE,
                collector_defaults.descriptor_cache_only_google,
            )?,
        };

        let log_level = match matches.opt_str(LOG_LEVEL).as_deref() {
            None | Some("info") => LogLevel::Info,
            Some("debug") => LogLevel::Debug,
            Some("warn") => LogLevel::Warn,
            Some("error") => LogLevel::Error,
            Some(other) => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        };

        let mut project_ids = matches.opt_strs(PROJECT_ID);
        project_ids.retain(|id| !id.is_empty());

        Ok(ExporterConfig {
            web,
            project_ids,
            projects_filter: matches.opt_str(PROJECTS_FILTER).filter(|filter| !filter.is_empty()),
            client,
            collector,
            aggregate_deltas_ttl: duration(matches, AGGREGATE_DELTAS_TTL, Duration::from_secs(30 * 60))?,
            log_level,
        })
    }
}

fn listen_address(value: &str) -> Result<SocketAddr, ConfigError> {
    // A missing host means every interface.
    let candidate =
        if value.starts_with(':') { format!("0.0.0.0{value}") } else { value.to_string() };
    candidate.parse().map_err(|_| ConfigError::InvalidAddress(value.to_string()))
}

fn path(matches: &Matches, flag: &'static str) -> Result<String, ConfigError> {
    match matches.opt_str(flag) {
        None => Ok("/metrics".to_string()),
        Some(value) if value.starts_with('/') => Ok(value),
        Some(value) => Err(ConfigError::InvalidPath { flag, value }),
    }
}

fn duration(matches: &Matches, flag: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match matches.opt_str(flag) {
        None => Ok(default),
        Some(value) => parse_duration(&value).map_err(|source| ConfigError::InvalidDuration { flag, source }),
    }
}

fn number(matches: &Matches, flag: &'static str, default: u32) -> Result<u32, ConfigError> {
    match matches.opt_str(flag) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidNumber { flag, value }),
    }
}

fn flag(matches: &Matches, flag: &'static str, default: bool) -> Result<bool, ConfigError> {
    match matches.opt_default(flag, "true").as_deref() {
        None => Ok(default),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(value) => Err(ConfigError::InvalidBool { flag, value: value.to_string() }),
    }
}
