//! Client for the Cloud Monitoring and Cloud Resource Manager APIs.
//!
//! Requests go through a stack of [`Transport`] layers: a timeout bounding the whole exchange, a
//! retry layer with exponential backoff, and an authorization layer, on top of a pooled HTTP
//! client.  Every call is a read-only `GET`, so requests can be retried blindly.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::header::ACCEPT;
use hyper::Request;
use serde::de::DeserializeOwned;
use thiserror::Error as ThisError;
use tracing::trace;

pub mod auth;
use self::auth::{AuthError, TokenSource};

mod layers;
pub use self::layers::{AuthLayer, TimeoutLayer};

pub mod monitoring;
use self::monitoring::{MetricDescriptorPage, TimeSeriesPage, TimeWindow};

pub mod projects;
use self::projects::ProjectPage;

mod retry;
pub use self::retry::{RetryLayer, RetryPolicy};

mod transport;
pub use self::transport::{HyperTransport, Transport, TransportError, TransportFuture};

/// Default Cloud Monitoring endpoint.
pub const MONITORING_ENDPOINT: &str = "https://monitoring.googleapis.com/v3";

/// Default Cloud Resource Manager endpoint.
pub const RESOURCE_MANAGER_ENDPOINT: &str = "https://cloudresourcemanager.googleapis.com/v1";

// Longest response body carried in an error.
const MAX_ERROR_BODY: usize = 512;

/// Configuration of the API client.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// Deadline of a whole call, retries included.
    pub timeout: Duration,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Base URL of the Cloud Monitoring API.
    pub monitoring_endpoint: String,
    /// Base URL of the Cloud Resource Manager API.
    pub resource_manager_endpoint: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            monitoring_endpoint: MONITORING_ENDPOINT.to_string(),
            resource_manager_endpoint: RESOURCE_MANAGER_ENDPOINT.to_string(),
        }
    }
}

/// Errors that could occur while creating the API client.
#[derive(Debug, ThisError)]
pub enum ClientError {
    /// The platform's root certificates could not be loaded.
    #[error("failed to load root certificates: {0}")]
    RootCertificates(#[source] std::io::Error),

    /// Credentials could not be obtained.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Errors that could occur while calling the API.
#[derive(Debug, ThisError)]
pub enum ApiError {
    /// The API kept answering with a retryable status until retries ran out.
    #[error("API answered {status} after exhausting retries: {body}")]
    Transient {
        /// HTTP status of the last response.
        status: u16,
        /// Body of the last response.
        body: String,
    },

    /// The API answered with an error status.
    #[error("API answered {status}: {body}")]
    Status {
        /// HTTP status of the response.
        status: u16,
        /// Body of the response.
        body: String,
    },

    /// The request could not be exchanged.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The response could not be decoded.
    #[error("failed to decode API response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// Returns `true` if the error was caused by a retryable status.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }
}

struct Inner {
    transport: Box<dyn Transport>,
    retry_statuses: Vec<u16>,
    monitoring_endpoint: String,
    resource_manager_endpoint: String,
}

/// Client for the Cloud Monitoring and Cloud Resource Manager APIs.
///
/// Cloning the client is cheap, and clones share the same connection pool.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

/// Creates an API client over a new HTTP connection pool.
///
/// ## Errors
///
/// If the platform's root certificates cannot be loaded, an error is returned.
pub fn create_api_client(
    config: &ClientConfig,
    tokens: Arc<dyn TokenSource>,
) -> Result<ApiClient, ClientError> {
    let transport = HyperTransport::new().map_err(ClientError::RootCertificates)?;
    Ok(ApiClient::with_transport(transport, tokens, config))
}

impl ApiClient {
    /// Creates an API client over the given transport.
    ///
    /// The transport is wrapped, from the outside in, with a [`TimeoutLayer`], a [`RetryLayer`]
    /// and an [`AuthLayer`].
    pub fn with_transport<T>(transport: T, tokens: Arc<dyn TokenSource>, config: &ClientConfig) -> Self
    where
        T: Transport + 'static,
    {
        let transport = AuthLayer::new(transport, tokens);
        let transport = RetryLayer::new(transport, config.retry.clone());
        let transport = TimeoutLayer::new(transport, config.timeout);

        ApiClient {
            inner: Arc::new(Inner {
                transport: Box::new(transport),
                retry_statuses: config.retry.retry_statuses.clone(),
                monitoring_endpoint: config.monitoring_endpoint.trim_end_matches('/').to_string(),
                resource_manager_endpoint: config.resource_manager_endpoint.trim_end_matches('/').to_string(),
            }),
        }
    }

    /// Lists one page of the metric descriptors of a project matching `filter`.
    pub async fn list_metric_descriptors(
        &self,
        project: &str,
        filter: &str,
        page_token: Option<&str>,
    ) -> Result<MetricDescriptorPage, ApiError> {
        let url = format!(
            "{}/projects/{}/metricDescriptors?{}",
            self.inner.monitoring_endpoint,
            path_segment(project),
            query_string(&[("filter", filter)], page_token)
        );
        self.get(url).await
    }

    /// Lists one page of the time series of a project matching `filter` within `window`.
    pub async fn list_time_series(
        &self,
        project: &str,
        filter: &str,
        window: &TimeWindow,
        page_token: Option<&str>,
    ) -> Result<TimeSeriesPage, ApiError> {
        let (start_time, end_time) = (window.start_time(), window.end_time());
        let pairs = [
            ("filter", filter),
            ("interval.startTime", start_time.as_str()),
            ("interval.endTime", end_time.as_str()),
            ("view", "FULL"),
        ];
        let url = format!(
            "{}/projects/{}/timeSeries?{}",
            self.inner.monitoring_endpoint,
            path_segment(project),
            query_string(&pairs, page_token)
        );
        self.get(url).await
    }

    /// Searches one page of the projects matching `filter`.
    pub async fn search_projects(
        &self,
        filter: &str,
        page_token: Option<&str>,
    ) -> Result<ProjectPage, ApiError> {
        let url = format!(
            "{}/projects?{}",
            self.inner.resource_manager_endpoint,
            query_string(&[("filter", filter)], page_token)
        );
        self.get(url).await
    }

    async fn get<T: DeserializeOwned>(&self, url: String) -> Result<T, ApiError> {
        trace!(%url, "calling API");
        let request = Request::get(url)
            .header(ACCEPT, "application/json")
            .body(Bytes::new())
            .map_err(TransportError::from)?;

        let response = self.inner.transport.send(request).await?;
        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(serde_json::from_slice(response.body())?);
        }

        let body = error_body(response.body());
        if self.inner.retry_statuses.contains(&status) {
            Err(ApiError::Transient { status, body })
        } else {
            Err(ApiError::Status { status, body })
        }
    }
}

// The serializer is not `Send`, so it must never live across an await point.
fn query_string(pairs: &[(&str, &str)], page_token: Option<&str>) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.extend_pairs(pairs.iter().copied());
    if let Some(token) = page_token {
        query.append_pair("pageToken", token);
    }
    query.finish()
}

fn path_segment(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn error_body(body: &[u8]) -> String {
    let body = String::from_utf8_lossy(body);
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_string(),
    }
}
