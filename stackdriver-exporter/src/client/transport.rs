use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use thiserror::Error as ThisError;

use super::auth::AuthError;

/// Convenience type for the future returned by [`Transport::send`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Response<Bytes>, TransportError>> + Send + 'a>>;

/// Errors that could occur while exchanging a request with a remote endpoint.
#[derive(Debug, ThisError)]
pub enum TransportError {
    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),

    /// The request could not be sent, or no response was received.
    #[error("failed to send request: {0}")]
    Send(String),

    /// The response body could not be read.
    #[error("failed to read response body: {0}")]
    Body(#[from] hyper::Error),

    /// The exchange did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The request could not be authorized.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Sends a request and receives the complete response.
///
/// Transports are composed as layers: each layer wraps an inner transport and adds a single
/// concern, such as authorization, retries or a deadline.
pub trait Transport: Send + Sync {
    /// Sends `request`, returning the response with its body fully read.
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
        (**self).send(request)
    }
}

/// Copies a request so that it can be sent again.
pub(crate) fn duplicate_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut duplicate = Request::new(request.body().clone());
    *duplicate.method_mut() = request.method().clone();
    *duplicate.uri_mut() = request.uri().clone();
    *duplicate.version_mut() = request.version();
    *duplicate.headers_mut() = request.headers().clone();
    duplicate
}

/// Transport over a pooled HTTP/1 client, with TLS using the platform's root certificates.
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HyperTransport {
    /// Creates a new [`HyperTransport`].
    ///
    /// ## Errors
    ///
    /// If the platform's root certificates cannot be loaded, an error is returned.
    pub fn new() -> std::io::Result<HyperTransport> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(https);

        Ok(HyperTransport { client })
    }

    async fn exchange(&self, request: Request<Bytes>) -> Result<Response<Bytes>, TransportError> {
        let request = request.map(Full::new);
        let response =
            self.client.request(request).await.map_err(|e| TransportError::Send(e.to_string()))?;

        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(Response::from_parts(parts, body))
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
        Box::pin(self.exchange(request))
    }
}

#[cfg(test)]
mod tests {
    use hyper::header::AUTHORIZATION;
    use hyper::Method;

    use super::*;

    #[test]
    fn test_duplicate_request_copies_everything() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("https://oauth2.googleapis.com/token")
            .header(AUTHORIZATION, "Bearer abc")
            .body(Bytes::from_static(b"grant_type=x"))
            .unwrap();

        let duplicate = duplicate_request(&request);
        assert_eq!(duplicate.method(), Method::POST);
        assert_eq!(duplicate.uri(), request.uri());
        assert_eq!(duplicate.headers(), request.headers());
        assert_eq!(duplicate.body(), request.body());
    }
}
