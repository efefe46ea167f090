use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::Request;

use super::auth::{AuthError, TokenSource};
use super::transport::{Transport, TransportError, TransportFuture};

/// Layer that bounds the duration of a whole exchange, including any retries below it.
pub struct TimeoutLayer<T> {
    inner: T,
    timeout: Duration,
}

impl<T> TimeoutLayer<T> {
    /// Wraps `inner` with the given timeout.
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<T: Transport> Transport for TimeoutLayer<T> {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
        Box::pin(async move {
            tokio::time::timeout(self.timeout, self.inner.send(request))
                .await
                .map_err(|_| TransportError::Timeout(self.timeout))?
        })
    }
}

/// Layer that authorizes every request with a bearer token.
pub struct AuthLayer<T> {
    inner: T,
    tokens: Arc<dyn TokenSource>,
}

impl<T> AuthLayer<T> {
    /// Wraps `inner`, taking tokens from `tokens`.
    pub fn new(inner: T, tokens: Arc<dyn TokenSource>) -> Self {
        Self { inner, tokens }
    }
}

impl<T: Transport> Transport for AuthLayer<T> {
    fn send(&self, mut request: Request<Bytes>) -> TransportFuture<'_> {
        Box::pin(async move {
            let token = self.tokens.token().await?;
            let mut header = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| AuthError::InvalidToken)?;
            header.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, header);

            self.inner.send(request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use hyper::{Response, StatusCode};
    use parking_lot::Mutex;

    use super::*;
    use crate::client::auth::StaticTokenSource;

    #[derive(Default)]
    struct Recording {
        headers: Mutex<Vec<Option<HeaderValue>>>,
    }

    impl Transport for Recording {
        fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
            self.headers.lock().push(request.headers().get(AUTHORIZATION).cloned());
            let response =
                Response::builder().status(StatusCode::OK).body(Bytes::new()).map_err(TransportError::from);
            Box::pin(async move { response })
        }
    }

    struct Stalled;

    impl Transport for Stalled {
        fn send(&self, _: Request<Bytes>) -> TransportFuture<'_> {
            Box::pin(futures::future::pending::<Result<Response<Bytes>, TransportError>>())
        }
    }

    fn request() -> Request<Bytes> {
        Request::get("https://monitoring.googleapis.com/v3/projects/p/timeSeries")
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_auth_layer_attaches_sensitive_bearer_token() {
        let recording = Arc::new(Recording::default());
        let layer = AuthLayer::new(Arc::clone(&recording), Arc::new(StaticTokenSource::new("ya29.token")));

        layer.send(request()).await.unwrap();

        let headers = recording.headers.lock();
        let header = headers[0].as_ref().unwrap();
        assert_eq!(header, "Bearer ya29.token");
        assert!(header.is_sensitive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_layer_gives_up() {
        let layer = TimeoutLayer::new(Stalled, Duration::from_secs(10));

        let err = layer.send(request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(timeout) if timeout == Duration::from_secs(10)));
    }
}
