use std::time::Duration;

use bytes::Bytes;
use hyper::{Request, Response};
use rand::Rng;
use tracing::{debug, warn};

use super::transport::{duplicate_request, Transport, TransportError, TransportFuture};

/// Retry policy applied to every request sent to the API.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// HTTP status codes that cause a request to be retried.
    pub retry_statuses: Vec<u16>,
    /// Base delay of the exponential backoff.
    pub backoff_jitter: Duration,
    /// Upper bound of any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 0,
            retry_statuses: vec![503],
            backoff_jitter: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Returns `true` if a response with the given status should be retried.
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Gets the delay before the given retry, starting at 1.
    ///
    /// The delay doubles with each retry and is scaled by a random factor in `[0.5, 1.5)`, but
    /// never exceeds `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = rand::rng().random_range(0.5..1.5);
        self.backoff_with_factor(retry, factor)
    }

    fn backoff_with_factor(&self, retry: u32, factor: f64) -> Duration {
        let exponent = retry.saturating_sub(1).min(62) as i32;
        let delay = self.backoff_jitter.as_secs_f64() * 2f64.powi(exponent) * factor;
        if !delay.is_finite() || delay >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(delay.max(0.0))
    }
}

/// Layer that retries requests answered with a retryable status.
///
/// Transport errors are returned as they are.  When every retry is answered with a retryable
/// status, the last response is returned to the caller.
pub struct RetryLayer<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> RetryLayer<T> {
    /// Wraps `inner` with the given retry policy.
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<T: Transport> RetryLayer<T> {
    async fn send_with_retries(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, TransportError> {
        let mut retry = 0;
        loop {
            let response = self.inner.send(duplicate_request(&request)).await?;
            let status = response.status().as_u16();
            if !self.policy.is_retryable(status) {
                return Ok(response);
            }
            if retry >= self.policy.max_retries {
                if self.policy.max_retries > 0 {
                    warn!(uri = %request.uri(), status, retries = retry, "giving up after exhausting retries");
                }
                return Ok(response);
            }

            retry += 1;
            let delay = self.policy.backoff(retry);
            debug!(uri = %request.uri(), status, retry, ?delay, "retrying request");
            tokio::time::sleep(delay).await;
        }
    }
}

impl<T: Transport> Transport for RetryLayer<T> {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
        Box::pin(self.send_with_retries(request))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use hyper::StatusCode;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use tokio::time::Instant;

    use super::*;

    struct Scripted {
        statuses: Mutex<VecDeque<u16>>,
        sent: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(statuses: &[u16]) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl Transport for Scripted {
        fn send(&self, _: Request<Bytes>) -> TransportFuture<'_> {
            self.sent.lock().push(Instant::now());
            let status = self.statuses.lock().pop_front().unwrap_or(200);
            let response = StatusCode::from_u16(status)
                .map_err(|e| TransportError::Send(e.to_string()))
                .and_then(|status| Ok(Response::builder().status(status).body(Bytes::new())?));
            Box::pin(async move { response })
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_statuses: vec![503],
            backoff_jitter: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        }
    }

    fn request() -> Request<Bytes> {
        Request::get("https://monitoring.googleapis.com/v3/projects/p/metricDescriptors")
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let scripted = Scripted::new(&[503, 503, 503, 200]);
        let layer = RetryLayer::new(Arc::clone(&scripted), policy(5));

        let response = layer.send(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let sent = scripted.sent.lock();
        assert_eq!(sent.len(), 4);
        for pair in sent.windows(2) {
            assert!(pair[1] - pair[0] <= Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_is_returned_immediately() {
        let scripted = Scripted::new(&[429, 200]);
        let layer = RetryLayer::new(Arc::clone(&scripted), policy(5));

        let response = layer.send(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(scripted.sent.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_return_last_response() {
        let scripted = Scripted::new(&[503, 503, 503, 503]);
        let layer = RetryLayer::new(Arc::clone(&scripted), policy(2));

        let response = layer.send(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(scripted.sent.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retries_by_default() {
        let scripted = Scripted::new(&[503, 200]);
        let layer = RetryLayer::new(Arc::clone(&scripted), RetryPolicy::default());

        let response = layer.send(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(scripted.sent.lock().len(), 1);
    }

    #[test]
    fn test_backoff_doubles_until_capped() {
        let policy = policy(10);
        assert_eq!(policy.backoff_with_factor(1, 1.0), Duration::from_secs(1));
        assert_eq!(policy.backoff_with_factor(2, 1.0), Duration::from_secs(2));
        assert_eq!(policy.backoff_with_factor(3, 1.0), Duration::from_secs(4));
        assert_eq!(policy.backoff_with_factor(4, 1.0), Duration::from_secs(5));
        assert_eq!(policy.backoff_with_factor(1, 0.5), Duration::from_millis(500));
        assert_eq!(policy.backoff_with_factor(u32::MAX, 1.5), Duration::from_secs(5));
    }

    proptest! {
        #[test]
        fn test_backoff_never_exceeds_max(
            retry in 1u32..128,
            jitter_ms in 0u64..10_000,
            max_ms in 0u64..60_000,
        ) {
            let policy = RetryPolicy {
                max_retries: 128,
                retry_statuses: vec![503],
                backoff_jitter: Duration::from_millis(jitter_ms),
                max_backoff: Duration::from_millis(max_ms),
            };
            prop_assert!(policy.backoff(retry) <= policy.max_backoff);
        }
    }
}
