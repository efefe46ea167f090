//! An in-memory stand-in for the Cloud Monitoring API.
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use hyper::{Request, Response};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::client::auth::StaticTokenSource;
use crate::client::{ApiClient, ClientConfig, Transport, TransportError, TransportFuture};

type Route = Box<dyn Fn(&str, &HashMap<String, String>) -> (u16, Value) + Send + Sync>;

/// Answers requests by path and decoded query, and remembers them.
pub(crate) struct FakeApi {
    route: Route,
    calls: Mutex<Vec<(String, HashMap<String, String>)>>,
}

impl FakeApi {
    pub(crate) fn new<F>(route: F) -> Arc<Self>
    where
        F: Fn(&str, &HashMap<String, String>) -> (u16, Value) + Send + Sync + 'static,
    {
        Arc::new(Self { route: Box::new(route), calls: Mutex::new(Vec::new()) })
    }

    /// Gets the queries of the calls whose path ends with `suffix`.
    pub(crate) fn calls_to(&self, suffix: &str) -> Vec<HashMap<String, String>> {
        self.calls.lock().iter().filter(|(path, _)| path.ends_with(suffix)).map(|(_, q)| q.clone()).collect()
    }

    pub(crate) fn client(self: &Arc<Self>) -> ApiClient {
        ApiClient::with_transport(Arc::clone(self), Arc::new(StaticTokenSource::new("t")), &ClientConfig::default())
    }
}

impl Transport for FakeApi {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
        let path = request.uri().path().to_string();
        let query = form_urlencoded::parse(request.uri().query().unwrap_or("").as_bytes())
            .into_owned()
            .collect::<HashMap<_, _>>();
        let (status, body) = (self.route)(&path, &query);
        self.calls.lock().push((path, query));

        let response =
            Response::builder().status(status).body(Bytes::from(body.to_string())).map_err(TransportError::from);
        Box::pin(async move { response })
    }
}

pub(crate) fn descriptor(metric_type: &str, kind: &str, value_type: &str) -> Value {
    json!({
        "name": format!("projects/p/metricDescriptors/{metric_type}"),
        "type": metric_type,
        "metricKind": kind,
        "valueType": value_type,
        "unit": "1",
        "description": format!("Description of {metric_type}."),
    })
}

pub(crate) fn series(metric_type: &str, labels: Value, end_time: &str, value: Value) -> Value {
    json!({
        "metric": {"type": metric_type, "labels": labels},
        "resource": {"type": "gce_instance", "labels": {"project_id": "p", "zone": "us-east1-b"}},
        "points": [{"interval": {"endTime": end_time}, "value": value}],
    })
}

/// An API where every listed prefix has a single gauge named after the prefix's domain.
pub(crate) fn gauge_per_prefix_api() -> Arc<FakeApi> {
    FakeApi::new(|path, query| {
        let filter = query.get("filter").map(String::as_str).unwrap_or("");
        let domain = filter.split('"').nth(1).and_then(|t| t.split('/').next()).unwrap_or("").to_string();
        let metric_type = format!("{domain}/up");
        if path.ends_with("/metricDescriptors") {
            (200, json!({"metricDescriptors": [descriptor(&metric_type, "GAUGE", "DOUBLE")]}))
        } else {
            (200, json!({"timeSeries": [series(&metric_type, json!({}), "2024-05-01T10:00:00Z", json!({"doubleValue": 1.0}))]}))
        }
    })
}
