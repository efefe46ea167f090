use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use stackdriver_exporter::client::auth::StaticTokenSource;
use stackdriver_exporter::client::{Transport, TransportError, TransportFuture};
use stackdriver_exporter::{
    server, ApiClient, ClientConfig, DeltaStores, MonitoringCollectorOptions, RegistryAssembler,
    RetryPolicy, Router, WebConfig,
};

/// Serves a single DELTA metric whose point advances on every time series call, after
/// answering the very first call with 503.
struct ScriptedApi {
    series_calls: AtomicUsize,
}

impl Transport for ScriptedApi {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
        let path = request.uri().path().to_string();
        let (status, body) = if path.ends_with("/metricDescriptors") {
            let body = json!({"metricDescriptors": [{
                "name": "projects/demo/metricDescriptors/pubsub.googleapis.com/topic/send_request_count",
                "type": "pubsub.googleapis.com/topic/send_request_count",
                "metricKind": "DELTA",
                "valueType": "INT64",
                "unit": "1",
                "description": "Cumulative count of publish requests.",
            }]});
            (200, body)
        } else {
            match self.series_calls.fetch_add(1, Ordering::SeqCst) {
                0 => (503, json!({"error": {"code": 503}})),
                call => {
                    let minute = call;
                    let body = json!({"timeSeries": [{
                        "metric": {"type": "pubsub.googleapis.com/topic/send_request_count", "labels": {"response_code": "success"}},
                        "resource": {"type": "pubsub_topic", "labels": {"project_id": "demo", "topic_id": "orders"}},
                        "metricKind": "DELTA",
                        "valueType": "INT64",
                        "points": [{
                            "interval": {"endTime": format!("2024-05-01T10:{minute:02}:00Z")},
                            "value": {"int64Value": "10"},
                        }],
                    }]});
                    (200, body)
                }
            }
        };

        let response =
            Response::builder().status(status).body(Bytes::from(body.to_string())).map_err(TransportError::from);
        Box::pin(async move { response })
    }
}

async fn start_exporter() -> SocketAddr {
    let config = ClientConfig {
        retry: RetryPolicy {
            max_retries: 1,
            backoff_jitter: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..Default::default()
        },
        ..Default::default()
    };
    let client = ApiClient::with_transport(
        ScriptedApi { series_calls: AtomicUsize::new(0) },
        Arc::new(StaticTokenSource::new("token")),
        &config,
    );
    let options = MonitoringCollectorOptions {
        metric_type_prefixes: vec!["pubsub.googleapis.com/".to_string()],
        aggregate_deltas: true,
        ..Default::default()
    };
    let assembler = RegistryAssembler::new(
        vec!["demo".to_string()],
        options,
        client,
        DeltaStores::new(Duration::from_secs(600)),
    );

    let web = WebConfig {
        listen_address: "127.0.0.1:0".parse().unwrap(),
        telemetry_path: "/metrics".to_string(),
        stackdriver_telemetry_path: "/metrics".to_string(),
    };
    let router = Router::for_exporter(&web, Arc::new(assembler)).unwrap();
    let listener = server::bind(web.listen_address).unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, Arc::new(router)));
    address
}

async fn get(address: SocketAddr, path: &str) -> (StatusCode, String) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let response = client.get(format!("http://{address}{path}").parse().unwrap()).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_scrapes_accumulate_deltas_across_requests() {
    let address = start_exporter().await;
    let name = "stackdriver_pubsub_topic_pubsub_googleapis_com_topic_send_request_count";

    let (status, first) = get(address, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(first.contains(&format!("# TYPE {name} counter")), "{first}");
    assert!(first.contains(&format!(
        "{name}{{unit=\"1\",response_code=\"success\",project_id=\"demo\",topic_id=\"orders\"}} 10 1714557660000"
    )));
    assert!(first.contains("stackdriver_exporter_build_info{"));

    let (_, second) = get(address, "/metrics?collect=pubsub.googleapis.com/").await;
    assert!(second.contains(&format!(
        "{name}{{unit=\"1\",response_code=\"success\",project_id=\"demo\",topic_id=\"orders\"}} 20 1714557720000"
    )));
    assert!(second.contains("stackdriver_monitoring_scrape_errors_total{project_id=\"demo\"} 0"));
    assert!(second.contains("promhttp_metric_handler_requests_total{code=\"200\"} 1"));

    let (_, unselected) = get(address, "/metrics?collect=compute.googleapis.com/").await;
    assert!(!unselected.contains(&format!("{name}{{")));

    let (status, _) = get(address, "/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
