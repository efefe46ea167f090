//! The HTTP listener.
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ALLOW};
use hyper::server::conn::http1::Builder as HyperHttpBuilder;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::assembler::RegistryAssembler;
use crate::config::WebConfig;
use crate::error::StartupError;
use crate::handler::{process_registry, text_response, HandlerTelemetry, ScrapeHandler};

/// Maps request paths to scrape handlers.
#[derive(Default)]
pub struct Router {
    routes: Vec<(String, ScrapeHandler)>,
}

impl Router {
    /// Creates a router without routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the routes of the exporter.
    ///
    /// When both paths are the same, the exporter's own metrics are served ahead of the
    /// monitoring metrics on that path; otherwise each is served on its own path.
    ///
    /// ## Errors
    ///
    /// If the exporter's own collectors cannot be registered, an error is returned.
    pub fn for_exporter(web: &WebConfig, assembler: Arc<RegistryAssembler>) -> Result<Self, StartupError> {
        let telemetry = HandlerTelemetry::new();
        let process = Arc::new(process_registry(&telemetry)?);

        let router = if web.shared_path() {
            Router::new().route(
                web.telemetry_path.clone(),
                ScrapeHandler::monitoring(assembler, Some(process), telemetry),
            )
        } else {
            info!(path = %web.stackdriver_telemetry_path, "serving Stackdriver metrics at separate path");
            Router::new()
                .route(
                    web.stackdriver_telemetry_path.clone(),
                    ScrapeHandler::monitoring(assembler, None, telemetry.clone()),
                )
                .route(web.telemetry_path.clone(), ScrapeHandler::process(process, telemetry))
        };
        Ok(router)
    }

    /// Serves `handler` on `path`.
    pub fn route(mut self, path: impl Into<String>, handler: ScrapeHandler) -> Self {
        self.routes.push((path.into(), handler));
        self
    }

    /// Handles a request.
    ///
    /// Only `GET` and `HEAD` are accepted, and unknown paths are not found.
    pub async fn handle(&self, method: &Method, uri: &Uri) -> Response<Full<Bytes>> {
        let Some((_, handler)) = self.routes.iter().find(|(path, _)| path == uri.path()) else {
            return text_response(StatusCode::NOT_FOUND, "404 page not found\n");
        };

        if method != Method::GET && method != Method::HEAD {
            let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
            response.headers_mut().insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        handler.handle(uri.query()).await
    }
}

/// Binds the listener.
///
/// ## Errors
///
/// If the address cannot be bound, an error is returned.
pub fn bind(address: SocketAddr) -> Result<std::net::TcpListener, StartupError> {
    std::net::TcpListener::bind(address)
        .and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        })
        .map_err(|source| StartupError::Bind { address, source })
}

/// Accepts connections on `listener` forever, serving each on its own task.
///
/// ## Errors
///
/// If the listener cannot be registered with the runtime, an error is returned.
pub async fn serve(listener: std::net::TcpListener, router: Arc<Router>) -> io::Result<()> {
    let listener = TcpListener::from_std(listener)?;

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(error = ?e, "error accepting connection, ignoring request");
                continue;
            }
        };

        process_stream(stream, Arc::clone(&router));
    }
}

fn process_stream(stream: TcpStream, router: Arc<Router>) {
    let service = service_fn(move |request: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move {
            let (parts, _) = request.into_parts();
            Ok::<_, hyper::Error>(router.handle(&parts.method, &parts.uri).await)
        }
    });

    tokio::task::spawn(async move {
        if let Err(e) = HyperHttpBuilder::new().serve_connection(TokioIo::new(stream), service).await {
            debug!(error = ?e, "error serving connection");
        }
    });
}
