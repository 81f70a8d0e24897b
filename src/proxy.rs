use crate::api;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::manager::PreviewManager;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::router::{PreviewRouter, PREVIEW_PREFIX};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Settings for the public listener
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub admin_token: String,
    pub request_timeout: Duration,
    pub max_request_body_bytes: usize,
    pub max_payload_bytes: usize,
    pub pool: PoolConfig,
}

/// State shared by every connection
struct Shared {
    manager: Arc<PreviewManager>,
    router: PreviewRouter,
    admin_token: String,
    max_payload_bytes: usize,
}

/// The public HTTP server: API endpoints and preview routing
pub struct ProxyServer {
    bind_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<PreviewManager>,
        settings: ServerSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(settings.pool));
        let router = PreviewRouter::new(
            Arc::clone(&manager),
            pool,
            settings.request_timeout,
            settings.max_request_body_bytes,
        );

        Self {
            bind_addr,
            shared: Arc::new(Shared {
                manager,
                router,
                admin_token: settings.admin_token,
                max_payload_bytes: settings.max_payload_bytes,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Preview server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, shared).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let stats = self.shared.router.pool().stats();
                        info!(
                            forwarded = stats.get_total_requests(),
                            failed = stats.get_failed_requests(),
                            "Preview server shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move { handle_request(req, shared, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    shared: Arc<Shared>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // X-Forwarded-* are overwritten, not appended: this server is the first trusted hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let path = req.uri().path().to_string();
    let manager = &shared.manager;

    let response = match (req.method(), path.as_str()) {
        (&Method::GET, "/health") => api::health(manager),
        (&Method::GET, "/version") => api::version(),
        (&Method::POST, "/api/preview/create") => {
            api::create_preview(manager, req, shared.max_payload_bytes).await
        }
        (&Method::GET, "/api/preview/instances") => {
            if api::check_auth(req.headers(), &shared.admin_token) {
                api::list_instances(manager)
            } else {
                api::unauthorized()
            }
        }
        (&Method::GET, p) if p.starts_with(api::STATUS_PREFIX) => {
            api::preview_status(manager, &p[api::STATUS_PREFIX.len()..])
        }
        (&Method::DELETE, p) if p.starts_with(api::DELETE_PREFIX) => {
            if api::check_auth(req.headers(), &shared.admin_token) {
                api::delete_preview(manager, &p[api::DELETE_PREFIX.len()..]).await
            } else {
                api::unauthorized()
            }
        }
        (_, p) if p.starts_with(PREVIEW_PREFIX) || p == "/preview" => {
            shared.router.route(req, &request_id).await
        }
        _ => json_error_response(ProxyErrorCode::NotFound, "Not found"),
    };

    Ok(response)
}
