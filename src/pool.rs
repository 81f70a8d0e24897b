//! Connection pool for instance HTTP connections
//!
//! Forwarded requests reuse keep-alive connections to instances. Request
//! bodies are buffered so that a forward can be replayed once against a
//! rehydrated instance.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests made through the pool
    pub total_requests: AtomicU64,
    /// Requests that got no response from the instance
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Host instances listen on
    pub upstream_host: String,
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            upstream_host: "127.0.0.1".to_string(),
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A buffered request that can be sent more than once
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A connection pool for HTTP connections to preview instances
pub struct ConnectionPool {
    client: Client<HttpConnector, Full<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to the instance on `port`
    pub async fn send_request(
        &self,
        req: &UpstreamRequest,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!("http://{}:{}{}", self.config.upstream_host, port, req.path_and_query);

        let mut builder = Request::builder().method(req.method.clone()).uri(&uri);
        for (key, value) in req.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(Full::new(req.body.clone()))
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = match self.client.request(upstream_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
