//! Path-based routing of preview traffic to instances
//!
//! `/preview/{appId}/rest?query` is forwarded to the instance for `appId`
//! as `/rest?query`. A request for an app with no live instance triggers
//! one rehydration from storage; anything else is a 404.

use crate::error::{json_error_response, routing_error_response, ProxyErrorCode};
use crate::manager::PreviewManager;
use crate::pool::{ConnectionPool, UpstreamRequest};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Path prefix served by the router
pub const PREVIEW_PREFIX: &str = "/preview/";
/// Longest accepted app id
pub const MAX_APP_ID_LEN: usize = 64;
/// Header carrying the stripped path prefix
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

/// Forward attempts per request: the first lookup plus one after a miss
const MAX_FORWARD_ATTEMPTS: usize = 2;

/// Hop-by-hop headers that are not forwarded
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// App ids are ASCII alphanumerics, `-` and `_`
pub fn is_valid_app_id(app_id: &str) -> bool {
    !app_id.is_empty()
        && app_id.len() <= MAX_APP_ID_LEN
        && app_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Split a preview path into the app id and the upstream path and query
pub fn parse_preview_path(path: &str, query: Option<&str>) -> Option<(String, String)> {
    let rest = path.strip_prefix(PREVIEW_PREFIX)?;

    let (app_id, upstream_path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    if !is_valid_app_id(app_id) {
        return None;
    }

    let upstream = match query {
        Some(q) => format!("{}?{}", upstream_path, q),
        None => upstream_path.to_string(),
    };
    Some((app_id.to_string(), upstream))
}

/// Why a request body could not be buffered
#[derive(Debug)]
pub enum BodyError {
    TooLarge { limit: usize },
    Read(String),
}

/// Buffer a request body, refusing anything over `limit` bytes
pub async fn collect_limited(body: Incoming, limit: usize) -> Result<Bytes, BodyError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(BodyError::TooLarge { limit }),
        Err(e) => Err(BodyError::Read(e.to_string())),
    }
}

/// Content-Length header value, if present and valid
pub fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

pub struct PreviewRouter {
    manager: Arc<PreviewManager>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    max_body_bytes: usize,
}

impl PreviewRouter {
    pub fn new(
        manager: Arc<PreviewManager>,
        pool: Arc<ConnectionPool>,
        request_timeout: Duration,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            manager,
            pool,
            request_timeout,
            max_body_bytes,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Route a request whose path starts with `/preview`
    pub async fn route(&self, req: Request<Incoming>, request_id: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        let Some((app_id, path_and_query)) = parse_preview_path(req.uri().path(), req.uri().query()) else {
            return json_error_response(ProxyErrorCode::NotFound, "Preview not found");
        };

        let work = async {
            match self.buffer(req, &app_id, path_and_query, request_id).await {
                Ok(upstream) => self.dispatch(&app_id, &upstream, request_id).await,
                Err(response) => response,
            }
        };
        self.within_timeout(&app_id, request_id, work).await
    }

    /// Forward an already buffered request to the instance for `app_id`
    pub async fn forward(
        &self,
        app_id: &str,
        upstream: UpstreamRequest,
        request_id: &str,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        self.within_timeout(app_id, request_id, self.dispatch(app_id, &upstream, request_id))
            .await
    }

    async fn within_timeout<F>(&self, app_id: &str, request_id: &str, work: F) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        F: Future<Output = Response<BoxBody<Bytes, hyper::Error>>>,
    {
        match tokio::time::timeout(self.request_timeout, work).await {
            Ok(response) => response,
            Err(_) => {
                warn!(
                    app_id,
                    request_id,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", self.request_timeout.as_secs()),
                )
            }
        }
    }

    /// Buffer the body and rewrite headers for the instance
    async fn buffer(
        &self,
        req: Request<Incoming>,
        app_id: &str,
        path_and_query: String,
        request_id: &str,
    ) -> Result<UpstreamRequest, Response<BoxBody<Bytes, hyper::Error>>> {
        if declared_length(req.headers()).is_some_and(|len| len > self.max_body_bytes) {
            return Err(json_error_response(ProxyErrorCode::PayloadTooLarge, "Request body too large"));
        }

        let (parts, body) = req.into_parts();
        let body = match collect_limited(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(BodyError::TooLarge { .. }) => {
                return Err(json_error_response(ProxyErrorCode::PayloadTooLarge, "Request body too large"));
            }
            Err(BodyError::Read(e)) => {
                debug!(app_id, request_id, error = %e, "Failed to read request body");
                return Err(json_error_response(ProxyErrorCode::InvalidRequest, "Failed to read request body"));
            }
        };

        let mut headers = parts.headers;
        for name in HOP_BY_HOP.iter() {
            headers.remove(name);
        }
        headers.remove(header::CONTENT_LENGTH);
        if let Ok(prefix) = HeaderValue::from_str(&format!("/preview/{}", app_id)) {
            headers.insert(X_FORWARDED_PREFIX, prefix);
        }

        Ok(UpstreamRequest {
            method: parts.method,
            path_and_query,
            headers,
            body,
        })
    }

    async fn dispatch(
        &self,
        app_id: &str,
        upstream: &UpstreamRequest,
        request_id: &str,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let mut rehydrated = false;
        for _ in 0..MAX_FORWARD_ATTEMPTS {
            let port = match self.manager.lookup(app_id) {
                Some(port) => port,
                None if !rehydrated => {
                    rehydrated = true;
                    debug!(app_id, request_id, "No live instance, rehydrating");
                    match self.manager.rehydrate(app_id).await {
                        Ok(port) => port,
                        Err(e) => {
                            if e.is_miss() {
                                debug!(app_id, request_id, error = %e, "Preview miss");
                            } else {
                                error!(app_id, request_id, error = %e, "Rehydration failed");
                            }
                            return routing_error_response(&e);
                        }
                    }
                }
                None => break,
            };

            debug!(app_id, port, request_id, method = %upstream.method, path = %upstream.path_and_query, "Forwarding request");
            match self.pool.send_request(upstream, port).await {
                Ok(response) => return response,
                Err(e) if self.manager.lookup(app_id) == Some(port) => {
                    error!(app_id, port, request_id, error = %e, "Failed to forward request via pool");
                    return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to preview");
                }
                Err(e) => {
                    // Instance went away between lookup and forward
                    debug!(app_id, port, request_id, error = %e, "Instance vanished during forward");
                }
            }
        }

        json_error_response(ProxyErrorCode::NotFound, "Preview not found")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppDefinition, AppSource};
    use crate::config::Config;
    use crate::launcher::InstanceHandle;
    use crate::pool::PoolConfig;
    use crate::registry::{Reservation, Teardown};
    use crate::render::ScaffoldRenderer;
    use crate::store::{AppStore, MemoryStore};
    use chrono::Utc;
    use hyper::{Method, StatusCode};
    use tokio::net::TcpListener;

    fn router_with(base: u16, request_timeout: Duration) -> (PreviewRouter, Arc<PreviewManager>, Arc<MemoryStore>) {
        let mut config = Config::default();
        config.preview.port_range_start = base;
        config.preview.port_range_end = base + 9;
        config.preview.shutdown_grace_period_secs = 1;
        let store = Arc::new(MemoryStore::new());
        let manager = PreviewManager::new(&config, store.clone(), Arc::new(ScaffoldRenderer));
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let router = PreviewRouter::new(Arc::clone(&manager), pool, request_timeout, 1024);
        (router, manager, store)
    }

    fn definition(html: &str) -> AppDefinition {
        let source = AppSource {
            html: html.to_string(),
            ..AppSource::default()
        };
        AppDefinition::new("u", source, Utc::now(), Duration::from_secs(60))
    }

    fn get(path: &str) -> UpstreamRequest {
        UpstreamRequest {
            method: Method::GET,
            path_and_query: path.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Reserve a slot for `def` and bind its port in place of a launch
    async fn reserve_and_bind(manager: &PreviewManager, def: &AppDefinition) -> (u16, u64, TcpListener) {
        let Reservation::Reserved { port, generation } = manager.registry().reserve(def).unwrap() else {
            panic!("expected Reserved");
        };
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        (port, generation, listener)
    }

    #[tokio::test]
    async fn test_silent_instance_times_out() {
        let (router, manager, _store) = router_with(43300, Duration::from_millis(300));
        let def = definition("<p>silent</p>");
        let (port, generation, listener) = reserve_and_bind(&manager, &def).await;

        // Accepts connections and never answers
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        manager
            .registry()
            .activate(&def.app_id, generation, InstanceHandle::serving(task))
            .unwrap();

        let start = std::time::Instant::now();
        let response = router.forward(&def.app_id, get("/"), "req-timeout").await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(start.elapsed() < Duration::from_secs(2));
        // A timeout does not reclaim the instance
        assert_eq!(manager.lookup(&def.app_id), Some(port));
    }

    #[tokio::test]
    async fn test_instance_vanishing_mid_forward_is_a_miss() {
        let (router, manager, store) = router_with(43320, Duration::from_secs(5));
        let def = definition("<p>back again</p>");
        store.save(&def).unwrap();
        let (_port, generation, listener) = reserve_and_bind(&manager, &def).await;

        // Tears its own slot down as the request arrives, then hangs up
        let registry = Arc::clone(manager.registry());
        let app_id = def.app_id.clone();
        let task = tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Teardown::Claimed(claim) = registry.begin_teardown(&app_id, None) else {
                return;
            };
            drop(stream);
            drop(listener);
            registry.complete_teardown(&claim);
        });
        manager
            .registry()
            .activate(&def.app_id, generation, InstanceHandle::serving(task))
            .unwrap();

        // Treated as a miss: rehydrated from storage and served
        let response = router.forward(&def.app_id, get("/"), "req-vanish").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("back again"));
        assert_eq!(manager.stats().rehydrated, 1);
        assert!(manager.lookup(&def.app_id).is_some());
    }

    #[tokio::test]
    async fn test_routed_but_dead_instance_is_bad_gateway() {
        let (router, manager, _store) = router_with(43340, Duration::from_secs(5));
        let def = definition("<p>dead</p>");
        let (port, generation, listener) = reserve_and_bind(&manager, &def).await;
        drop(listener);

        let task = tokio::spawn(async {});
        manager
            .registry()
            .activate(&def.app_id, generation, InstanceHandle::serving(task))
            .unwrap();

        let response = router.forward(&def.app_id, get("/"), "req-dead").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(manager.lookup(&def.app_id), Some(port));
        assert_eq!(manager.stats().rehydrated, 0);
    }

    #[test]
    fn test_parse_preview_path() {
        assert_eq!(
            parse_preview_path("/preview/abc123/", None),
            Some(("abc123".to_string(), "/".to_string()))
        );
        assert_eq!(
            parse_preview_path("/preview/abc123", None),
            Some(("abc123".to_string(), "/".to_string()))
        );
        assert_eq!(
            parse_preview_path("/preview/my-app_1/assets/app.js", Some("v=2&x=y")),
            Some(("my-app_1".to_string(), "/assets/app.js?v=2&x=y".to_string()))
        );
        assert_eq!(
            parse_preview_path("/preview/abc", Some("q=1")),
            Some(("abc".to_string(), "/?q=1".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_bad_paths() {
        assert_eq!(parse_preview_path("/preview/", None), None);
        assert_eq!(parse_preview_path("/preview", None), None);
        assert_eq!(parse_preview_path("/previewer/abc", None), None);
        assert_eq!(parse_preview_path("/other/abc", None), None);
        assert_eq!(parse_preview_path("/preview/a.b/", None), None);
        assert_eq!(parse_preview_path("/preview/%2e%2e/", None), None);

        let long = "a".repeat(MAX_APP_ID_LEN + 1);
        assert_eq!(parse_preview_path(&format!("/preview/{}/", long), None), None);
        let max = "a".repeat(MAX_APP_ID_LEN);
        assert!(parse_preview_path(&format!("/preview/{}/", max), None).is_some());
    }

    #[test]
    fn test_valid_app_id() {
        assert!(is_valid_app_id("0f8fad5bd9cb469fa16570867728950e"));
        assert!(is_valid_app_id("A-b_C"));
        assert!(!is_valid_app_id(""));
        assert!(!is_valid_app_id("has space"));
        assert!(!is_valid_app_id("ünï"));
    }

    #[test]
    fn test_declared_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(declared_length(&headers), None);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(declared_length(&headers), Some(42));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("nope"));
        assert_eq!(declared_length(&headers), None);
    }
}
