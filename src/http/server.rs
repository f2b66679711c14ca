//! HTTP server and routing for the admission gate.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::any;
use axum::{middleware, Router};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::middleware::admit;
use super::upstream::{relay, Upstream};
use crate::config::ServerConfig;
use crate::error::{Result, SluiceError};
use crate::ratelimit::AdmissionControl;

/// Build the serving pipeline.
///
/// The admission middleware wraps the whole router, so every inbound request
/// consumes a slot, including requests for unknown paths.
pub fn router(
    limiter: Arc<dyn AdmissionControl>,
    upstream: Arc<dyn Upstream>,
    config: &ServerConfig,
) -> Router {
    Router::new()
        .route(&config.route, any(relay))
        .with_state(upstream)
        .layer(middleware::from_fn_with_state(limiter, admit))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyTimeoutLayer::new(config.read_timeout()))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.write_timeout(),
        ))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// HTTP server for the rate limited route.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The serving pipeline
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server stops accepting connections when the provided signal
    /// resolves and returns once in-flight requests have finished.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            SluiceError::Io(e)
        })?;

        info!(addr = %listener.local_addr()?, "HTTP server listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                SluiceError::Io(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::LeakyBucket;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::header;
    use axum::response::{IntoResponse, Response};
    use std::time::Duration;
    use tower::ServiceExt;

    struct EchoPath;

    #[async_trait]
    impl Upstream for EchoPath {
        async fn forward(&self, request: Request) -> Result<Response> {
            Ok(request.uri().path().to_string().into_response())
        }
    }

    struct Stalled;

    #[async_trait]
    impl Upstream for Stalled {
        async fn forward(&self, _request: Request) -> Result<Response> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(StatusCode::OK.into_response())
        }
    }

    struct Broken;

    #[async_trait]
    impl Upstream for Broken {
        async fn forward(&self, _request: Request) -> Result<Response> {
            Err(SluiceError::Io(std::io::Error::other("connection refused")))
        }
    }

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_router_admits_then_rejects_then_recovers() {
        let bucket = Arc::new(LeakyBucket::new(2, Duration::from_millis(10)).unwrap());
        let app = router(bucket.clone(), Arc::new(EchoPath), &ServerConfig::default());

        let first = app.clone().oneshot(get("/request")).await.unwrap();
        let second = app.clone().oneshot(get("/request")).await.unwrap();
        let third = app.clone().oneshot(get("/request")).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_text(first).await, "/request");

        tokio::time::sleep(Duration::from_millis(15)).await;

        let fourth = app.oneshot(get("/request")).await.unwrap();
        assert_eq!(fourth.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_request_id_is_assigned_and_propagated() {
        let bucket = Arc::new(LeakyBucket::new(1, Duration::from_secs(60)).unwrap());
        let app = router(bucket, Arc::new(EchoPath), &ServerConfig::default());

        let response = app.oneshot(get("/request")).await.unwrap();

        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_unknown_path_consumes_a_slot() {
        let bucket = Arc::new(LeakyBucket::new(1, Duration::from_secs(60)).unwrap());
        let app = router(bucket.clone(), Arc::new(EchoPath), &ServerConfig::default());

        let missing = app.clone().oneshot(get("/elsewhere")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(bucket.occupancy(), 1);

        let limited = app.oneshot(get("/request")).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_500() {
        let bucket = Arc::new(LeakyBucket::new(1, Duration::from_secs(60)).unwrap());
        let app = router(bucket, Arc::new(Broken), &ServerConfig::default());

        let response = app.oneshot(get("/request")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(body_text(response).await, "Internal Server Error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_upstream_times_out_with_408() {
        let bucket = Arc::new(LeakyBucket::new(1, Duration::from_secs(60)).unwrap());
        let config = ServerConfig {
            write_timeout_secs: 2,
            ..ServerConfig::default()
        };
        let app = router(bucket, Arc::new(Stalled), &config);

        let response = app.oneshot(get("/request")).await.unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_custom_route() {
        let bucket = Arc::new(LeakyBucket::new(1, Duration::from_secs(60)).unwrap());
        let config = ServerConfig {
            route: "/api/fetch".to_string(),
            ..ServerConfig::default()
        };
        let app = router(bucket, Arc::new(EchoPath), &config);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/fetch")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "/api/fetch");
    }

    #[tokio::test]
    async fn test_server_serves_and_shuts_down() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let bucket = Arc::new(LeakyBucket::new(1, Duration::from_secs(60)).unwrap());
        let app = router(bucket, Arc::new(EchoPath), &ServerConfig::default());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(HttpServer::new(addr, app).serve_with_shutdown(async {
            let _ = rx.await;
        }));

        // Give the listener a moment to bind.
        let mut response = None;
        for _ in 0..50 {
            match reqwest::get(format!("http://{}/request", addr)).await {
                Ok(r) => {
                    response = Some(r);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        let response = response.expect("server did not start");
        assert_eq!(response.status(), StatusCode::OK);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_io_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let bucket = Arc::new(LeakyBucket::new(1, Duration::from_secs(60)).unwrap());
        let app = router(bucket, Arc::new(EchoPath), &ServerConfig::default());
        let result = HttpServer::new(addr, app).serve().await;

        assert!(matches!(result, Err(SluiceError::Io(_))));
        drop(listener);
    }
}
