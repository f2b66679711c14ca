//! Upstream service the admitted requests are relayed to.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header;
use axum::response::Response;
use tracing::{debug, error, instrument};

use crate::config::{ServerConfig, UpstreamConfig};
use crate::error::Result;

/// Downstream collaborator invoked once per admitted request.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Produce the response for an admitted request.
    async fn forward(&self, request: Request) -> Result<Response>;
}

/// Upstream that fetches a fixed URL over HTTP and relays the reply.
///
/// The inbound path and method are not forwarded; every admitted request
/// results in one `GET` of the configured URL.
pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
}

impl HttpUpstream {
    /// Create a new upstream from configuration.
    ///
    /// The server's idle timeout bounds how long pooled upstream connections
    /// are kept open.
    pub fn new(config: &UpstreamConfig, server: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .pool_idle_timeout(server.idle_timeout())
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    #[instrument(skip(self, request), fields(path = %request.uri().path(), upstream = %self.url))]
    async fn forward(&self, request: Request) -> Result<Response> {
        debug!("Sending request to upstream");
        drop(request);

        let upstream = self.client.get(&self.url).send().await?;
        let status = upstream.status();
        let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();
        let body = upstream.bytes().await?;

        debug!(status = status.as_u16(), bytes = body.len(), "Upstream responded");

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        if let Some(content_type) = content_type {
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type);
        }
        Ok(response)
    }
}

/// Route handler relaying admitted requests to the upstream.
pub async fn relay(
    State(upstream): State<Arc<dyn Upstream>>,
    request: Request,
) -> Result<Response> {
    upstream.forward(request).await.map_err(|e| {
        error!(error = %e, "Upstream request failed");
        e
    })
}
