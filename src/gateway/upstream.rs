//! Reverse proxy to the wrapped application server
//!
//! Used by the standalone binary: the "application" behind the gateway is a
//! separate HTTP server reached at `app.url`. The granted identity travels in
//! the `User` request header; a `User` header sent by the client never does.

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderValue, Request},
    response::{IntoResponse, Response},
};
use reqwest::Client;
use url::Url;

use super::decision::USER_HEADER;
use super::forward::forward;
use super::pipeline::RemoteUser;
use crate::{Error, Result};

/// Forwards every request to the upstream application
#[derive(Debug, Clone)]
pub struct UpstreamApp {
    client: Client,
    base_url: Url,
    max_body_size: usize,
}

impl UpstreamApp {
    /// Create a proxy for the application at `base_url`
    pub fn new(base_url: Url, timeout: Duration, max_body_size: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build upstream client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            max_body_size,
        })
    }

    /// Forward one request to the application
    pub async fn call(&self, request: Request<Body>) -> Response {
        self.try_call(request)
            .await
            .unwrap_or_else(IntoResponse::into_response)
    }

    async fn try_call(&self, mut request: Request<Body>) -> Result<Response> {
        attach_identity(&mut request)?;
        forward(
            &self.client,
            &self.base_url,
            request,
            self.max_body_size,
            |e| Error::Application(e.to_string()),
        )
        .await
    }

    /// Router sending every path and method to the application
    pub fn into_router(self) -> Router {
        Router::new().fallback(upstream_handler).with_state(self)
    }
}

/// Replace any client-sent `User` header with the granted [`RemoteUser`]
fn attach_identity(request: &mut Request<Body>) -> Result<()> {
    let identity = request
        .extensions()
        .get::<RemoteUser>()
        .map(|user| HeaderValue::from_str(user.as_str()))
        .transpose()
        .map_err(|e| Error::Internal(format!("Invalid identity header: {e}")))?;

    let headers = request.headers_mut();
    headers.remove(USER_HEADER);
    if let Some(identity) = identity {
        headers.insert(USER_HEADER, identity);
    }
    Ok(())
}

async fn upstream_handler(State(app): State<UpstreamApp>, request: Request<Body>) -> Response {
    app.call(request).await
}
