//! Direct proxying of the auth backend's reserved namespace

use std::time::Duration;

use axum::{body::Body, http::Request, response::Response};
use reqwest::Client;
use tracing::debug;
use url::Url;

use super::forward::forward;
use crate::{Error, Result};

/// Path prefix owned and served by the auth backend
pub const RESERVED_PREFIX: &str = "/wwwhisper/";

/// Whether `path` belongs to the auth backend's namespace
#[must_use]
pub fn is_reserved_path(path: &str) -> bool {
    path.starts_with(RESERVED_PREFIX)
}

/// Forwards reserved-namespace requests to the auth backend verbatim.
///
/// No authorization decision is made here: login pages must be reachable by
/// anonymous clients and the backend guards the rest of its namespace itself.
#[derive(Debug, Clone)]
pub struct PassthroughProxy {
    client: Client,
    backend_url: Url,
    max_body_size: usize,
}

impl PassthroughProxy {
    /// Create a proxy for the backend at `backend_url`
    pub fn new(backend_url: Url, timeout: Duration, max_body_size: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            // Login flows answer with redirects meant for the browser.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build passthrough client: {e}")))?;
        Ok(Self::with_client(client, backend_url, max_body_size))
    }

    /// Create a proxy reusing an existing connection pool
    #[must_use]
    pub fn with_client(client: Client, backend_url: Url, max_body_size: usize) -> Self {
        Self {
            client,
            backend_url,
            max_body_size,
        }
    }

    /// Forward `request` and relay the backend's response unmodified
    pub async fn proxy(&self, request: Request<Body>) -> Result<Response> {
        debug!(method = %request.method(), path = %request.uri().path(), "Passing through to auth backend");
        forward(
            &self.client,
            &self.backend_url,
            request,
            self.max_body_size,
            Error::from_backend,
        )
        .await
    }
}
