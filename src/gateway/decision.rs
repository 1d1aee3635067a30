//! Authorization queries against the wwwhisper backend
//!
//! One `GET /wwwhisper/auth/api/is-authorized/?path=...` per request. The
//! backend's status code is the decision; the `User` header on a 200 carries
//! the authenticated identity.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, warn};
use url::{Url, form_urlencoded};

use super::cookies::filter_auth_cookies;
use super::forward::end_to_end_headers;
use crate::{Error, Result};

/// Path of the authorization query endpoint on the backend
pub const IS_AUTHORIZED_PATH: &str = "/wwwhisper/auth/api/is-authorized/";

/// Header carrying the authenticated identity on granted responses
pub const USER_HEADER: &str = "user";

/// Client agent sent with every authorization query
pub const CLIENT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// Raw reply from the auth backend
#[derive(Debug, Clone)]
pub struct BackendReply {
    /// Status code returned by the backend
    pub status: StatusCode,
    /// End-to-end headers returned by the backend
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl IntoResponse for BackendReply {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        // The body was fully read, so the backend's framing no longer applies.
        response.headers_mut().remove(header::CONTENT_LENGTH);
        response
    }
}

/// Outcome of an authorization query
#[derive(Debug, Clone)]
pub enum AuthVerdict {
    /// 200: the request may reach the application
    Granted {
        /// Authenticated principal; `None` for open locations
        identity: Option<String>,
        /// Backend reply
        reply: BackendReply,
    },
    /// 401: the client has to sign in first
    LoginRequired(BackendReply),
    /// 403: the signed-in user has no access to the path
    Denied(BackendReply),
}

impl AuthVerdict {
    /// Interpret a backend reply.
    ///
    /// Any status outside {200, 401, 403} is a protocol error, never a denial.
    pub fn from_reply(reply: BackendReply) -> Result<Self> {
        match reply.status {
            StatusCode::OK => {
                let identity = reply
                    .headers
                    .get(USER_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .filter(|v| !v.is_empty())
                    .map(String::from);
                Ok(Self::Granted { identity, reply })
            }
            StatusCode::UNAUTHORIZED => Ok(Self::LoginRequired(reply)),
            StatusCode::FORBIDDEN => Ok(Self::Denied(reply)),
            other => Err(Error::UnexpectedBackendStatus(other.as_u16())),
        }
    }

    /// Short label used in logs
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Granted { .. } => "granted",
            Self::LoginRequired(_) => "login_required",
            Self::Denied(_) => "denied",
        }
    }
}

/// Issues authorization queries to the auth backend
#[derive(Debug, Clone)]
pub struct AuthDecisionClient {
    client: Client,
    backend_url: Url,
    max_reply_size: usize,
}

impl AuthDecisionClient {
    /// Create a client for the backend at `backend_url`.
    ///
    /// Reply bodies larger than `max_reply_size` are rejected.
    pub fn new(backend_url: Url, timeout: Duration, max_reply_size: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build auth client: {e}")))?;
        Ok(Self::with_client(client, backend_url, max_reply_size))
    }

    /// Create a client reusing an existing connection pool
    #[must_use]
    pub fn with_client(client: Client, backend_url: Url, max_reply_size: usize) -> Self {
        Self {
            client,
            backend_url,
            max_reply_size,
        }
    }

    /// Build the authorization query URL for `path`.
    ///
    /// The path is form-encoded except for `/`, giving `?path=/foo/bar`.
    pub fn query_url(&self, path: &str) -> Result<Url> {
        let mut url = super::forward::target_url(&self.backend_url, IS_AUTHORIZED_PATH)?;
        let encoded = form_urlencoded::byte_serialize(path.as_bytes())
            .collect::<String>()
            .replace("%2F", "/");
        url.set_query(Some(&format!("path={encoded}")));
        Ok(url)
    }

    /// Ask the backend whether a request for `path` carrying `cookies` may proceed.
    ///
    /// Exactly one outbound call, never retried.
    pub async fn check(&self, path: &str, cookies: Option<&str>) -> Result<AuthVerdict> {
        let url = self.query_url(path)?;

        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(CLIENT_AGENT));
        if let Some(raw) = cookies {
            let filtered = filter_auth_cookies(raw);
            if !filtered.is_empty() {
                let value = HeaderValue::from_str(&filtered)
                    .map_err(|e| Error::Internal(format!("Invalid cookie header: {e}")))?;
                headers.insert(header::COOKIE, value);
            }
        }

        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                warn!(path = %path, error = %e, "Authorization query failed");
                Error::from_backend(&e)
            })?;

        let status = response.status();
        let headers = end_to_end_headers(response.headers());
        let body = read_reply_body(response, self.max_reply_size).await?;

        debug!(path = %path, status = status.as_u16(), "Authorization query answered");
        AuthVerdict::from_reply(BackendReply {
            status,
            headers,
            body,
        })
    }
}

/// Drain a reply body, giving up once it grows past `limit` bytes
async fn read_reply_body(response: reqwest::Response, limit: usize) -> Result<Bytes> {
    if response
        .content_length()
        .is_some_and(|len| len > limit as u64)
    {
        return Err(Error::BackendReplyTooLarge(limit));
    }

    let mut body = BytesMut::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::from_backend(&e))?;
        if body.len() + chunk.len() > limit {
            return Err(Error::BackendReplyTooLarge(limit));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}
