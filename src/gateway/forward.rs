//! Verbatim HTTP forwarding
//!
//! Shared by the reserved-namespace passthrough and the upstream application
//! proxy. Requests are buffered (bounded by `max_body_size`) and sent once;
//! responses are streamed back without touching the body.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, Request, header},
    response::Response,
};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// Headers that describe a single connection and must not be relayed
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether a header is connection-scoped
pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy end-to-end headers, dropping hop-by-hop ones
pub(crate) fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Append a request's path and query to a base URL.
///
/// Any path component on the base is kept as a mount point.
pub(crate) fn target_url(base: &Url, path_and_query: &str) -> Result<Url> {
    let joined = format!("{}{}", base.as_str().trim_end_matches('/'), path_and_query);
    Url::parse(&joined).map_err(|e| Error::Internal(format!("Invalid target URL {joined}: {e}")))
}

/// Forward `request` to `base` + its path and query.
///
/// `on_error` classifies transport failures so the caller decides whether a
/// failure means an unreachable auth backend or an unreachable application.
pub(crate) async fn forward(
    client: &Client,
    base: &Url,
    request: Request<Body>,
    max_body_size: usize,
    on_error: fn(&reqwest::Error) -> Error,
) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let url = target_url(base, path_and_query)?;

    let body = axum::body::to_bytes(body, max_body_size)
        .await
        .map_err(|e| Error::RequestBody(e.to_string()))?;

    let mut headers = end_to_end_headers(&parts.headers);
    // reqwest derives Host and Content-Length from the target and body.
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    debug!(method = %parts.method, url = %url, "Forwarding request");

    let upstream = client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| on_error(&e))?;

    let status = upstream.status();
    let headers = end_to_end_headers(upstream.headers());

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
