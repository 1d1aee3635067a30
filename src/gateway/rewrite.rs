//! HTML response rewriting
//!
//! Application responses for granted requests are buffered in full, then an
//! HTML body gets a script reference into the reserved namespace inserted
//! before `</body>`. The client sees exactly one flush per response.
//!
//! ```text
//!   Idle ──start──▶ Buffering ──write*──▶ Buffering ──end──▶ Flushed
//! ```

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Snippet injected into HTML responses
pub const INJECTED_SNIPPET: &str =
    r#"<script type="text/javascript" src="/wwwhisper/auth/iframe.js"></script>"#;

/// Anchor the snippet is inserted in front of
const BODY_CLOSE: &[u8] = b"</body>";

/// Buffered state of one in-flight response
#[derive(Debug)]
struct ResponseAccumulator {
    status: StatusCode,
    headers: HeaderMap,
    chunks: Vec<Bytes>,
}

impl ResponseAccumulator {
    fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            chunks: Vec::new(),
        }
    }

    fn assemble(&mut self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks.pop().unwrap_or_default(),
            _ => {
                let total = self.chunks.iter().map(Bytes::len).sum();
                let mut body = BytesMut::with_capacity(total);
                for chunk in self.chunks.drain(..) {
                    body.extend_from_slice(&chunk);
                }
                body.freeze()
            }
        }
    }
}

#[derive(Debug)]
enum RewriteState {
    Idle,
    Buffering(ResponseAccumulator),
    Flushed,
}

/// Buffers a response and injects [`INJECTED_SNIPPET`] into HTML bodies.
///
/// Mirrors the write/end interface of a response so the producer does not
/// know it is being intercepted.
#[derive(Debug)]
pub struct ResponseRewriter {
    snippet: &'static str,
    state: RewriteState,
}

impl Default for ResponseRewriter {
    fn default() -> Self {
        Self::new(INJECTED_SNIPPET)
    }
}

impl ResponseRewriter {
    /// Create a rewriter injecting `snippet`
    #[must_use]
    pub fn new(snippet: &'static str) -> Self {
        Self {
            snippet,
            state: RewriteState::Idle,
        }
    }

    /// Capture status and headers; nothing is forwarded yet
    pub fn start(&mut self, status: StatusCode, headers: HeaderMap) -> Result<()> {
        match self.state {
            RewriteState::Idle => {
                self.state = RewriteState::Buffering(ResponseAccumulator::new(status, headers));
                Ok(())
            }
            _ => Err(Error::Rewrite("response already started".to_string())),
        }
    }

    /// Append a body chunk
    pub fn write(&mut self, chunk: Bytes) -> Result<()> {
        match &mut self.state {
            RewriteState::Buffering(acc) => {
                if !chunk.is_empty() {
                    acc.chunks.push(chunk);
                }
                Ok(())
            }
            RewriteState::Idle => Err(Error::Rewrite("write before start".to_string())),
            RewriteState::Flushed => Err(Error::Rewrite("write after end".to_string())),
        }
    }

    /// Finish buffering and produce the single response flushed to the client
    pub fn end(&mut self) -> Result<Response> {
        let RewriteState::Buffering(mut acc) =
            std::mem::replace(&mut self.state, RewriteState::Flushed)
        else {
            return Err(Error::Rewrite("end without start".to_string()));
        };

        let original = acc.assemble();
        let body = if is_html(&acc.headers) && carries_body(acc.status) {
            match inject(&acc.headers, &original, self.snippet) {
                Ok(rewritten) => {
                    acc.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
                    rewritten
                }
                Err(reason) => {
                    warn!(reason = %reason, "HTML rewrite skipped, forwarding original body");
                    original
                }
            }
        } else {
            original
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = acc.status;
        *response.headers_mut() = acc.headers;
        Ok(response)
    }
}

/// Whether the `Content-Type` header announces an HTML document
#[must_use]
pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
}

/// 1xx, 204 and 304 responses never have a body to inject into
fn carries_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Insert `snippet` before the last `</body>`, or at the end when there is none.
///
/// Fails when the body is content-encoded, since the anchor cannot be located
/// in compressed bytes.
fn inject(headers: &HeaderMap, body: &[u8], snippet: &str) -> std::result::Result<Bytes, String> {
    if let Some(encoding) = headers.get(header::CONTENT_ENCODING) {
        let encoding = encoding.to_str().unwrap_or("").trim();
        if !encoding.is_empty() && !encoding.eq_ignore_ascii_case("identity") {
            return Err(format!("body is {encoding}-encoded"));
        }
    }

    let at = find_last_ignore_case(body, BODY_CLOSE).unwrap_or(body.len());
    let mut out = BytesMut::with_capacity(body.len() + snippet.len());
    out.extend_from_slice(&body[..at]);
    out.extend_from_slice(snippet.as_bytes());
    out.extend_from_slice(&body[at..]);
    Ok(out.freeze())
}

fn find_last_ignore_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

/// Destination of an application response.
///
/// Selected once per request: granted requests go through the
/// [`RewritingSink`], everything the gateway does not enforce goes through
/// the [`PassthroughSink`].
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Relay `response` towards the client
    async fn relay(&self, response: Response) -> Result<Response>;
}

/// Relays responses untouched, streaming included
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughSink;

#[async_trait]
impl ResponseSink for PassthroughSink {
    async fn relay(&self, response: Response) -> Result<Response> {
        Ok(response)
    }
}

/// Drives a [`ResponseRewriter`] from the response body stream
#[derive(Debug, Clone, Copy)]
pub struct RewritingSink {
    snippet: &'static str,
}

impl Default for RewritingSink {
    fn default() -> Self {
        Self {
            snippet: INJECTED_SNIPPET,
        }
    }
}

#[async_trait]
impl ResponseSink for RewritingSink {
    async fn relay(&self, response: Response) -> Result<Response> {
        let (parts, body) = response.into_parts();
        let mut rewriter = ResponseRewriter::new(self.snippet);
        rewriter.start(parts.status, parts.headers)?;

        let mut stream = body.into_data_stream();
        let mut chunks = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Application(format!("Broken response body: {e}")))?;
            chunks += 1;
            rewriter.write(chunk)?;
        }

        debug!(chunks, "Application response buffered");
        let mut response = rewriter.end()?;
        // Extensions (e.g. set by inner layers) survive the rewrite.
        *response.extensions_mut() = parts.extensions;
        Ok(response)
    }
}
