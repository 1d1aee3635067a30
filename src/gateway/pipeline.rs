//! Per-request enforcement pipeline
//!
//! Order per request:
//! 1. Disabled gateway: straight to the application.
//! 2. Reserved namespace: proxied to the auth backend, no decision query.
//! 3. Otherwise one authorization query, then either the backend's 401/403
//!    reply or the application's response through the HTML rewriter
//!    (HEAD responses are relayed untouched).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, info};

use super::decision::{AuthDecisionClient, AuthVerdict, USER_HEADER};
use super::passthrough::{PassthroughProxy, is_reserved_path};
use super::rewrite::{PassthroughSink, ResponseSink, RewritingSink};
use crate::Result;
use crate::config::{Config, GatewayMode};

/// Identity of the principal a request was granted for.
///
/// Present in the request extensions only when the auth backend named a
/// user; open locations leave it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser(pub String);

impl RemoteUser {
    /// The identity string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug)]
enum Enforcer {
    Disabled,
    Enforcing {
        decision: AuthDecisionClient,
        passthrough: PassthroughProxy,
    },
}

#[derive(Debug)]
struct Inner {
    enforcer: Enforcer,
    passthrough_sink: PassthroughSink,
    rewriting_sink: RewritingSink,
}

/// Authorization gateway placed in front of an application.
///
/// Cheap to clone; all clones share the same immutable configuration and
/// connection pool.
#[derive(Debug, Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Create a gateway for a resolved mode
    pub fn new(mode: GatewayMode, timeout: Duration, max_body_size: usize) -> Result<Self> {
        let enforcer = match mode {
            GatewayMode::Disabled => Enforcer::Disabled,
            GatewayMode::Enforcing { backend_url } => {
                let passthrough =
                    PassthroughProxy::new(backend_url.clone(), timeout, max_body_size)?;
                let decision = AuthDecisionClient::new(backend_url, timeout, max_body_size)?;
                Enforcer::Enforcing {
                    decision,
                    passthrough,
                }
            }
        };

        Ok(Self {
            inner: Arc::new(Inner {
                enforcer,
                passthrough_sink: PassthroughSink,
                rewriting_sink: RewritingSink::default(),
            }),
        })
    }

    /// Create a gateway from loaded configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.mode()?,
            config.wwwhisper.timeout(),
            config.server.max_body_size,
        )
    }

    /// Whether requests are checked against the auth backend
    #[must_use]
    pub fn is_enforcing(&self) -> bool {
        matches!(self.inner.enforcer, Enforcer::Enforcing { .. })
    }

    /// Handle one request; `app` is invoked at most once.
    ///
    /// Errors become 5xx responses: an unreachable backend or an unexpected
    /// backend status never lets the request through.
    pub async fn handle<A, Fut>(&self, request: Request<Body>, app: A) -> Response
    where
        A: FnOnce(Request<Body>) -> Fut,
        Fut: Future<Output = Response>,
    {
        match self.try_handle(request, app).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    async fn try_handle<A, Fut>(&self, mut request: Request<Body>, app: A) -> Result<Response>
    where
        A: FnOnce(Request<Body>) -> Fut,
        Fut: Future<Output = Response>,
    {
        let Enforcer::Enforcing {
            decision,
            passthrough,
        } = &self.inner.enforcer
        else {
            return self.inner.passthrough_sink.relay(app(request).await).await;
        };

        if is_reserved_path(request.uri().path()) {
            return passthrough.proxy(request).await;
        }

        let path = request.uri().path().to_string();
        let cookies = joined_cookies(request.headers());
        let verdict = decision.check(&path, cookies.as_deref()).await?;
        let label = verdict.label();

        match verdict {
            AuthVerdict::Granted { identity, reply } => {
                debug!(path = %path, user = identity.as_deref().unwrap_or("-"), "Access granted");
                request.extensions_mut().remove::<RemoteUser>();
                if let Some(ref user) = identity {
                    request.extensions_mut().insert(RemoteUser(user.clone()));
                }

                // HEAD answers keep the GET Content-Length and have no body to inject into.
                let sink: &dyn ResponseSink = if request.method() == Method::HEAD {
                    &self.inner.passthrough_sink
                } else {
                    &self.inner.rewriting_sink
                };

                let response = app(request).await;
                let mut response = sink.relay(response).await?;

                // Echo the identity to the client, as the backend named it.
                if let Some(user) = identity.and(reply.headers.get(USER_HEADER).cloned()) {
                    response.headers_mut().insert(USER_HEADER, user);
                }
                Ok(response)
            }
            AuthVerdict::LoginRequired(reply) | AuthVerdict::Denied(reply) => {
                info!(path = %path, verdict = label, status = reply.status.as_u16(), "Request blocked");
                Ok(reply.into_response())
            }
        }
    }
}

/// Cookie headers may be split across several fields (HTTP/2); join them
fn joined_cookies(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join("; "))
    }
}

/// Axum middleware running every request through the [`Gateway`].
///
/// The rest of the router (`next`) is the wrapped application.
pub async fn gateway_middleware(
    State(gateway): State<Gateway>,
    request: Request<Body>,
    next: Next,
) -> Response {
    gateway.handle(request, move |req| next.run(req)).await
}
