//! Router assembly

use axum::{Router, middleware};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::pipeline::{Gateway, gateway_middleware};

/// Wrap `app` so that every request passes through `gateway` first
pub fn create_router(gateway: Gateway, app: Router) -> Router {
    app.layer(middleware::from_fn_with_state(gateway, gateway_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}
