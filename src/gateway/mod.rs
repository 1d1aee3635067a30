//! Authorization gateway

pub mod cookies;
pub mod decision;
mod forward;
pub mod passthrough;
pub mod pipeline;
pub mod rewrite;
mod router;
mod server;
pub mod upstream;

pub use cookies::filter_auth_cookies;
pub use decision::{AuthDecisionClient, AuthVerdict, BackendReply};
pub use passthrough::PassthroughProxy;
pub use pipeline::{Gateway, RemoteUser, gateway_middleware};
pub use rewrite::{ResponseRewriter, ResponseSink};
pub use router::create_router;
pub use server::Server;
pub use upstream::UpstreamApp;
