//! wwwhisper Gateway Library
//!
//! HTTP authorization gateway enforcing wwwhisper access decisions in front
//! of an otherwise unmodified application.
//!
//! # Features
//!
//! - **Authorization**: one `is-authorized` query per request, only auth
//!   cookies forwarded
//! - **Passthrough**: the backend's `/wwwhisper/` namespace is proxied verbatim
//! - **HTML rewriting**: granted HTML responses get the wwwhisper script injected
//! - **Drop-in**: works as axum middleware or as a standalone reverse proxy

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
