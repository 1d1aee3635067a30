//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

/// wwwhisper Gateway - authorization in front of an unmodified application
#[derive(Parser, Debug)]
#[command(name = "wwwhisper-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "WWWHISPER_GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "WWWHISPER_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "WWWHISPER_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Base URL of the application behind the gateway
    #[arg(long, env = "WWWHISPER_GATEWAY_APP_URL")]
    pub app_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "WWWHISPER_GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "WWWHISPER_GATEWAY_LOG_FORMAT")]
    pub log_format: Option<String>,
}

impl Cli {
    /// Apply command-line overrides on top of loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(ref host) = self.host {
            config.server.host.clone_from(host);
        }
        if let Some(ref app_url) = self.app_url {
            config.app.url = Some(app_url.clone());
        }
    }
}
