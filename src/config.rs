//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Environment variable naming the auth backend base URL
pub const WWWHISPER_URL_VAR: &str = "WWWHISPER_URL";

/// Environment variable that turns the gateway into a no-op
pub const WWWHISPER_DISABLE_VAR: &str = "WWWHISPER_DISABLE";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before `WWWHISPER_*` variables are read.
    /// Paths support ~ expansion. Loaded in order, earlier files win.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Auth backend configuration
    pub wwwhisper: WwwhisperConfig,
    /// Wrapped application configuration
    pub app: AppConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum request body size forwarded to a backend (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Auth backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WwwhisperConfig {
    /// Base URL of the auth backend
    pub url: Option<String>,
    /// Bypass authorization and rewriting entirely
    pub disable: bool,
    /// Timeout for calls to the backend, in seconds
    pub timeout_secs: u64,
}

impl Default for WwwhisperConfig {
    fn default() -> Self {
        Self {
            url: None,
            disable: false,
            timeout_secs: 10,
        }
    }
}

impl WwwhisperConfig {
    /// Backend call timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Wrapped application configuration (binary only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base URL of the upstream application server
    pub url: Option<String>,
    /// Timeout for calls to the application, in seconds
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 60,
        }
    }
}

impl AppConfig {
    /// Application call timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Parse the upstream application URL
    pub fn upstream_url(&self) -> Result<Url> {
        let raw = self.url.as_deref().ok_or_else(|| {
            Error::Config("No upstream application URL configured (app.url / --app-url)".to_string())
        })?;
        parse_base_url(raw, "app.url")
    }
}

/// How the gateway treats requests, resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayMode {
    /// Every request is checked against the auth backend at `backend_url`
    Enforcing {
        /// Auth backend base URL
        backend_url: Url,
    },
    /// Requests go straight to the application
    Disabled,
}

impl GatewayMode {
    /// Resolve the mode; exactly one of URL and disable flag must be set
    pub fn resolve(config: &WwwhisperConfig) -> Result<Self> {
        let url = config.url.as_deref().map(str::trim).filter(|u| !u.is_empty());
        match (url, config.disable) {
            (Some(_), true) => Err(Error::Config(format!(
                "Both {WWWHISPER_URL_VAR} and {WWWHISPER_DISABLE_VAR} are set, choose one"
            ))),
            (Some(url), false) => Ok(Self::Enforcing {
                backend_url: parse_base_url(url, WWWHISPER_URL_VAR)?,
            }),
            (None, true) => Ok(Self::Disabled),
            (None, false) => Err(Error::Config(format!(
                "Neither {WWWHISPER_URL_VAR} nor {WWWHISPER_DISABLE_VAR} is set"
            ))),
        }
    }

    /// Whether requests are enforced
    #[must_use]
    pub fn is_enforcing(&self) -> bool {
        matches!(self, Self::Enforcing { .. })
    }
}

fn parse_base_url(raw: &str, name: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::Config(format!("Invalid {name} '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!(
            "Invalid {name} '{raw}': scheme must be http or https"
        )));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(Error::Config(format!(
            "Invalid {name} '{raw}': query and fragment are not allowed"
        )));
    }
    Ok(url)
}

/// Interpret a disable flag value; empty, `0` and `false` mean "not set"
#[must_use]
pub fn flag_is_set(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (WWWHISPER_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("WWWHISPER_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.apply_env(|name| env::var(name).ok());

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Apply `WWWHISPER_URL` / `WWWHISPER_DISABLE` on top of file settings
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(WWWHISPER_URL_VAR).filter(|u| !u.trim().is_empty()) {
            self.wwwhisper.url = Some(url);
        }
        if let Some(flag) = lookup(WWWHISPER_DISABLE_VAR) {
            self.wwwhisper.disable = flag_is_set(&flag);
        }
    }

    /// Resolve the gateway mode
    pub fn mode(&self) -> Result<GatewayMode> {
        GatewayMode::resolve(&self.wwwhisper)
    }
}
