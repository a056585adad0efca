use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

/// Payment backend connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Base URL, e.g. "https://payments.example.com/api".
    pub url: String,
    /// Tenant sent with every request.
    pub tenant_id: String,
    /// Bearer token, if the backend requires one.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u32,
}

fn default_backend_timeout() -> u32 {
    15
}

/// Which reader SDK drives the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderDriver {
    #[default]
    Simulated,
}

/// Terminal session behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TerminalConfig {
    /// Discover simulated readers instead of live hardware. Fixed per session.
    #[serde(default)]
    pub simulated: bool,
    /// Restrict discovery to one location.
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub driver: ReaderDriver,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long a cancel waits for a preempted collection to unwind.
    #[serde(default = "default_cancel_wait_ms")]
    pub cancel_wait_ms: u64,
    /// Extra attempts for the hardware steps of a collection on transient errors.
    #[serde(default = "default_collect_retries")]
    pub collect_retries: u32,
    /// Capacity of the session event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            simulated: false,
            location_id: None,
            driver: ReaderDriver::default(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            cancel_wait_ms: default_cancel_wait_ms(),
            collect_retries: default_collect_retries(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_discovery_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_cancel_wait_ms() -> u64 {
    5_000
}

fn default_collect_retries() -> u32 {
    1
}

fn default_event_capacity() -> usize {
    64
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub backend: SanitizedBackendConfig,
    pub terminal: TerminalConfig,
}

/// Sanitized backend config (API key hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedBackendConfig {
    pub url: String,
    pub tenant_id: String,
    pub api_key_configured: bool,
    pub timeout_secs: u32,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            backend: SanitizedBackendConfig {
                url: config.backend.url.clone(),
                tenant_id: config.backend.tenant_id.clone(),
                api_key_configured: config
                    .backend
                    .api_key
                    .as_ref()
                    .is_some_and(|k| !k.is_empty()),
                timeout_secs: config.backend.timeout_secs,
            },
            terminal: config.terminal.clone(),
        }
    }
}
