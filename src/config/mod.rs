//! Daemon configuration, loaded leniently from `config/global.toml`.
//!
//! Missing files or unparsable content fall back to built-in defaults so the
//! daemon always comes up; the host collaborator supplies real service specs
//! at runtime or through this file.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "PRISM_CONFIG_PATH";

/// Environment variable the host collaborator sets to route client traffic
/// through the interception proxy. The daemon only checks it — absence is a
/// warning condition, not an error.
pub const PROXY_URL_ENV: &str = "PRISM_PROXY_URL";

#[derive(Deserialize, Debug, Clone, Default)]
pub struct GlobalConfig {
    /// Exchange log directory. Defaults to `~/.prism/logs`.
    pub log_dir: Option<String>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub supervisor: SupervisorTimings,
    /// Externally-specified services to keep alive (the host's engine, etc).
    #[serde(default)]
    pub service: Vec<ServiceConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProxyConfig {
    /// Upstream chat-completion provider base URL.
    pub upstream_url: String,
    /// Port range the proxy service is allocated from.
    pub port_range: (u16, u16),
    /// Outbound request timeout in seconds (streaming bodies are exempt).
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_url: "https://api.openai.com".to_string(),
            port_range: (4310, 4410),
            request_timeout_secs: 120,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct SupervisorTimings {
    pub settle_delay_ms: u64,
    pub start_timeout_secs: u64,
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    pub max_restart_attempts: u32,
    pub restart_backoff_ms: u64,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 800,
            start_timeout_secs: 10,
            health_interval_secs: 30,
            health_timeout_secs: 5,
            max_restart_attempts: 5,
            restart_backoff_ms: 500,
        }
    }
}

/// One externally-specified executable to supervise.
#[derive(Deserialize, Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_service_port_range")]
    pub port_range: (u16, u16),
}

fn default_working_dir() -> String {
    ".".to_string()
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_service_port_range() -> (u16, u16) {
    (4210, 4310)
}

impl GlobalConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .unwrap_or_else(|_| "config/global.toml".to_string());
        let s = std::fs::read_to_string(&path).unwrap_or_default();
        let cfg: Self = toml::from_str(&s).unwrap_or_default();
        Ok(cfg)
    }

    /// Resolved exchange log directory.
    pub fn log_dir(&self) -> PathBuf {
        match &self.log_dir {
            Some(dir) => PathBuf::from(dir),
            None => crate::proxy::exchange_log::ExchangeLogger::default_dir(),
        }
    }
}

impl SupervisorTimings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}
