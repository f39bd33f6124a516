//! Configuration model: a JSON file merged with defaults.
//!
//! Missing keys take their defaults through serde, unknown keys are
//! ignored, and a missing file is created with the default document so
//! operators have something to edit.

use std::net::IpAddr;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub log: LogConfig,
    pub command: CommandConfig,
    pub web: WebConfig,
    pub scripts: ScriptsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Inbound datagram listener port.
    pub port: u16,
    /// Preferred upstream HTTPS host.
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 16999,
            address: "www.growtopia1.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Advisory only; never injected into wire payloads.
    pub game_version: String,
    /// Advisory only; never injected into wire payloads.
    pub protocol: u16,
    /// `cloudflare|google|quad9|system` or a comma-separated resolver list.
    pub dns_server: String,
    /// Local port for the outbound datagram socket; 0 means ephemeral.
    pub local_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            game_version: "4.61".to_string(),
            protocol: 192,
            dns_server: "cloudflare".to_string(),
            local_port: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    pub level: String,
    pub print_message: bool,
    pub print_game_update_packet: bool,
    pub print_variant: bool,
    pub print_extra: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            print_message: true,
            print_game_update_packet: false,
            print_variant: false,
            print_extra: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandConfig {
    pub prefix: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            prefix: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebConfig {
    pub port: u16,
    pub cert_path: String,
    pub key_path: String,
    pub ignore_maintenance: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 443,
            cert_path: "./data/cert.pem".to_string(),
            key_path: "./data/key.pem".to_string(),
            ignore_maintenance: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptsConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "./scripts".to_string(),
        }
    }
}

/// Resolver selection parsed from `client.dnsServer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsServer {
    Cloudflare,
    Google,
    Quad9,
    System,
    Custom(Vec<IpAddr>),
}

impl Config {
    /// Reads the config file, creating it with defaults when absent.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if !path.is_file() {
            let config = Self::default();
            let text = serde_json::to_string_pretty(&config)
                .context("serialize default config")?;
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create config dir {}", parent.display()))?;
                }
            }
            std::fs::write(path, text)
                .with_context(|| format!("write default config to {}", path.display()))?;
            tracing::info!("config.created path={}", path.display());
            return Ok(config);
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config at {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parse config at {}", path.display()))
    }

    /// The command prefix; values that are not exactly one character
    /// revert to `/`.
    pub fn command_prefix(&self) -> char {
        let mut chars = self.command.prefix.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => c,
            _ => {
                tracing::warn!(
                    "config.invalid_prefix value={:?} fallback=/",
                    self.command.prefix
                );
                '/'
            }
        }
    }

    /// Log level, defaulting to `info` for unknown values.
    pub fn log_level(&self) -> tracing::Level {
        match self.log.level.to_ascii_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "info" => tracing::Level::INFO,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            other => {
                tracing::warn!("config.unknown_log_level value={other} fallback=info");
                tracing::Level::INFO
            }
        }
    }

    pub fn dns_server(&self) -> DnsServer {
        match self.client.dns_server.trim().to_ascii_lowercase().as_str() {
            "cloudflare" | "" => DnsServer::Cloudflare,
            "google" => DnsServer::Google,
            "quad9" => DnsServer::Quad9,
            "system" => DnsServer::System,
            custom => {
                let addrs: Vec<IpAddr> = custom
                    .split(',')
                    .filter_map(|part| part.trim().parse().ok())
                    .collect();
                if addrs.is_empty() {
                    tracing::warn!(
                        "config.unparseable_dns_server value={:?} fallback=system",
                        self.client.dns_server
                    );
                    DnsServer::System
                } else {
                    DnsServer::Custom(addrs)
                }
            }
        }
    }
}
