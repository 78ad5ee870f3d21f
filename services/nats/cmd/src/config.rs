//! Configuration handling for the NATS client.
//!
//! Values come from the shared YAML config file (`services.nats.config`) and
//! from environment variables. Command line flags are applied on top by the
//! caller.

use anyhow::{Context, Result};
use nats_session::{ConnectOptions, ErrorPolicy, SessionConfig};
use nats_wire::{DecoderConfig, HmsgSize};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct NatsConfig {
    /// Server address, host:port
    pub server: String,
    /// Connection name sent in CONNECT
    pub name: Option<String>,
    /// Interval between client PINGs
    pub ping_interval: Duration,
    /// Unanswered PINGs before the connection is stale
    pub max_pings_outstanding: usize,
    /// Ask the server to acknowledge every operation
    pub verbose: bool,
    /// Receive our own publications
    pub echo: bool,
    /// Non-fatal protocol error handling
    pub on_protocol_error: ErrorPolicy,
    /// Meaning of the last HMSG size argument; nats-server sends the total
    pub hmsg_size: HmsgSize,
    /// Default request timeout
    pub request_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:4222".to_string(),
            name: None,
            ping_interval: Duration::from_secs(120),
            max_pings_outstanding: 2,
            verbose: false,
            echo: true,
            on_protocol_error: ErrorPolicy::Skip,
            hmsg_size: HmsgSize::Total,
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    nats: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

impl NatsConfig {
    /// Load configuration from file and environment variables
    ///
    /// A missing file falls back to defaults. A file that exists but does
    /// not parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {path:?}"))?;
                config.apply_root_config(root)?;
                info!("Loaded configuration from {:?}", path);
            }
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_environment_overrides()?;

        info!(
            "Final NATS configuration: server={}, ping_interval={}, on_protocol_error={:?}",
            config.server,
            humantime::format_duration(config.ping_interval),
            config.on_protocol_error
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) -> Result<()> {
        let values = root
            .services
            .and_then(|s| s.nats)
            .and_then(|n| n.config)
            .unwrap_or_default();

        for (key, value) in values {
            match key.as_str() {
                "services.nats.server" => self.server = value,
                "services.nats.name" => self.name = Some(value),
                "services.nats.ping_interval" => self.ping_interval = parse_duration(&key, &value)?,
                "services.nats.max_pings_outstanding" => {
                    self.max_pings_outstanding = value
                        .parse()
                        .with_context(|| format!("{key}: expected a count, got {value:?}"))?;
                }
                "services.nats.verbose" => self.verbose = parse_bool(&value),
                "services.nats.echo" => self.echo = parse_bool(&value),
                "services.nats.on_protocol_error" => {
                    self.on_protocol_error = value.parse().map_err(anyhow::Error::msg)?;
                }
                "services.nats.hmsg_size" => self.hmsg_size = parse_hmsg_size(&value)?,
                "services.nats.request_timeout" => {
                    self.request_timeout = parse_duration(&key, &value)?;
                }
                _ => warn!("Ignoring unknown configuration key {}", key),
            }
        }
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(server) = lookup("NATS_SERVER") {
            info!("Server overridden by environment: {}", server);
            self.server = server;
        }
        if let Some(name) = lookup("NATS_NAME") {
            info!("Connection name overridden by environment: {}", name);
            self.name = Some(name);
        }
        if let Some(interval) = lookup("NATS_PING_INTERVAL") {
            self.ping_interval = parse_duration("NATS_PING_INTERVAL", &interval)?;
            info!("Ping interval overridden by environment: {}", interval);
        }
        Ok(())
    }

    /// Session configuration for this client
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ping_interval: self.ping_interval,
            max_pings_outstanding: self.max_pings_outstanding,
            error_policy: self.on_protocol_error,
            connect: ConnectOptions {
                name: self.name.clone(),
                verbose: self.verbose,
                echo: self.echo,
                ..ConnectOptions::default()
            },
            decoder: DecoderConfig {
                hmsg_size: self.hmsg_size,
                ..DecoderConfig::default()
            },
            ..SessionConfig::default()
        }
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .with_context(|| format!("{key}: expected a duration like 30s, got {value:?}"))
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

fn parse_hmsg_size(value: &str) -> Result<HmsgSize> {
    match value.to_ascii_lowercase().as_str() {
        "payload" => Ok(HmsgSize::Payload),
        "total" => Ok(HmsgSize::Total),
        other => anyhow::bail!("hmsg_size: expected payload or total, got {other:?}"),
    }
}
