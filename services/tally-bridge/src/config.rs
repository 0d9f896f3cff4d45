//! Configuration for the tally bridge.
//!
//! Everything is read from environment variables. [`Config::from_lookup`]
//! takes any key lookup so tests can supply values without touching the
//! process environment.

use std::time::Duration;

use thiserror::Error;

use crate::bus::{Delivery, MqttSettings, PublishTarget};
use crate::connection::ConnectionSettings;
use crate::instance::{split_host_port, Endpoint};

/// Default MQTT broker port.
pub const DEFAULT_BROKER_PORT: u16 = 1883;

const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {detail}")]
    Invalid { key: &'static str, detail: String },
}

/// Broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parse `[tcp://|mqtt://]host[:port]`.
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |detail: &str| ConfigError::Invalid {
            key: "MQTT_HOST",
            detail: detail.to_string(),
        };

        let trimmed = raw.trim();
        let without_scheme = match trimmed.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme {scheme:?}"))),
            None => trimmed,
        };
        let address = without_scheme.trim_end_matches('/');

        let (host, port) = split_host_port(address).map_err(invalid)?;
        let port = match port {
            None => DEFAULT_BROKER_PORT,
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid("port must be between 1 and 65535"))?,
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Tally bridge configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Devices to supervise.
    pub endpoints: Vec<Endpoint>,

    /// MQTT broker.
    pub broker: BrokerAddress,

    /// Optional broker credentials.
    pub username: Option<String>,
    pub password: Option<String>,

    /// MQTT client identifier.
    pub client_id: String,

    /// Topic and delivery options for the aggregate.
    pub target: PublishTarget,

    /// Device dial timing.
    pub connection: ConnectionSettings,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let endpoints = parse_endpoints(&require("VMIX_HOSTS")?)?;
        let broker = BrokerAddress::parse(&require("MQTT_HOST")?)?;
        let topic = require("MQTT_TOPIC")?.trim().to_string();

        let username = get("MQTT_USERNAME");
        let password = get("MQTT_PASSWORD");
        if password.is_some() && username.is_none() {
            return Err(ConfigError::Missing("MQTT_USERNAME"));
        }

        let client_id = get("MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("tally-bridge-{}", std::process::id()));

        let delivery = match get("MQTT_QOS") {
            None => Delivery::default(),
            Some(raw) => raw
                .trim()
                .parse::<u8>()
                .ok()
                .and_then(Delivery::from_level)
                .ok_or_else(|| ConfigError::Invalid {
                    key: "MQTT_QOS",
                    detail: format!("expected 0, 1 or 2, got {raw:?}"),
                })?,
        };

        let retain = get("MQTT_RETAIN")
            .map(|raw| parse_flag(&raw, "MQTT_RETAIN"))
            .transpose()?
            .unwrap_or(false);

        let connect_timeout = parse_millis(&get, "TALLY_CONNECT_TIMEOUT_MS")?
            .unwrap_or(crate::connection::DEFAULT_CONNECT_TIMEOUT);
        let retry_delay = parse_millis(&get, "TALLY_RETRY_DELAY_MS")?
            .unwrap_or(crate::connection::DEFAULT_RETRY_DELAY);

        let log_level = get("TALLY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            endpoints,
            broker,
            username,
            password,
            client_id,
            target: PublishTarget {
                topic,
                delivery,
                retain,
            },
            connection: ConnectionSettings {
                connect_timeout,
                retry_delay,
            },
            log_level,
        })
    }

    /// Settings for the MQTT client.
    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.broker.host.clone(),
            port: self.broker.port,
            client_id: self.client_id.clone(),
            credentials: self
                .username
                .clone()
                .map(|user| (user, self.password.clone().unwrap_or_default())),
            keep_alive: MQTT_KEEP_ALIVE,
        }
    }
}

/// Parse a comma-separated endpoint list, skipping empty entries.
fn parse_endpoints(raw: &str) -> Result<Vec<Endpoint>, ConfigError> {
    let endpoints = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry.parse::<Endpoint>().map_err(|e| ConfigError::Invalid {
                key: "VMIX_HOSTS",
                detail: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if endpoints.is_empty() {
        return Err(ConfigError::Missing("VMIX_HOSTS"));
    }
    Ok(endpoints)
}

fn parse_flag(raw: &str, key: &'static str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            detail: format!("expected true/false or 1/0, got {raw:?}"),
        }),
    }
}

fn parse_millis<G>(get: &G, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::Invalid {
                    key,
                    detail: format!("expected milliseconds, got {raw:?}"),
                })
        })
        .transpose()
}
