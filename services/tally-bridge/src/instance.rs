//! Per-device identity and activator state.
//!
//! Each monitored vMix instance is identified by an immutable [`Endpoint`] and
//! carries an [`InstanceState`] that only its own connection loop writes.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use vtally_proto::{Activator, ActivatorUpdate};

/// Port of the vMix TCP API, used when an endpoint omits one.
pub const DEFAULT_DEVICE_PORT: u16 = 8099;

/// Network address of a single device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error returned when an endpoint string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid endpoint {input:?}: {reason}")]
pub struct InvalidEndpoint {
    pub input: String,
    pub reason: &'static str,
}

impl FromStr for Endpoint {
    type Err = InvalidEndpoint;

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let invalid = |reason| InvalidEndpoint {
            input: input.to_string(),
            reason,
        };

        let (host, port) = split_host_port(input).map_err(invalid)?;

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let port = match port {
            None => DEFAULT_DEVICE_PORT,
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid("port must be between 1 and 65535"))?,
        };

        Ok(Endpoint::new(host, port))
    }
}

/// Split `host`, `host:port`, `[v6]` or `[v6]:port` into host and raw port.
///
/// Unbracketed IPv6 literals are rejected since their last group would be
/// mistaken for a port.
pub(crate) fn split_host_port(input: &str) -> Result<(&str, Option<&str>), &'static str> {
    if let Some(rest) = input.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or("unterminated IPv6 literal")?;
        if after.is_empty() {
            return Ok((host, None));
        }
        let port = after
            .strip_prefix(':')
            .ok_or("expected ':' after IPv6 literal")?;
        return Ok((host, Some(port)));
    }

    match input.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Err("IPv6 literals must be bracketed"),
        Some((host, port)) => Ok((host, Some(port))),
        None => Ok((input, None)),
    }
}

/// The four activator flags of one device.
///
/// Starts all-false and is reset to all-false at the start of every
/// connection attempt, so a dropped device never contributes stale activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceState {
    pub recording: bool,
    pub streaming: bool,
    pub external: bool,
    pub multi_corder: bool,
}

impl InstanceState {
    /// True when any activator is set.
    pub fn is_active(&self) -> bool {
        self.recording || self.streaming || self.external || self.multi_corder
    }

    pub fn get(&self, activator: Activator) -> bool {
        match activator {
            Activator::Recording => self.recording,
            Activator::Streaming => self.streaming,
            Activator::External => self.external,
            Activator::MultiCorder => self.multi_corder,
        }
    }

    pub fn set(&mut self, activator: Activator, value: bool) {
        let flag = match activator {
            Activator::Recording => &mut self.recording,
            Activator::Streaming => &mut self.streaming,
            Activator::External => &mut self.external,
            Activator::MultiCorder => &mut self.multi_corder,
        };
        *flag = value;
    }

    /// Apply a decoded notification.
    ///
    /// Returns `true` when the update flipped [`is_active`](Self::is_active).
    pub fn apply(&mut self, update: ActivatorUpdate) -> bool {
        let was_active = self.is_active();
        self.set(update.activator, update.active);
        was_active != self.is_active()
    }

    /// Clear every flag.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
