//! Declared shard topology: instance identities and connection tuning.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Authentication secret for an instance. Redacted from all log output.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Password(String);

impl Password {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("[REDACTED]")
        }
    }
}

/// Declared identity of one shard member.
///
/// Reconciliation identifies an instance by its endpoint (host, port,
/// password); `read_only` is an attribute, not identity, so a role change
/// mutates the live entry in place instead of recycling the connection.
/// Equality still includes the role flag, which is what lets
/// [`crate::SentinelShard::set_connection_infos`] detect a role-only change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub password: Password,
    pub read_only: bool,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: Password::default(),
            read_only: false,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_password(mut self, password: Password) -> Self {
        self.password = password;
        self
    }

    /// The `host:port` form used as the statistics key.
    pub fn fulltext(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Endpoint identity, ignoring the role flag.
    pub(crate) fn same_endpoint(&self, other: &ConnectionInfo) -> bool {
        self.host == other.host && self.port == other.port && self.password == other.password
    }
}

impl PartialOrd for ConnectionInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConnectionInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.host, self.port, &self.password, self.read_only).cmp(&(
            &other.host,
            other.port,
            &other.password,
            other.read_only,
        ))
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ConnectionInfo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Command batching knobs, propagated to every live and pending handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandsBufferingSettings {
    pub buffering_enabled: bool,
    /// Flush once this many commands are queued. Zero flushes on the timer
    /// alone.
    pub commands_buffering_threshold: usize,
    pub watch_command_timer_interval: Duration,
}

impl Default for CommandsBufferingSettings {
    fn default() -> Self {
        Self {
            buffering_enabled: false,
            commands_buffering_threshold: 0,
            watch_command_timer_interval: Duration::ZERO,
        }
    }
}
