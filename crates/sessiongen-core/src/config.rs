//! Configuration types for sessiongen

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What happens to a stored credential bundle once pairing completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum RetentionPolicy {
    /// Bundle is sent to the paired account and removed from disk
    OneShot,
    /// Bundle stays on disk until retrieved once by session id
    UntilFetched,
    /// Bundle stays retrievable until it is older than `ttl`
    TimeBoxed { ttl: Duration },
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::TimeBoxed {
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RetentionPolicy {
    /// Parse a policy name, using `ttl` for the time-boxed variant
    pub fn parse(name: &str, ttl: Duration) -> Result<Self, String> {
        match name.to_lowercase().as_str() {
            "one-shot" | "oneshot" => Ok(RetentionPolicy::OneShot),
            "until-fetched" | "fetch" => Ok(RetentionPolicy::UntilFetched),
            "time-boxed" | "ttl" => Ok(RetentionPolicy::TimeBoxed { ttl }),
            _ => Err(format!(
                "Invalid retention policy: {}. Use: one-shot, until-fetched, time-boxed",
                name
            )),
        }
    }

    /// Whether bundles outlive a successful delivery
    pub fn retains_bundle(&self) -> bool {
        !matches!(self, RetentionPolicy::OneShot)
    }
}

impl std::fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionPolicy::OneShot => write!(f, "one-shot"),
            RetentionPolicy::UntilFetched => write!(f, "until-fetched"),
            RetentionPolicy::TimeBoxed { ttl } => write!(f, "time-boxed({}s)", ttl.as_secs()),
        }
    }
}

/// Reconnect policy for transient disconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Reconnects allowed per session before it expires
    pub max_attempts: u32,
    /// Delay before the first reconnect
    pub base_delay: Duration,
    /// Upper bound for the backoff delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before reconnect number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Main configuration for sessiongen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server port
    pub port: u16,
    /// Root directory for credential namespaces (platform data dir if None)
    pub storage_dir: Option<PathBuf>,
    /// Maximum number of pairing sessions in flight
    pub max_sessions: usize,
    /// Wait between opening a connection and requesting a pairing code
    pub pairing_code_delay: Duration,
    /// How long `start` waits for the first code or QR
    pub challenge_timeout: Duration,
    /// Hard upper bound on a pairing session's life
    pub session_lifetime: Duration,
    /// Reconnect policy
    pub retry: RetryPolicy,
    /// Stored bundle retention
    pub retention: RetentionPolicy,
    /// Send the result to the paired account once authenticated
    pub deliver_to_account: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            storage_dir: None,
            max_sessions: 100,
            pairing_code_delay: Duration::from_secs(3),
            challenge_timeout: Duration::from_secs(60),
            session_lifetime: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
            retention: RetentionPolicy::default(),
            deliver_to_account: true,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set storage directory
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Builder pattern: set concurrent session limit
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Builder pattern: set pairing code delay
    pub fn with_pairing_code_delay(mut self, delay: Duration) -> Self {
        self.pairing_code_delay = delay;
        self
    }

    /// Builder pattern: set challenge timeout
    pub fn with_challenge_timeout(mut self, timeout: Duration) -> Self {
        self.challenge_timeout = timeout;
        self
    }

    /// Builder pattern: set session lifetime
    pub fn with_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.session_lifetime = lifetime;
        self
    }

    /// Builder pattern: set retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builder pattern: set retention policy
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Builder pattern: enable or disable delivery to the paired account
    pub fn with_delivery(mut self, deliver: bool) -> Self {
        self.deliver_to_account = deliver;
        self
    }
}
