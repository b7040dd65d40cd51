//! Runtime configuration for session clients.

use rand::thread_rng;
use rand::Rng;

use crate::error::ConfigError;
use crate::message::Consistency;

/// Default session timeout requested from the cluster, in milliseconds.
pub const DEFAULT_SESSION_TIMEOUT: u64 = 5_000;

/// Default minimum backoff before retrying a failed dispatch, in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MIN: u64 = 50;

/// Default maximum backoff before retrying a failed dispatch, in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MAX: u64 = 500;

/// The runtime configuration for a client session.
///
/// Build instances with [`Config::build`], which returns a [`ConfigBuilder`];
/// `validate()` checks the invariants between the fields and yields the final
/// config. The config is passed around as an `Arc<Config>`.
#[derive(Clone, Debug)]
pub struct Config {
    /// The application specific name of the cluster being joined.
    pub cluster_name: String,
    /// The session timeout requested on open, in milliseconds. The cluster
    /// may clamp this; the effective value is returned in the open response.
    pub session_timeout: u64,
    /// The interval between keep-alive beacons, in milliseconds.
    pub heartbeat_interval: u64,
    /// Minimum backoff before a failed dispatch is retried, in milliseconds.
    pub retry_backoff_min: u64,
    /// Maximum backoff before a failed dispatch is retried, in milliseconds.
    pub retry_backoff_max: u64,
    /// The consistency level stamped on queries submitted without an
    /// explicit level.
    pub default_consistency: Consistency,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            session_timeout: None,
            heartbeat_interval: None,
            retry_backoff_min: None,
            retry_backoff_max: None,
            default_consistency: None,
        }
    }

    /// Generate a new random backoff within the configured bounds.
    pub fn new_rand_retry_backoff(&self) -> u64 {
        thread_rng().gen_range(self.retry_backoff_min..self.retry_backoff_max)
    }
}

/// A configuration builder.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    session_timeout: Option<u64>,
    heartbeat_interval: Option<u64>,
    retry_backoff_min: Option<u64>,
    retry_backoff_max: Option<u64>,
    default_consistency: Option<Consistency>,
}

impl ConfigBuilder {
    /// Set the session timeout to request from the cluster, in milliseconds.
    pub fn session_timeout(mut self, millis: u64) -> Self {
        self.session_timeout = Some(millis);
        self
    }

    /// Set the keep-alive interval, in milliseconds.
    ///
    /// Defaults to half the session timeout.
    pub fn heartbeat_interval(mut self, millis: u64) -> Self {
        self.heartbeat_interval = Some(millis);
        self
    }

    /// Set the dispatch retry backoff bounds, in milliseconds.
    pub fn retry_backoff(mut self, min: u64, max: u64) -> Self {
        self.retry_backoff_min = Some(min);
        self.retry_backoff_max = Some(max);
        self
    }

    /// Set the consistency level used for queries submitted without an
    /// explicit level.
    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.default_consistency = Some(consistency);
        self
    }

    /// Validate the state of this builder, returning the final config.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let session_timeout = self.session_timeout.unwrap_or(DEFAULT_SESSION_TIMEOUT);
        if session_timeout == 0 {
            return Err(ConfigError::SessionTimeoutTooSmall);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(session_timeout / 2);
        if heartbeat_interval == 0 || heartbeat_interval >= session_timeout {
            return Err(ConfigError::HeartbeatOutOfRange);
        }
        let retry_backoff_min = self.retry_backoff_min.unwrap_or(DEFAULT_RETRY_BACKOFF_MIN);
        let retry_backoff_max = self.retry_backoff_max.unwrap_or(DEFAULT_RETRY_BACKOFF_MAX);
        if retry_backoff_min == 0 || retry_backoff_max <= retry_backoff_min {
            return Err(ConfigError::InvalidRetryBackoff);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            session_timeout,
            heartbeat_interval,
            retry_backoff_min,
            retry_backoff_max,
            default_consistency: self.default_consistency.unwrap_or(Consistency::Linearizable),
        })
    }
}
