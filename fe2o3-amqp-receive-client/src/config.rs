//! Configuration of the receive client

use std::time::Duration;

use crate::{
    constants::{
        DEFAULT_CONTAINER_ID, DEFAULT_PREFETCH, DEFAULT_REFRESH_WINDOW, DEFAULT_TOKEN_LIFETIME,
    },
    credit::ReplenishPolicy,
    error::ConfigError,
};

/// Configuration of a [`ReceiveClient`](crate::ReceiveClient)
///
/// ## Default configuration
///
/// | Field | Default Value |
/// |-------|---------------|
/// |`timeout`|`None`|
/// |`prefetch`|`300`|
/// |`debug`|`false`|
/// |`replenish`|`ReplenishPolicy { low_water_mark: 0 }`|
/// |`token_lifetime`|`3600s`|
/// |`refresh_window`|`300s`|
/// |`container_id`|`"fe2o3-amqp-receive-client"`|
/// |`link_name`|`None`|
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use fe2o3_amqp_receive_client::ReceiveConfig;
///
/// let config = ReceiveConfig::default()
///     .timeout(Duration::from_millis(50))
///     .prefetch(10);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    /// Idle timeout of a receive operation. A receive ends once no message has arrived within
    /// this duration. `None` waits indefinitely.
    pub timeout: Option<Duration>,

    /// Steady-state link credit
    pub prefetch: u32,

    /// Log every delivery's annotations at `debug` level
    pub debug: bool,

    /// When credit is replenished
    pub replenish: ReplenishPolicy,

    /// Lifetime of generated tokens
    pub token_lifetime: Duration,

    /// How long before expiry a token is renewed
    pub refresh_window: Duration,

    /// Container id of the connection
    pub container_id: String,

    /// Name of the receive link. Defaults to `receiver-<partition>`
    pub link_name: Option<String>,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            prefetch: DEFAULT_PREFETCH,
            debug: false,
            replenish: ReplenishPolicy::default(),
            token_lifetime: DEFAULT_TOKEN_LIFETIME,
            refresh_window: DEFAULT_REFRESH_WINDOW,
            container_id: DEFAULT_CONTAINER_ID.to_string(),
            link_name: None,
        }
    }
}

impl ReceiveConfig {
    /// Set the idle timeout
    pub fn timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Set the steady-state link credit
    pub fn prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Turn verbose delivery logging on or off
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the credit replenish policy
    pub fn replenish(mut self, policy: ReplenishPolicy) -> Self {
        self.replenish = policy;
        self
    }

    /// Set the lifetime of generated tokens
    pub fn token_lifetime(mut self, lifetime: Duration) -> Self {
        self.token_lifetime = lifetime;
        self
    }

    /// Set how long before expiry a token is renewed
    pub fn refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    /// Set the container id of the connection
    pub fn container_id(mut self, id: impl Into<String>) -> Self {
        self.container_id = id.into();
        self
    }

    /// Set the name of the receive link
    pub fn link_name(mut self, name: impl Into<String>) -> Self {
        self.link_name = Some(name.into());
        self
    }

    /// Check that the values are consistent with each other
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch == 0 {
            return Err(ConfigError::ZeroPrefetch);
        }
        if self.replenish.low_water_mark >= self.prefetch {
            return Err(ConfigError::LowWaterMark {
                low_water_mark: self.replenish.low_water_mark,
                prefetch: self.prefetch,
            });
        }
        if self.refresh_window >= self.token_lifetime {
            return Err(ConfigError::RefreshWindow);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ReceiveConfig;
    use crate::{credit::ReplenishPolicy, error::ConfigError};

    #[test]
    fn default_config_is_valid() {
        let config = ReceiveConfig::default();
        assert_eq!(config.prefetch, 300);
        assert!(config.timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_prefetch_is_rejected() {
        let config = ReceiveConfig::default().prefetch(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroPrefetch));
    }

    #[test]
    fn low_water_mark_must_be_below_prefetch() {
        let config = ReceiveConfig::default()
            .prefetch(10)
            .replenish(ReplenishPolicy::new(10));
        assert_eq!(
            config.validate(),
            Err(ConfigError::LowWaterMark {
                low_water_mark: 10,
                prefetch: 10
            })
        );
    }

    #[test]
    fn refresh_window_must_be_shorter_than_lifetime() {
        let config = ReceiveConfig::default()
            .token_lifetime(Duration::from_secs(30))
            .refresh_window(Duration::from_secs(30));
        assert_eq!(config.validate(), Err(ConfigError::RefreshWindow));
    }
}
