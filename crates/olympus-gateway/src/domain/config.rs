//! Gateway configuration with validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Exchange wiring.
    pub wiring: WiringConfig,
    /// Correlation budgets and the sweep cadence.
    pub budgets: BudgetConfig,
    /// Resolver cache behavior.
    pub cache: CacheConfig,
    /// Delete pipeline behavior.
    pub delete: DeleteConfig,
}

impl GatewayConfig {
    /// Validate configuration. The gateway refuses to start on any error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wiring.requests_exchange.is_empty() || self.wiring.replies_exchange.is_empty() {
            return Err(ConfigError::EmptyExchangeName);
        }
        if self.wiring.requests_exchange == self.wiring.replies_exchange {
            return Err(ConfigError::DuplicateExchanges);
        }

        for (name, value) in [
            ("request", self.budgets.request),
            ("intercept", self.budgets.intercept),
            ("sweep_interval", self.budgets.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidBudget(format!("{name} cannot be 0")));
            }
        }

        for (name, value) in [
            ("ttl", self.cache.ttl),
            ("flight_ttl", self.cache.flight_ttl),
            ("waiter_ttl", self.cache.waiter_ttl),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidTtl(format!("{name} cannot be 0")));
            }
        }

        for (name, value) in [
            ("discover", self.delete.discover_budget),
            ("action", self.delete.action_budget),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidBudget(format!(
                    "delete {name} budget cannot be 0"
                )));
            }
        }
        if self.delete.retry_backoff_base.is_zero() {
            return Err(ConfigError::InvalidBackoff("base cannot be 0".into()));
        }
        if self.delete.retry_backoff_base > self.delete.retry_backoff_cap {
            return Err(ConfigError::InvalidBackoff("base exceeds cap".into()));
        }

        Ok(())
    }
}

/// Exchange names the engine declares on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WiringConfig {
    /// Topic exchange for outbound requests.
    pub requests_exchange: String,
    /// Direct exchange replies come back on.
    pub replies_exchange: String,
}

impl Default for WiringConfig {
    fn default() -> Self {
        Self {
            requests_exchange: "gw.requests".to_string(),
            replies_exchange: "gw.replies".to_string(),
        }
    }
}

/// How long pending entries live and how often the sweep runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Budget for HTTP-bound requests before a 504 is forced.
    #[serde(with = "humantime_serde")]
    pub request: Duration,
    /// Default budget for intercepts registered without an explicit one.
    #[serde(with = "humantime_serde")]
    pub intercept: Duration,
    /// Cadence of the timeout sweep.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(15),
            intercept: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(2),
        }
    }
}

/// Resolver cache budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age past which a cached entity is treated as absent.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Age past which an in-flight marker no longer blocks a new fetch.
    #[serde(with = "humantime_serde")]
    pub flight_ttl: Duration,
    /// How long a coalesced waiter is kept before it is reaped.
    #[serde(with = "humantime_serde")]
    pub waiter_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3),
            flight_ttl: Duration::from_secs(10),
            waiter_ttl: Duration::from_secs(10),
        }
    }
}

/// Delete pipeline budgets and retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteConfig {
    /// Per-service budget for a discovery answer.
    #[serde(with = "humantime_serde")]
    pub discover_budget: Duration,
    /// Per-service budget for a delete acknowledgment.
    #[serde(with = "humantime_serde")]
    pub action_budget: Duration,
    /// First retry delay recorded for a failed action.
    #[serde(with = "humantime_serde")]
    pub retry_backoff_base: Duration,
    /// Ceiling on the recorded retry delay.
    #[serde(with = "humantime_serde")]
    pub retry_backoff_cap: Duration,
}

impl Default for DeleteConfig {
    fn default() -> Self {
        Self {
            discover_budget: Duration::from_secs(10),
            action_budget: Duration::from_secs(10),
            retry_backoff_base: Duration::from_secs(30),
            retry_backoff_cap: Duration::from_secs(3600),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An exchange name is empty.
    #[error("exchange names cannot be empty")]
    EmptyExchangeName,
    /// Request and reply exchanges must differ.
    #[error("requests and replies exchanges must differ")]
    DuplicateExchanges,
    /// Invalid budget value.
    #[error("invalid budget: {0}")]
    InvalidBudget(String),
    /// Invalid cache TTL value.
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
    /// Invalid retry backoff.
    #[error("invalid retry backoff: {0}")]
    InvalidBackoff(String),
}

/// Humantime serde module for Duration fields.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 || duration.as_secs() == 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .trim()
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|_| "invalid hours")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| "invalid minutes")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else {
            // Plain seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }

}
