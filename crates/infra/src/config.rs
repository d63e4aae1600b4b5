//! Process configuration read from the environment.
//!
//! | variable | default |
//! |---|---|
//! | `REDIS_URL` | unset: in-memory stores (single process) |
//! | `SCRIBE_BIND_ADDR` | `0.0.0.0:8080` |
//! | `SCRIBE_LOCK_TTL_MS` | `5000` (at least `100`) |
//! | `SCRIBE_CACHE_IN_FLIGHT` | `true` |
//! | `SCRIBE_FEED_INTERVAL_SECS` | `900` |
//! | `SCRIBE_<QUEUE>_CONCURRENCY` | per queue |
//! | `SCRIBE_<QUEUE>_ATTEMPTS` | per queue |
//! | `SCRIBE_<QUEUE>_TIMEOUT_MS` | per queue |
//! | `SCRIBE_<QUEUE>_BACKOFF` | `exponential` |
//!
//! `<QUEUE>` is `SUMMARY`, `FEED_INGESTION` or `NOTIFICATION`.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{BackoffStrategy, QueueConfigs, QueueName};
use crate::quota::{DEFAULT_LOCK_TTL, MIN_LOCK_TTL};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub redis_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub lock_ttl: Duration,
    /// Cache live status snapshots for a few seconds
    pub cache_in_flight: bool,
    pub queues: QueueConfigs,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            lock_ttl: DEFAULT_LOCK_TTL,
            cache_in_flight: true,
            queues: QueueConfigs::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let env = Env(&lookup);

        cfg.redis_url = env.raw("REDIS_URL").filter(|url| !url.trim().is_empty());
        if let Some(addr) = env.parse::<SocketAddr>("SCRIBE_BIND_ADDR")? {
            cfg.bind_addr = addr;
        }
        if let Some(ms) = env.positive::<u64>("SCRIBE_LOCK_TTL_MS")? {
            let ttl = Duration::from_millis(ms);
            if ttl < MIN_LOCK_TTL {
                return Err(invalid(
                    "SCRIBE_LOCK_TTL_MS",
                    &ms.to_string(),
                    format!("must be at least {}", MIN_LOCK_TTL.as_millis()),
                ));
            }
            cfg.lock_ttl = ttl;
        }
        if let Some(enabled) = env.parse::<bool>("SCRIBE_CACHE_IN_FLIGHT")? {
            cfg.cache_in_flight = enabled;
        }
        if let Some(secs) = env.parse::<u64>("SCRIBE_FEED_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(invalid("SCRIBE_FEED_INTERVAL_SECS", "0", "must be positive"));
            }
            cfg.queues.feed_ingestion.cron_interval = Some(Duration::from_secs(secs));
        }

        for name in QueueName::ALL {
            let prefix = format!("SCRIBE_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
            let queue = cfg.queues.get_mut(name);

            if let Some(n) = env.positive::<usize>(&format!("{prefix}_CONCURRENCY"))? {
                queue.concurrency = n;
            }
            if let Some(n) = env.positive::<u32>(&format!("{prefix}_ATTEMPTS"))? {
                queue.retry.max_attempts = n;
            }
            if let Some(ms) = env.positive::<u64>(&format!("{prefix}_TIMEOUT_MS"))? {
                queue.timeout = Duration::from_millis(ms);
            }
            if let Some(strategy) = env.parse::<BackoffStrategy>(&format!("{prefix}_BACKOFF"))? {
                queue.retry.strategy = strategy;
            }
        }

        Ok(cfg)
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn raw(&self, var: &str) -> Option<String> {
        (self.0)(var)
    }

    fn parse<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.raw(var) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(var, &value, e.to_string()))
    }

    fn positive<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr + Default + PartialEq,
        T::Err: std::fmt::Display,
    {
        match self.parse::<T>(var)? {
            Some(v) if v == T::default() => Err(invalid(var, "0", "must be positive")),
            other => Ok(other),
        }
    }
}

fn invalid(var: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from(pairs: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        PipelineConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(from(&[]).unwrap(), PipelineConfig::default());
    }

    #[test]
    fn queue_overrides_apply_to_named_queue_only() {
        let cfg = from(&[
            ("SCRIBE_FEED_INGESTION_CONCURRENCY", "2"),
            ("SCRIBE_SUMMARY_ATTEMPTS", "5"),
            ("SCRIBE_NOTIFICATION_TIMEOUT_MS", "1500"),
            ("SCRIBE_SUMMARY_BACKOFF", "linear"),
            ("SCRIBE_FEED_INTERVAL_SECS", "60"),
        ])
        .unwrap();

        assert_eq!(cfg.queues.feed_ingestion.concurrency, 2);
        assert_eq!(cfg.queues.summary.retry.max_attempts, 5);
        assert_eq!(cfg.queues.summary.retry.strategy, BackoffStrategy::Linear);
        assert_eq!(cfg.queues.notification.timeout, Duration::from_millis(1500));
        assert_eq!(cfg.queues.feed_ingestion.cron_interval, Some(Duration::from_secs(60)));
        assert_eq!(cfg.queues.notification.retry.max_attempts, 5);
        assert_eq!(cfg.queues.summary.concurrency, 5);
    }

    #[test]
    fn redis_and_bind_address() {
        let cfg = from(&[
            ("REDIS_URL", "redis://cache:6379"),
            ("SCRIBE_BIND_ADDR", "127.0.0.1:9000"),
            ("SCRIBE_CACHE_IN_FLIGHT", "false"),
        ])
        .unwrap();
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(cfg.bind_addr.port(), 9000);
        assert!(!cfg.cache_in_flight);
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = from(&[("SCRIBE_SUMMARY_CONCURRENCY", "many")]).unwrap_err();
        assert!(err.to_string().starts_with("SCRIBE_SUMMARY_CONCURRENCY="));

        let err = from(&[("SCRIBE_NOTIFICATION_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { reason, .. } if reason == "must be positive"));
    }

    #[test]
    fn lock_ttl_must_outlast_the_critical_section() {
        let err = from(&[("SCRIBE_LOCK_TTL_MS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, ref reason, .. }
            if var == "SCRIBE_LOCK_TTL_MS" && reason == "must be positive"));

        let err = from(&[("SCRIBE_LOCK_TTL_MS", "5")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref reason, .. } if reason == "must be at least 100"));

        let cfg = from(&[("SCRIBE_LOCK_TTL_MS", "250")]).unwrap();
        assert_eq!(cfg.lock_ttl, Duration::from_millis(250));
    }
}
