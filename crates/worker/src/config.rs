//! Service configuration from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `WORKER_COUNT` | 4 |
//! | `MAX_ATTEMPTS` | 3 |
//! | `ATTEMPT_TIMEOUT_SECS` | 300 |
//! | `LEASE_VISIBILITY_SECS` | 360 |
//! | `LEASE_WAIT_MS` | 1000 |
//! | `RETRY_BASE_DELAY_MS` | 1000 |
//! | `RETRY_MAX_DELAY_MS` | 60000 |
//! | `FREE_LANE_AGING_SECS` | 120 |
//! | `STORAGE_MAX_ATTEMPTS` | 3 |
//! | `REAPER_INTERVAL_SECS` | 30 |
//! | `FREE_JOBS_PER_DAY` | 5 |
//! | `PERSONAL_JOBS_PER_MONTH` | 100 |
//! | `PRO_JOBS_PER_MONTH` | 1000 |
//! | `FREE_CONCURRENT_JOBS` | 1 |
//! | `PERSONAL_CONCURRENT_JOBS` | 3 |
//! | `PRO_CONCURRENT_JOBS` | 5 |
//! | `GENERATION_PROVIDER` | `http` (`http` or `stub`) |
//! | `GENERATION_API_URL` | provider default |
//! | `GENERATION_API_KEY` | required for `http` |
//! | `RESULTS_DIR` | required for `http`; unset with `stub`: in-memory results |
//! | `DATABASE_URL` | unset: in-memory stores |
//! | `LOG_FORMAT` | `json` (`json` or `pretty`) |

use core::str::FromStr;
use std::path::PathBuf;
use std::time::Duration;

use productsnap_infra::dispatch::QueueConfig;
use productsnap_infra::workers::{Backoff, RetryPolicy, WorkerPoolConfig};
use productsnap_jobs::{PlanLimit, PlanLimits};
use productsnap_observability::LogFormat;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Which generation provider the pool talks to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    Http,
    /// Deterministic stand-in that always succeeds.
    Stub,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ProviderKind::Http),
            "stub" => Ok(ProviderKind::Stub),
            other => Err(format!("expected http or stub, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub worker_count: usize,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub lease_visibility: Duration,
    pub lease_wait: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub free_lane_aging: Duration,
    pub storage_max_attempts: u32,
    pub reaper_interval: Duration,
    pub plan_limits: PlanLimits,
    pub provider: ProviderKind,
    pub generation_api_url: Option<String>,
    pub generation_api_key: Option<String>,
    /// Root of the result file store.
    pub results_dir: Option<PathBuf>,
    pub database_url: Option<String>,
    pub log_format: LogFormat,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let provider = env.parse("GENERATION_PROVIDER", ProviderKind::Http)?;
        let generation_api_key = env.string("GENERATION_API_KEY");
        if provider == ProviderKind::Http && generation_api_key.is_none() {
            return Err(ConfigError::Missing("GENERATION_API_KEY"));
        }
        let results_dir = env.string("RESULTS_DIR").map(PathBuf::from);
        if provider == ProviderKind::Http && results_dir.is_none() {
            return Err(ConfigError::Missing("RESULTS_DIR"));
        }

        let config = Self {
            worker_count: env.parse("WORKER_COUNT", 4)?,
            max_attempts: env.parse("MAX_ATTEMPTS", 3)?,
            attempt_timeout: Duration::from_secs(env.parse("ATTEMPT_TIMEOUT_SECS", 300)?),
            lease_visibility: Duration::from_secs(env.parse("LEASE_VISIBILITY_SECS", 360)?),
            lease_wait: Duration::from_millis(env.parse("LEASE_WAIT_MS", 1000)?),
            retry_base_delay: Duration::from_millis(env.parse("RETRY_BASE_DELAY_MS", 1000)?),
            retry_max_delay: Duration::from_millis(env.parse("RETRY_MAX_DELAY_MS", 60_000)?),
            free_lane_aging: Duration::from_secs(env.parse("FREE_LANE_AGING_SECS", 120)?),
            storage_max_attempts: env.parse("STORAGE_MAX_ATTEMPTS", 3)?,
            reaper_interval: Duration::from_secs(env.parse("REAPER_INTERVAL_SECS", 30)?),
            plan_limits: PlanLimits {
                free: PlanLimit::daily(env.parse("FREE_JOBS_PER_DAY", 5)?)
                    .with_concurrent_jobs(env.parse("FREE_CONCURRENT_JOBS", 1)?),
                personal: PlanLimit::monthly(env.parse("PERSONAL_JOBS_PER_MONTH", 100)?)
                    .with_concurrent_jobs(env.parse("PERSONAL_CONCURRENT_JOBS", 3)?),
                pro: PlanLimit::monthly(env.parse("PRO_JOBS_PER_MONTH", 1000)?)
                    .with_concurrent_jobs(env.parse("PRO_CONCURRENT_JOBS", 5)?),
            },
            provider,
            generation_api_url: env.string("GENERATION_API_URL"),
            generation_api_key,
            results_dir,
            database_url: env.string("DATABASE_URL"),
            log_format: env.parse("LOG_FORMAT", LogFormat::Json)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("WORKER_COUNT", self.worker_count as u64),
            ("MAX_ATTEMPTS", u64::from(self.max_attempts)),
            ("ATTEMPT_TIMEOUT_SECS", self.attempt_timeout.as_secs()),
            ("LEASE_VISIBILITY_SECS", self.lease_visibility.as_secs()),
            ("STORAGE_MAX_ATTEMPTS", u64::from(self.storage_max_attempts)),
            ("REAPER_INTERVAL_SECS", self.reaper_interval.as_secs()),
            ("FREE_CONCURRENT_JOBS", concurrency(&self.plan_limits.free)),
            ("PERSONAL_CONCURRENT_JOBS", concurrency(&self.plan_limits.personal)),
            ("PRO_CONCURRENT_JOBS", concurrency(&self.plan_limits.pro)),
        ];
        for (var, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    var,
                    value: "0".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.lease_visibility <= self.attempt_timeout {
            return Err(ConfigError::Invalid {
                var: "LEASE_VISIBILITY_SECS",
                value: self.lease_visibility.as_secs().to_string(),
                reason: "must exceed ATTEMPT_TIMEOUT_SECS".to_string(),
            });
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            visibility_timeout: self.lease_visibility,
            free_lane_aging: self.free_lane_aging,
        }
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_worker_count(self.worker_count)
            .with_attempt_timeout(self.attempt_timeout)
            .with_lease_wait(self.lease_wait)
            .with_lease_extend_interval(self.lease_visibility / 3)
            .with_backoff(Backoff::exponential(self.retry_base_delay, self.retry_max_delay))
            .with_storage_retry(RetryPolicy::new(
                self.storage_max_attempts,
                Backoff::exponential(Duration::from_millis(500), Duration::from_secs(10)),
            ))
            .with_reaper_interval(self.reaper_interval)
    }
}

fn concurrency(limit: &PlanLimit) -> u64 {
    limit.concurrent_jobs.map_or(u64::MAX, u64::from)
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &'static str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        match self.string(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use productsnap_jobs::PeriodKind;

    fn load(vars: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[
            ("GENERATION_API_KEY", "secret"),
            ("RESULTS_DIR", "/var/lib/productsnap"),
        ])
        .unwrap();

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.attempt_timeout, Duration::from_secs(300));
        assert_eq!(config.lease_visibility, Duration::from_secs(360));
        assert_eq!(config.provider, ProviderKind::Http);
        assert_eq!(config.plan_limits.free.limit, 5);
        assert_eq!(config.plan_limits.free.period_kind, PeriodKind::Daily);
        assert_eq!(config.plan_limits.pro.limit, 1000);
        assert_eq!(config.plan_limits.free.concurrent_jobs, Some(1));
        assert_eq!(config.plan_limits.personal.concurrent_jobs, Some(3));
        assert_eq!(config.plan_limits.pro.concurrent_jobs, Some(5));
        assert_eq!(config.results_dir, Some(PathBuf::from("/var/lib/productsnap")));
        assert!(config.database_url.is_none());
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("GENERATION_PROVIDER", "stub"),
            ("WORKER_COUNT", "16"),
            ("FREE_JOBS_PER_DAY", "2"),
            ("PRO_CONCURRENT_JOBS", "10"),
            ("DATABASE_URL", "postgres://localhost/productsnap"),
            ("LOG_FORMAT", "pretty"),
        ])
        .unwrap();

        assert_eq!(config.provider, ProviderKind::Stub);
        assert_eq!(config.worker_count, 16);
        assert_eq!(config.plan_limits.free.limit, 2);
        assert_eq!(config.plan_limits.pro.concurrent_jobs, Some(10));
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/productsnap")
        );
        assert_eq!(config.pool_config().worker_count, 16);
        assert_eq!(config.queue_config().visibility_timeout, Duration::from_secs(360));
    }

    #[test]
    fn malformed_values_fail_fast() {
        let err = load(&[("GENERATION_PROVIDER", "stub"), ("MAX_ATTEMPTS", "three")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "MAX_ATTEMPTS", .. }));

        let err = load(&[("GENERATION_PROVIDER", "openai")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "GENERATION_PROVIDER", .. }));

        let err = load(&[("GENERATION_PROVIDER", "stub"), ("WORKER_COUNT", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WORKER_COUNT", .. }));

        let err = load(&[("GENERATION_PROVIDER", "stub"), ("FREE_CONCURRENT_JOBS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "FREE_CONCURRENT_JOBS", .. }));
    }

    #[test]
    fn http_provider_needs_a_key() {
        assert_eq!(
            load(&[]).unwrap_err(),
            ConfigError::Missing("GENERATION_API_KEY")
        );
    }

    #[test]
    fn http_provider_needs_a_results_dir() {
        assert_eq!(
            load(&[("GENERATION_API_KEY", "secret")]).unwrap_err(),
            ConfigError::Missing("RESULTS_DIR")
        );

        let stub = load(&[("GENERATION_PROVIDER", "stub")]).unwrap();
        assert!(stub.results_dir.is_none());
    }

    #[test]
    fn lease_must_outlive_an_attempt() {
        let err = load(&[
            ("GENERATION_PROVIDER", "stub"),
            ("ATTEMPT_TIMEOUT_SECS", "400"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "LEASE_VISIBILITY_SECS", .. }));
    }
}
