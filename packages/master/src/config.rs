//! Master configuration loaded from environment variables.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use ffrtmp_core::{RetryPolicy, TimeoutPolicy};
use std::env;

use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// When unset the master runs on the in-memory store.
    pub database_url: Option<String>,
    /// Bearer token required on all endpoints except `/health`. Unset
    /// disables authentication (development only).
    pub auth_token: Option<String>,
    pub scheduler: SchedulerConfig,
    pub timeouts: TimeoutPolicy,
}

impl Config {
    /// Load configuration from environment variables, reading a `.env`
    /// file first when present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let scheduler = SchedulerConfig {
            assignment_interval: env_duration_secs("ASSIGNMENT_INTERVAL_SECS", 2)?,
            health_interval: env_duration_secs("HEALTH_INTERVAL_SECS", 5)?,
            cleanup_interval: env_duration_secs("CLEANUP_INTERVAL_SECS", 10)?,
            worker_timeout: env_duration_secs("WORKER_TIMEOUT_SECS", 120)?,
            retry: RetryPolicy {
                base: env_duration_secs("RETRY_BACKOFF_BASE_SECS", 1)?,
                multiplier: env_parse("RETRY_BACKOFF_MULTIPLIER", 2)?,
                cap: env_duration_secs("RETRY_BACKOFF_CAP_SECS", 300)?,
            },
        };

        let timeouts = TimeoutPolicy {
            run_timeout: env_duration_secs("JOB_RUN_TIMEOUT_SECS", 30 * 60)?,
            activity_timeout: env_duration_secs("JOB_ACTIVITY_TIMEOUT_SECS", 5 * 60)?,
            scenario_overrides: scenario_overrides()?,
        };

        Ok(Self {
            port: env_parse("PORT", 8080)?,
            database_url: env::var("DATABASE_URL").ok(),
            auth_token: env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            scheduler,
            timeouts,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(v) => v.parse().with_context(|| format!("{key} must be a valid value")),
        Err(_) => Ok(default),
    }
}

fn env_duration_secs(key: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default_secs)?))
}

/// `JOB_TIMEOUT_OVERRIDES="live-4k=600,smoke=30"` bounds the named
/// scenarios' total runtime in seconds.
fn scenario_overrides() -> Result<HashMap<String, Duration>> {
    let mut map = HashMap::new();
    let Ok(raw) = env::var("JOB_TIMEOUT_OVERRIDES") else {
        return Ok(map);
    };
    for entry in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let (scenario, secs) = entry
            .split_once('=')
            .with_context(|| format!("malformed JOB_TIMEOUT_OVERRIDES entry: {entry}"))?;
        let secs: u64 = secs
            .trim()
            .parse()
            .with_context(|| format!("malformed timeout in JOB_TIMEOUT_OVERRIDES: {entry}"))?;
        map.insert(scenario.trim().to_string(), Duration::from_secs(secs));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_override_parsing() {
        env::set_var("JOB_TIMEOUT_OVERRIDES", "live-4k=600, smoke=30");
        let map = scenario_overrides().unwrap();
        env::remove_var("JOB_TIMEOUT_OVERRIDES");
        assert_eq!(map.get("live-4k"), Some(&Duration::from_secs(600)));
        assert_eq!(map.get("smoke"), Some(&Duration::from_secs(30)));
    }
}
