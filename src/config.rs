//! Runtime configuration.
//!
//! Loaded from environment variables, with command-line flags taking
//! precedence. Every value has a default.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::worker::{Backoff, WorkerSettings};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: String, value: String },

    #[error("flag {0} expects a value")]
    MissingValue(String),

    #[error("unknown flag {0}")]
    UnknownFlag(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Base URL of the scoring service.
    pub accrual_address: String,
    /// Budget of each job, counted from submission.
    pub job_timeout: Duration,
    /// Delay after the first 429 in a row.
    pub rate_limit_backoff: Duration,
    /// Ceiling for the doubling delay after consecutive 429s.
    pub rate_limit_backoff_max: Duration,
    /// Pause between polls that did not reach a terminal status.
    pub poll_interval: Duration,
    /// Cap on concurrently running workers; unbounded when unset.
    pub max_concurrent_jobs: Option<usize>,
    /// Per-request timeout of the scoring client.
    pub http_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accrual_address: "http://localhost:8081".to_string(),
            job_timeout: Duration::from_secs(10),
            rate_limit_backoff: Duration::from_secs(1),
            rate_limit_backoff_max: Duration::from_secs(1),
            poll_interval: Duration::ZERO,
            max_concurrent_jobs: None,
            http_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build from any variable source; `lookup` returns `None` for unset keys.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let rate_limit_backoff = millis(&lookup, "RATE_LIMIT_BACKOFF_MS")?
            .unwrap_or(defaults.rate_limit_backoff);

        Ok(Self {
            accrual_address: lookup("ACCRUAL_SYSTEM_ADDRESS")
                .filter(|v| !v.trim().is_empty())
                .map(|v| normalize_address(&v))
                .unwrap_or(defaults.accrual_address),
            job_timeout: parse::<u64>(&lookup, "JOB_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            rate_limit_backoff,
            // without an explicit ceiling the backoff stays fixed
            rate_limit_backoff_max: millis(&lookup, "RATE_LIMIT_BACKOFF_MAX_MS")?
                .unwrap_or(rate_limit_backoff),
            poll_interval: millis(&lookup, "POLL_INTERVAL_MS")?.unwrap_or(defaults.poll_interval),
            max_concurrent_jobs: parse::<usize>(&lookup, "MAX_CONCURRENT_JOBS")?
                .filter(|n| *n > 0),
            http_timeout: parse::<u64>(&lookup, "HTTP_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
        })
    }

    /// Apply command-line flags on top of the loaded values.
    ///
    /// Recognizes `-r <address>` for the scoring service. Returns the
    /// remaining positional arguments.
    pub fn apply_args<I>(&mut self, args: I) -> Result<Vec<String>, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut positional = Vec::new();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-r" => {
                    let value = args
                        .next()
                        .ok_or_else(|| ConfigError::MissingValue(arg.clone()))?;
                    self.accrual_address = normalize_address(&value);
                }
                flag if flag.starts_with('-') && flag.len() > 1 => {
                    return Err(ConfigError::UnknownFlag(flag.to_string()));
                }
                _ => positional.push(arg),
            }
        }
        Ok(positional)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            backoff: Backoff::new(self.rate_limit_backoff, self.rate_limit_backoff_max),
            poll_interval: self.poll_interval,
        }
    }
}

/// Accept a bare `host:port` as well as a full URL.
fn normalize_address(value: &str) -> String {
    let value = value.trim();
    if value.starts_with("http://") || value.starts_with("https://") {
        value.to_string()
    } else {
        format!("http://{value}")
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        })
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_millis))
}
