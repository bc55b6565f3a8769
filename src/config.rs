//! Runtime configuration read from the environment
//!
//! Consumed read-only. `from_env` is called after `dotenv::dotenv()` in the
//! binaries so a local `.env` file works the same as exported variables.

use crate::error::ConfigError;
use crate::llm::gemini::DEFAULT_MODEL;
use crate::orchestrator::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};
use crate::orchestrator::{ExecutionPolicy, RetryPolicy, DEFAULT_MAX_IN_FLIGHT};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECTOR_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub financial_api_base_url: Option<String>,
    pub database_url: Option<String>,
    pub ledger_data_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
    /// Wall-clock budget for one whole request
    pub request_timeout: Duration,
    /// Budget for a single connector call, before retries
    pub connector_timeout: Duration,
    pub max_in_flight: usize,
    pub port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_model: DEFAULT_MODEL.to_string(),
            financial_api_base_url: None,
            database_url: None,
            ledger_data_dir: None,
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connector_timeout: DEFAULT_CONNECTOR_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            port: DEFAULT_PORT,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let retry = RetryPolicy::new(
            parse_or(&get, "RETRY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            millis_or(&get, "RETRY_BASE_DELAY_MS", DEFAULT_BASE_DELAY)?,
            millis_or(&get, "RETRY_MAX_DELAY_MS", DEFAULT_MAX_DELAY)?,
        );

        let max_in_flight: usize = parse_or(&get, "MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT)?;
        if max_in_flight == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_IN_FLIGHT".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue("PORT".to_string(), raw))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            financial_api_base_url: get("FINANCIAL_API_BASE_URL").or_else(|| get("TOOLS_API_BASE_URL")),
            database_url: get("DATABASE_URL").or_else(|| get("POSTGRES_URL")),
            ledger_data_dir: get("LEDGER_DATA_DIR").map(PathBuf::from),
            retry,
            request_timeout: secs_or(&get, "REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT)?,
            connector_timeout: secs_or(&get, "CONNECTOR_TIMEOUT_SECS", DEFAULT_CONNECTOR_TIMEOUT)?,
            max_in_flight,
            port,
        })
    }

    pub fn execution_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy {
            max_in_flight: self.max_in_flight,
            retry: self.retry.clone(),
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw)),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let secs = parse_or(get, key, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue(key.to_string(), "must be positive".to_string()));
    }
    Ok(Duration::from_secs(secs))
}
