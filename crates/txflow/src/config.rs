use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::reconciler::QuerySpec;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Thirty polling intervals at the default cadence.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(150);
pub const DEFAULT_HISTORY_CAPACITY: usize = 32;

pub const POLL_INTERVAL_ENV_VAR: &str = "TXFLOW_POLL_INTERVAL_MS";
pub const CONFIRMATION_TIMEOUT_ENV_VAR: &str = "TXFLOW_CONFIRM_TIMEOUT_MS";
pub const HISTORY_CAPACITY_ENV_VAR: &str = "TXFLOW_HISTORY_CAPACITY";

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    pub confirmation_timeout: Duration,
    pub history_capacity: usize,
    /// Queries watched as soon as the orchestrator starts.
    pub queries: Vec<QuerySpec>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            queries: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config at `{field_path}`: {message}")]
    Parse { field_path: String, message: String },
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    poll_interval_ms: u64,
    confirmation_timeout_ms: u64,
    history_capacity: usize,
    queries: Vec<QuerySpec>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            confirmation_timeout_ms: DEFAULT_CONFIRMATION_TIMEOUT.as_millis() as u64,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            queries: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let mut deserializer = serde_json::Deserializer::from_str(raw);
        let file: ConfigFile =
            serde_path_to_error::deserialize(&mut deserializer).map_err(|error| {
                ConfigError::Parse {
                    field_path: error.path().to_string(),
                    message: error.inner().to_string(),
                }
            })?;

        Ok(Self {
            poll_interval: Duration::from_millis(file.poll_interval_ms),
            confirmation_timeout: Duration::from_millis(file.confirmation_timeout_ms),
            history_capacity: file.history_capacity,
            queries: file.queries,
        }
        .normalized())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies `TXFLOW_*` environment overrides on top of `self`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|var| match env::var(var) {
            Ok(value) => Some(value),
            Err(env::VarError::NotPresent) => None,
            Err(err) => {
                warn!(env_var = var, error = %err, "unable to read config env var; ignoring");
                None
            }
        })
    }

    pub(crate) fn with_overrides_from(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Self {
        if let Some(ms) =
            parse_override::<u64>(POLL_INTERVAL_ENV_VAR, lookup(POLL_INTERVAL_ENV_VAR))
        {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_override::<u64>(
            CONFIRMATION_TIMEOUT_ENV_VAR,
            lookup(CONFIRMATION_TIMEOUT_ENV_VAR),
        ) {
            self.confirmation_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_override::<usize>(
            HISTORY_CAPACITY_ENV_VAR,
            lookup(HISTORY_CAPACITY_ENV_VAR),
        ) {
            self.history_capacity = capacity;
        }
        self.normalized()
    }

    /// Replaces zero durations with their defaults.
    pub fn normalized(mut self) -> Self {
        self.poll_interval = normalize_non_zero_duration(self.poll_interval, DEFAULT_POLL_INTERVAL);
        self.confirmation_timeout = normalize_non_zero_duration(
            self.confirmation_timeout,
            DEFAULT_CONFIRMATION_TIMEOUT,
        );
        self
    }
}

fn parse_override<T: std::str::FromStr>(var: &'static str, raw: Option<String>) -> Option<T> {
    let value = raw?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(
                env_var = var,
                value = value.as_str(),
                "invalid config env var value; falling back to config"
            );
            None
        }
    }
}

fn normalize_non_zero_duration(value: Duration, fallback: Duration) -> Duration {
    if value.is_zero() {
        fallback
    } else {
        value
    }
}
