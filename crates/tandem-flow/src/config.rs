// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Flow configuration.
//!
//! Defaults can come from the environment (`TANDEM_*`) or a JSON document.
//! Per-flow setters on `Flow` override whatever was loaded here.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_MAX_PARALLEL: &str = "TANDEM_MAX_PARALLEL";
pub const ENV_TASK_TIMEOUT_MS: &str = "TANDEM_TASK_TIMEOUT_MS";
pub const ENV_TIMEOUT_IS_ERROR: &str = "TANDEM_TIMEOUT_IS_ERROR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid flow config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Maximum number of tasks in flight. 0 means unbounded.
    pub max_parallel: usize,
    /// Default timeout applied to tasks that don't set their own.
    pub task_timeout_ms: Option<u64>,
    /// Whether an expired task fails or just completes with no values.
    pub timeout_is_error: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_parallel: 0,
            task_timeout_ms: None,
            timeout_is_error: true,
        }
    }
}

impl FlowConfig {
    /// Default task timeout, ignoring zero.
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Load defaults from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|var| std::env::var(var).ok())
    }

    /// Load defaults using `lookup` in place of the environment.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_PARALLEL) {
            config.max_parallel = parse(ENV_MAX_PARALLEL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TASK_TIMEOUT_MS) {
            config.task_timeout_ms = Some(parse(ENV_TASK_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_IS_ERROR) {
            config.timeout_is_error = parse_bool(ENV_TIMEOUT_IS_ERROR, &raw)?;
        }

        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: raw.to_string(),
    })
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let config = FlowConfig::default();
        assert_eq!(config.max_parallel, 0);
        assert_eq!(config.task_timeout(), None);
        assert!(config.timeout_is_error);
    }

    #[test]
    fn env_overrides() {
        let config = FlowConfig::from_env_with(lookup(&[
            (ENV_MAX_PARALLEL, "4"),
            (ENV_TASK_TIMEOUT_MS, "250"),
            (ENV_TIMEOUT_IS_ERROR, "false"),
        ]))
        .unwrap();
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.task_timeout(), Some(Duration::from_millis(250)));
        assert!(!config.timeout_is_error);
    }

    #[test]
    fn env_rejects_garbage() {
        let err = FlowConfig::from_env_with(lookup(&[(ENV_MAX_PARALLEL, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: ENV_MAX_PARALLEL, .. }));
    }

    #[test]
    fn zero_timeout_means_none() {
        let config = FlowConfig::from_env_with(lookup(&[(ENV_TASK_TIMEOUT_MS, "0")])).unwrap();
        assert_eq!(config.task_timeout(), None);
    }

    #[test]
    fn json_fills_missing_fields() {
        let config = FlowConfig::from_json(r#"{ "max_parallel": 2 }"#).unwrap();
        assert_eq!(config.max_parallel, 2);
        assert!(config.timeout_is_error);
        assert!(FlowConfig::from_json("not json").is_err());
    }
}
