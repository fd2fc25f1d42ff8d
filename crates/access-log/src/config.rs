// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::constants;
use crate::errors::{ConfigError, SettingsError};

/// Live tuning of the ingestion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Bounded buffer size of the current generation.
    pub capacity: usize,
    /// 0-100, applied to records without a security policy.
    pub sample_percent: u8,
    /// Records persisted per drain tick, 0 = unlimited.
    pub drain_per_second: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: constants::INITIAL_QUEUE_CAPACITY,
            sample_percent: 100,
            drain_per_second: constants::INITIAL_DRAIN_PER_SECOND,
        }
    }
}

/// Wire shape of the queue settings blob stored by the settings service.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct QueueSettingsBlob {
    percent: i64,
    count_per_second: i64,
    max_length: i64,
}

impl QueueSettings {
    pub fn from_json(blob: &[u8]) -> Result<Self, SettingsError> {
        let decoded: QueueSettingsBlob = serde_json::from_slice(blob)?;
        let capacity = if decoded.max_length <= 0 {
            constants::DEFAULT_QUEUE_CAPACITY
        } else {
            usize::try_from(decoded.max_length)
                .unwrap_or(constants::MAX_QUEUE_CAPACITY)
                .min(constants::MAX_QUEUE_CAPACITY)
        };
        Ok(Self {
            capacity,
            sample_percent: decoded.percent.clamp(0, 100) as u8,
            drain_per_second: decoded.count_per_second.max(0) as usize,
        })
    }
}

/// Process configuration for the access-log agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// File holding the queue settings blob, re-read on every poll
    pub settings_path: Option<PathBuf>,
    pub settings_poll_interval: Duration,
    pub drain_interval: Duration,
    /// Records drained per tick when the settings leave the rate unlimited
    pub drain_ceiling: usize,
    /// Deadline of each per-shard query task
    pub shard_timeout: Duration,
    pub intake_host: String,
    pub intake_port: u16,
    /// Shards registered by the standalone agent (0 = fallback shard only)
    pub shard_count: usize,
    /// Directory of the per-shard SQLite databases; shards live in memory when unset
    pub storage_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            settings_path: None,
            settings_poll_interval: constants::DEFAULT_SETTINGS_POLL_INTERVAL,
            drain_interval: constants::DEFAULT_DRAIN_INTERVAL,
            drain_ceiling: constants::DEFAULT_DRAIN_CEILING,
            shard_timeout: constants::DEFAULT_SHARD_TIMEOUT,
            intake_host: constants::DEFAULT_INTAKE_HOST.to_string(),
            intake_port: constants::DEFAULT_INTAKE_PORT,
            shard_count: 0,
            storage_dir: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let log_level = env::var("ACCESS_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);
        let settings_path = env::var("ACCESS_LOG_SETTINGS_PATH")
            .ok()
            .filter(|val| !val.trim().is_empty())
            .map(PathBuf::from);
        let settings_poll_interval = env_parse::<u64>("ACCESS_LOG_SETTINGS_POLL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.settings_poll_interval);
        let drain_interval = env_parse::<u64>("ACCESS_LOG_DRAIN_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.drain_interval);
        let drain_ceiling =
            env_parse::<usize>("ACCESS_LOG_DRAIN_CEILING").unwrap_or(defaults.drain_ceiling);
        let shard_timeout = env_parse::<u64>("ACCESS_LOG_SHARD_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.shard_timeout);
        let intake_host = env::var("ACCESS_LOG_INTAKE_HOST").unwrap_or(defaults.intake_host);
        let intake_port =
            env_parse::<u16>("ACCESS_LOG_INTAKE_PORT").unwrap_or(defaults.intake_port);
        let shard_count = env_parse::<usize>("ACCESS_LOG_SHARDS").unwrap_or(defaults.shard_count);
        let storage_dir = env::var("ACCESS_LOG_STORAGE_DIR")
            .ok()
            .filter(|val| !val.trim().is_empty())
            .map(PathBuf::from);

        let config = Self {
            log_level,
            settings_path,
            settings_poll_interval,
            drain_interval,
            drain_ceiling,
            shard_timeout,
            intake_host,
            intake_port,
            shard_count,
            storage_dir,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        if self.drain_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "drain interval must be greater than 0".to_string(),
            ));
        }
        if self.settings_poll_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "settings poll interval must be greater than 0".to_string(),
            ));
        }
        if self.drain_ceiling == 0 {
            return Err(ConfigError::InvalidConfig(
                "drain ceiling must be greater than 0".to_string(),
            ));
        }
        if self.shard_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "shard timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
