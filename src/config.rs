// Configuration schema for the mesh participation engine.
// Numan Thabit 2025

use std::{
    env, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use thiserror::Error;

use crate::types::Millis;

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// High-level configuration loaded at startup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub attach: AttachConfig,
    pub search: ParentSearchConfig,
    pub supervision: SupervisionConfig,
}

impl Config {
    /// Loads configuration from `NUMIMESH_CONFIG` if set, otherwise returns defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("NUMIMESH_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_missing) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Validates the configuration, returning an error when constraints are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.attach.validate().map_err(ConfigError::Validation)?;
        self.search.validate().map_err(ConfigError::Validation)?;
        self.supervision
            .validate()
            .map_err(ConfigError::Validation)?;
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Attach cycle timing and fan-out tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttachConfig {
    /// Minimum exponential backoff interval between attach cycles.
    pub backoff_min_ms: Millis,
    /// Cap for the exponential backoff.
    pub backoff_max_ms: Millis,
    /// Random jitter added to every backoff delay.
    pub backoff_jitter_ms: Millis,
    /// Random delay before the first attempt of a detached session.
    pub start_jitter_ms: Millis,
    /// Wait after a routers-only Parent Request.
    pub parent_request_router_timeout_ms: Millis,
    /// Wait after a routers-and-REEDs Parent Request.
    pub parent_request_reed_timeout_ms: Millis,
    /// Wait for a Child ID Response.
    pub child_id_timeout_ms: Millis,
    /// Parent Requests in the first cycle after becoming detached.
    pub first_cycle_requests: u8,
    /// How many of the first cycle's requests are scoped to routers only.
    pub first_cycle_router_only: u8,
    /// Parent Requests in subsequent cycles.
    pub next_cycle_requests: u8,
    /// How many of a subsequent cycle's requests are routers only.
    pub next_cycle_router_only: u8,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            backoff_min_ms: 251,
            backoff_max_ms: 1_200_000,
            backoff_jitter_ms: 115,
            start_jitter_ms: 50,
            parent_request_router_timeout_ms: 750,
            parent_request_reed_timeout_ms: 1_250,
            child_id_timeout_ms: 1_250,
            first_cycle_requests: 3,
            first_cycle_router_only: 2,
            next_cycle_requests: 2,
            next_cycle_router_only: 1,
        }
    }
}

impl AttachConfig {
    fn validate(&self) -> Result<(), String> {
        if self.backoff_min_ms == 0 {
            return Err("attach.backoff_min_ms must be non-zero".into());
        }
        if self.backoff_max_ms < self.backoff_min_ms {
            return Err("attach.backoff_max_ms must be >= attach.backoff_min_ms".into());
        }
        if self.first_cycle_requests == 0 || self.next_cycle_requests == 0 {
            return Err("attach cycle request counts must be non-zero".into());
        }
        if self.first_cycle_router_only > self.first_cycle_requests
            || self.next_cycle_router_only > self.next_cycle_requests
        {
            return Err("router-only request count exceeds cycle total".into());
        }
        Ok(())
    }
}

/// Periodic better-parent search tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParentSearchConfig {
    pub enabled: bool,
    /// Interval between link checks while attached.
    pub check_interval_ms: Millis,
    /// Backoff after a search has been triggered.
    pub backoff_interval_ms: Millis,
    /// RSS threshold below which a minimal device searches.
    pub rss_threshold_dbm: i8,
}

impl Default for ParentSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 9 * 60 * 1_000,
            backoff_interval_ms: 10 * 60 * 60 * 1_000,
            rss_threshold_dbm: -65,
        }
    }
}

impl ParentSearchConfig {
    fn validate(&self) -> Result<(), String> {
        if self.check_interval_ms == 0 {
            return Err("search.check_interval_ms must be non-zero".into());
        }
        if self.backoff_interval_ms < self.check_interval_ms {
            return Err("search.backoff_interval_ms must be >= check_interval_ms".into());
        }
        Ok(())
    }
}

/// Parent supervision timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisionConfig {
    /// Negotiated child timeout; keep-alives must complete inside it.
    pub child_timeout_ms: Millis,
    /// How long a graceful detach waits for peer acknowledgment.
    pub detach_wait_ms: Millis,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            child_timeout_ms: 240_000,
            detach_wait_ms: 4_000,
        }
    }
}

impl SupervisionConfig {
    fn validate(&self) -> Result<(), String> {
        if self.child_timeout_ms == 0 {
            return Err("supervision.child_timeout_ms must be non-zero".into());
        }
        if self.detach_wait_ms == 0 {
            return Err("supervision.detach_wait_ms must be non-zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("default config valid");
        assert_eq!(cfg.attach.backoff_min_ms, 251);
        assert_eq!(cfg.attach.first_cycle_requests, 3);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg = Config::from_toml_str(
            r#"
            [attach]
            backoff_max_ms = 600000

            [search]
            rss_threshold_dbm = -70
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.attach.backoff_max_ms, 600_000);
        assert_eq!(cfg.attach.backoff_min_ms, 251);
        assert_eq!(cfg.search.rss_threshold_dbm, -70);
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let err = Config::from_toml_str(
            r#"
            [attach]
            backoff_min_ms = 1000
            backoff_max_ms = 500
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_router_only_count_exceeding_total() {
        let err = Config::from_toml_str(
            r#"
            [attach]
            first_cycle_requests = 2
            first_cycle_router_only = 3
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
