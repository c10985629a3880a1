// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for hangar-daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for the handle database, workspaces, installs and logs
    pub home: PathBuf,
    /// HTTP listen address
    pub bind_addr: SocketAddr,
    /// Pause between stopping a previous container and starting its replacement
    pub stop_start_delay: Duration,
    /// Delay before the first reconciliation tick
    pub reconcile_initial_delay: Duration,
    /// Period of the reconciliation loop
    pub reconcile_interval: Duration,
    /// Largest accepted request body (uploads included)
    pub max_upload_bytes: usize,
    /// Write the handle database once more on shutdown
    pub flush_on_shutdown: bool,
    /// Stop every live container on shutdown
    pub stop_on_shutdown: bool,
    /// Container ids served by the process adapter
    pub process_container_ids: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = lookup("HANGAR_HOME")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_home(lookup("HOME")));

        let bind_addr = lookup("HANGAR_BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:18000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidAddress("HANGAR_BIND_ADDR"))?;

        let stop_start_delay =
            Duration::from_millis(parse_number(&lookup, "HANGAR_STOP_START_DELAY_MS", 5000)?);
        let reconcile_initial_delay =
            Duration::from_secs(parse_number(&lookup, "HANGAR_RECONCILE_INITIAL_DELAY_SECS", 3)?);
        let reconcile_interval =
            Duration::from_secs(parse_number(&lookup, "HANGAR_RECONCILE_INTERVAL_SECS", 20)?);
        if reconcile_interval.is_zero() {
            return Err(ConfigError::InvalidNumber("HANGAR_RECONCILE_INTERVAL_SECS"));
        }

        let max_upload_bytes =
            parse_number(&lookup, "HANGAR_MAX_UPLOAD_BYTES", 512 * 1024 * 1024)? as usize;

        let flush_on_shutdown = parse_flag(&lookup, "HANGAR_FLUSH_ON_SHUTDOWN", true);
        let stop_on_shutdown = parse_flag(&lookup, "HANGAR_STOP_ON_SHUTDOWN", true);

        let process_container_ids = lookup("HANGAR_PROCESS_CONTAINER_IDS")
            .unwrap_or_else(|| "process".to_string())
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            home,
            bind_addr,
            stop_start_delay,
            reconcile_initial_delay,
            reconcile_interval,
            max_upload_bytes,
            flush_on_shutdown,
            stop_on_shutdown,
            process_container_ids,
        })
    }
}

fn default_home(user_home: Option<String>) -> PathBuf {
    match user_home.filter(|v| !v.trim().is_empty()) {
        Some(dir) => PathBuf::from(dir).join(".hangar"),
        None => std::env::temp_dir().join("hangar"),
    }
}

fn parse_number<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(key)),
        None => Ok(default),
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A socket address could not be parsed.
    #[error("Invalid socket address in {0}")]
    InvalidAddress(&'static str),
    /// A numeric setting could not be parsed.
    #[error("Invalid number in {0}")]
    InvalidNumber(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("HOME", "/home/ops")]).unwrap();
        assert_eq!(config.home, PathBuf::from("/home/ops/.hangar"));
        assert_eq!(config.bind_addr, "0.0.0.0:18000".parse().unwrap());
        assert_eq!(config.stop_start_delay, Duration::from_secs(5));
        assert_eq!(config.reconcile_initial_delay, Duration::from_secs(3));
        assert_eq!(config.reconcile_interval, Duration::from_secs(20));
        assert!(config.flush_on_shutdown);
        assert!(config.stop_on_shutdown);
        assert_eq!(config.process_container_ids, vec!["process".to_string()]);
    }

    #[test]
    fn test_home_falls_back_to_temp_dir() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.home, std::env::temp_dir().join("hangar"));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("HANGAR_HOME", "/srv/hangar"),
            ("HANGAR_BIND_ADDR", "127.0.0.1:9000"),
            ("HANGAR_STOP_START_DELAY_MS", "250"),
            ("HANGAR_RECONCILE_INTERVAL_SECS", "60"),
            ("HANGAR_FLUSH_ON_SHUTDOWN", "false"),
            ("HANGAR_PROCESS_CONTAINER_IDS", "tomcat9x, jetty12x,"),
        ])
        .unwrap();
        assert_eq!(config.home, PathBuf::from("/srv/hangar"));
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.stop_start_delay, Duration::from_millis(250));
        assert_eq!(config.reconcile_interval, Duration::from_secs(60));
        assert!(!config.flush_on_shutdown);
        assert_eq!(config.process_container_ids, vec!["tomcat9x", "jetty12x"]);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config_from(&[("HANGAR_BIND_ADDR", "nope")]),
            Err(ConfigError::InvalidAddress(_))
        ));
        assert!(matches!(
            config_from(&[("HANGAR_STOP_START_DELAY_MS", "-1")]),
            Err(ConfigError::InvalidNumber("HANGAR_STOP_START_DELAY_MS"))
        ));
        assert!(matches!(
            config_from(&[("HANGAR_RECONCILE_INTERVAL_SECS", "0")]),
            Err(ConfigError::InvalidNumber(_))
        ));
    }
}
