//! Configuration management for tova
//!
//! Every tunable that shapes circuit lifecycle or quorum behavior comes from
//! the environment and has no default: a missing or non-integer value aborts
//! startup with the variable's name. Deployment plumbing (control port, proxy,
//! registry and log locations) falls back to the reference deployment's values.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_CIRCUIT_TTL: &str = "CIRCUIT_TTL";
pub const ENV_REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
pub const ENV_VAL_K: &str = "VAL_K";
pub const ENV_VAL_N: &str = "VAL_N";
pub const ENV_N_CIRCUITS: &str = "N_CIRCUITS";
pub const ENV_PREFIX_LEN: &str = "PREFIX_LEN";
pub const ENV_BUILD_INTERVAL: &str = "BUILD_INTERVAL";

pub const ENV_CONTROL_ADDR: &str = "TOVA_CONTROL_ADDR";
pub const ENV_CONTROL_PASSWORD: &str = "TOVA_CONTROL_PASSWORD";
pub const ENV_SOCKS_PROXY: &str = "TOVA_SOCKS_PROXY";
pub const ENV_REGISTRY_DIR: &str = "TOVA_REGISTRY_DIR";
pub const ENV_LOG_DIR: &str = "TOVA_LOG_DIR";
pub const ENV_VANTAGE_IP: &str = "TOVA_VANTAGE_IP";

const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:9051";
const DEFAULT_SOCKS_PROXY: &str = "socks5h://127.0.0.1:9050";
const DEFAULT_REGISTRY_DIR: &str = "/dev/shm/tova-circuits";
const DEFAULT_LOG_DIR: &str = "logs";

/// Slack added to each fetch when deriving the session wall-clock cap
const SESSION_SLACK_SECS: u64 = 5;

/// Quorum and pool tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TovaConfig {
    /// Seconds a circuit stays eligible before forced renewal
    pub circuit_ttl: u64,
    /// Seconds per fetch
    pub request_timeout: u64,
    /// Votes needed for quorum
    pub val_k: usize,
    /// Maximum total votes before declaring failure
    pub val_n: usize,
    /// Target pool size
    pub n_circuits: usize,
    /// Exit diversity mask length
    pub prefix_len: u8,
    /// Seconds between pool-manager ticks
    pub build_interval: u64,
    pub deployment: DeploymentConfig,
}

/// Where the moving parts of a deployment live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub control_addr: SocketAddr,
    #[serde(skip_serializing)]
    pub control_password: Option<String>,
    pub socks_proxy: String,
    pub registry_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Overrides public-IP discovery for guard weighting
    pub vantage_ip: Option<Ipv4Addr>,
}

impl TovaConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let circuit_ttl = required(&lookup, ENV_CIRCUIT_TTL)?;
        let request_timeout = required(&lookup, ENV_REQUEST_TIMEOUT)?;
        let val_k = required(&lookup, ENV_VAL_K)?;
        let val_n = required(&lookup, ENV_VAL_N)?;
        let n_circuits = required(&lookup, ENV_N_CIRCUITS)?;
        let prefix_len = required(&lookup, ENV_PREFIX_LEN)?;
        let build_interval = required(&lookup, ENV_BUILD_INTERVAL)?;

        at_least(ENV_CIRCUIT_TTL, circuit_ttl, 1)?;
        at_least(ENV_REQUEST_TIMEOUT, request_timeout, 1)?;
        at_least(ENV_VAL_K, val_k, 1)?;
        at_least(ENV_VAL_N, val_n, val_k)?;
        at_least(ENV_N_CIRCUITS, n_circuits, 1)?;
        at_least(ENV_BUILD_INTERVAL, build_interval, 1)?;
        if !(0..=32).contains(&prefix_len) {
            return Err(ConfigError::OutOfRange {
                var: ENV_PREFIX_LEN.to_string(),
                value: prefix_len,
                reason: "must be between 0 and 32".to_string(),
            });
        }

        Ok(Self {
            circuit_ttl: circuit_ttl as u64,
            request_timeout: request_timeout as u64,
            val_k: val_k as usize,
            val_n: val_n as usize,
            n_circuits: n_circuits as usize,
            prefix_len: prefix_len as u8,
            build_interval: build_interval as u64,
            deployment: DeploymentConfig::from_lookup(&lookup)?,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn build_interval(&self) -> Duration {
        Duration::from_secs(self.build_interval)
    }

    /// Absolute wall-clock cap for one validation session
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.val_n as u64 * (self.request_timeout + SESSION_SLACK_SECS))
    }
}

impl DeploymentConfig {
    fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let control_addr = match lookup(ENV_CONTROL_ADDR) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: ENV_CONTROL_ADDR.to_string(),
                value: raw,
            })?,
            None => DEFAULT_CONTROL_ADDR
                .parse()
                .map_err(|_| ConfigError::Missing(ENV_CONTROL_ADDR.to_string()))?,
        };

        let vantage_ip = match lookup(ENV_VANTAGE_IP) {
            Some(raw) => Some(raw.parse().map_err(|_| ConfigError::Invalid {
                var: ENV_VANTAGE_IP.to_string(),
                value: raw,
            })?),
            None => None,
        };

        Ok(Self {
            control_addr,
            control_password: lookup(ENV_CONTROL_PASSWORD),
            socks_proxy: lookup(ENV_SOCKS_PROXY).unwrap_or_else(|| DEFAULT_SOCKS_PROXY.to_string()),
            registry_dir: lookup(ENV_REGISTRY_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_DIR)),
            log_dir: lookup(ENV_LOG_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            vantage_ip,
        })
    }
}

fn required<F>(lookup: &F, var: &str) -> Result<i64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(var).ok_or_else(|| ConfigError::Missing(var.to_string()))?;
    raw.trim().parse::<i64>().map_err(|_| ConfigError::Invalid {
        var: var.to_string(),
        value: raw,
    })
}

fn at_least(var: &str, value: i64, min: i64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::OutOfRange {
            var: var.to_string(),
            value,
            reason: format!("must be at least {}", min),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, String> {
        HashMap::from([
            (ENV_CIRCUIT_TTL, "600".to_string()),
            (ENV_REQUEST_TIMEOUT, "10".to_string()),
            (ENV_VAL_K, "3".to_string()),
            (ENV_VAL_N, "5".to_string()),
            (ENV_N_CIRCUITS, "30".to_string()),
            (ENV_PREFIX_LEN, "16".to_string()),
            (ENV_BUILD_INTERVAL, "5".to_string()),
        ])
    }

    fn load(env: &HashMap<&'static str, String>) -> Result<TovaConfig, ConfigError> {
        TovaConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_load_complete_env() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.val_k, 3);
        assert_eq!(config.val_n, 5);
        assert_eq!(config.prefix_len, 16);
        assert_eq!(config.deployment.socks_proxy, DEFAULT_SOCKS_PROXY);
        assert_eq!(config.deployment.control_addr.port(), 9051);
        assert!(config.deployment.vantage_ip.is_none());
        assert_eq!(config.session_timeout(), Duration::from_secs(5 * 15));
    }

    #[test]
    fn test_missing_var_is_named() {
        let mut env = base_env();
        env.remove(ENV_BUILD_INTERVAL);
        assert_eq!(
            load(&env).unwrap_err(),
            ConfigError::Missing(ENV_BUILD_INTERVAL.to_string())
        );
    }

    #[test]
    fn test_non_integer_rejected() {
        let mut env = base_env();
        env.insert(ENV_VAL_K, "three".to_string());
        match load(&env).unwrap_err() {
            ConfigError::Invalid { var, value } => {
                assert_eq!(var, ENV_VAL_K);
                assert_eq!(value, "three");
            }
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_quorum_bounds_checked() {
        let mut env = base_env();
        env.insert(ENV_VAL_N, "2".to_string());
        assert!(matches!(
            load(&env).unwrap_err(),
            ConfigError::OutOfRange { ref var, .. } if var == ENV_VAL_N
        ));

        let mut env = base_env();
        env.insert(ENV_PREFIX_LEN, "33".to_string());
        assert!(load(&env).is_err());
    }

    #[test]
    fn test_deployment_overrides() {
        let mut env = base_env();
        env.insert(ENV_VANTAGE_IP, "203.0.113.9".to_string());
        env.insert(ENV_CONTROL_ADDR, "10.0.0.2:9151".to_string());
        let config = load(&env).unwrap();
        assert_eq!(
            config.deployment.vantage_ip,
            Some(Ipv4Addr::new(203, 0, 113, 9))
        );
        assert_eq!(config.deployment.control_addr.port(), 9151);

        env.insert(ENV_VANTAGE_IP, "not-an-ip".to_string());
        assert!(load(&env).is_err());
    }
}
