// ============================================================================
// File: src/config.rs
// ----------------------------------------------------------------------------
// Engine configuration: SSH, timeouts, retry budget, directories, defaults.
//
// Loading a settings file is left to the caller; the struct deserializes
// from any serde source. `VMCLONE_*` environment variables override fields.
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use log::{LevelFilter, warn};
use serde::{Deserialize, Serialize};

use crate::error::{CloneError, CloneResult};
use crate::models::BandwidthLimit;
use crate::transport::{HostKeyPolicy, RetryPolicy};

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "VMCLONE_";

/// Configuration for the clone engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneConfig {
    /// Private key used when no alias entry names one; agent auth otherwise
    pub ssh_key_path: Option<PathBuf>,

    /// OpenSSH known-hosts file checked during the handshake
    pub known_hosts_file: Option<PathBuf>,

    /// OpenSSH client config consulted for host aliases
    pub alias_file: Option<PathBuf>,

    pub ssh_port: u16,

    /// Login name used for every host unless an alias entry says otherwise
    pub username: Option<String>,

    pub host_key_policy: HostKeyPolicy,

    pub connect_timeout: Duration,

    /// Bound on a single remote command
    pub command_timeout: Duration,

    /// Bound on a single disk transfer
    pub transfer_timeout: Duration,

    /// Connection attempts before giving up
    pub retry_attempts: u32,

    /// First backoff delay; doubles after each failed attempt
    pub retry_base_delay: Duration,

    /// Where final disk images live on every host
    pub image_dir: String,

    /// Where transaction audit records are written
    pub audit_dir: PathBuf,

    pub parallel_transfers: usize,

    pub bandwidth_limit: Option<String>,

    pub log_level: String,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            ssh_key_path: None,
            known_hosts_file: Some(PathBuf::from("~/.ssh/known_hosts")),
            alias_file: Some(PathBuf::from("~/.ssh/config")),
            ssh_port: 22,
            username: None,
            host_key_policy: HostKeyPolicy::Strict,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(300),
            transfer_timeout: Duration::from_secs(6 * 60 * 60),
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            image_dir: "/var/lib/libvirt/images".to_string(),
            audit_dir: std::env::temp_dir(),
            parallel_transfers: 1,
            bandwidth_limit: None,
            log_level: "info".to_string(),
        }
    }
}

impl CloneConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with the process environment applied on top
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_ssh_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_key_path = Some(path.into());
        self
    }

    pub fn with_known_hosts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_file = Some(path.into());
        self
    }

    pub fn with_alias_file(mut self, path: Option<PathBuf>) -> Self {
        self.alias_file = path;
        self
    }

    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, attempts: u32, base_delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_base_delay = base_delay;
        self
    }

    pub fn with_image_dir(mut self, dir: impl Into<String>) -> Self {
        self.image_dir = dir.into();
        self
    }

    pub fn with_audit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audit_dir = dir.into();
        self
    }

    pub fn with_parallel_transfers(mut self, parallel: usize) -> Self {
        self.parallel_transfers = parallel;
        self
    }

    pub fn with_bandwidth_limit(mut self, limit: impl Into<String>) -> Self {
        self.bandwidth_limit = Some(limit.into());
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Apply `VMCLONE_*` overrides read through `lookup`
    ///
    /// Values that fail to parse are logged and skipped.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());

        if let Some(path) = var("SSH_KEY_PATH") {
            self.ssh_key_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("KNOWN_HOSTS_FILE") {
            self.known_hosts_file = Some(PathBuf::from(path));
        }
        if let Some(port) = var("SSH_PORT") {
            match port.parse() {
                Ok(port) => self.ssh_port = port,
                Err(_) => warn!("Ignoring invalid {ENV_PREFIX}SSH_PORT value={port:?}"),
            }
        }
        if let Some(secs) = var("TIMEOUT") {
            match secs.parse::<u64>() {
                Ok(secs) => self.connect_timeout = Duration::from_secs(secs),
                Err(_) => warn!("Ignoring invalid {ENV_PREFIX}TIMEOUT value={secs:?}"),
            }
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(parallel) = var("PARALLEL_TRANSFERS") {
            match parallel.parse() {
                Ok(parallel) => self.parallel_transfers = parallel,
                Err(_) => warn!("Ignoring invalid {ENV_PREFIX}PARALLEL_TRANSFERS value={parallel:?}"),
            }
        }
        if let Some(limit) = var("BANDWIDTH_LIMIT") {
            self.bandwidth_limit = Some(limit);
        }
        if let Some(policy) = var("HOST_KEY_POLICY") {
            match policy.parse() {
                Ok(policy) => self.host_key_policy = policy,
                Err(_) => warn!("Ignoring invalid {ENV_PREFIX}HOST_KEY_POLICY value={policy:?}"),
            }
        }
        if let Some(dir) = var("IMAGE_DIR") {
            self.image_dir = dir;
        }

        self
    }

    /// Retry policy for connection attempts
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, self.retry_base_delay)
    }

    /// Parsed default bandwidth limit
    pub fn default_bandwidth(&self) -> CloneResult<Option<BandwidthLimit>> {
        self.bandwidth_limit
            .as_deref()
            .map(BandwidthLimit::parse)
            .transpose()
    }

    /// Log level as a filter for the logger
    pub fn level_filter(&self) -> CloneResult<LevelFilter> {
        parse_level(&self.log_level)
    }

    /// Check field ranges
    pub fn validate(&self) -> CloneResult<()> {
        let invalid = |message: String| Err(CloneError::Configuration { message });

        if self.ssh_port == 0 {
            return invalid("ssh_port must be between 1 and 65535".into());
        }
        if self.retry_attempts == 0 {
            return invalid("retry_attempts must be at least 1".into());
        }
        if self.parallel_transfers == 0 {
            return invalid("parallel_transfers must be at least 1".into());
        }
        if self.connect_timeout.is_zero() || self.command_timeout.is_zero() {
            return invalid("timeouts must be greater than zero".into());
        }
        if !self.image_dir.starts_with('/') {
            return invalid(format!("image_dir must be absolute: {}", self.image_dir));
        }
        if let Err(e) = self.default_bandwidth() {
            return invalid(e.to_string());
        }
        self.level_filter()?;
        Ok(())
    }
}

/// Map a level name onto a [`LevelFilter`]
///
/// Accepts the usual Rust names plus `warning` and `critical`.
pub fn parse_level(level: &str) -> CloneResult<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "off" => Ok(LevelFilter::Off),
        "trace" => Ok(LevelFilter::Trace),
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warn" | "warning" => Ok(LevelFilter::Warn),
        "error" | "critical" => Ok(LevelFilter::Error),
        other => Err(CloneError::Configuration {
            message: format!(
                "log_level must be one of trace, debug, info, warning, error, critical: {other:?}"
            ),
        }),
    }
}
