// ============================================================================
// File: src/transport/host_key.rs
// ----------------------------------------------------------------------------
// Host key verification against an OpenSSH known-hosts file.
// ============================================================================

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};
use ssh2::{CheckResult, KnownHostFileKind, Session};

use crate::error::{CloneError, CloneResult};
use crate::security::expand_home;

use super::HostEndpoint;

/// What to do with a host key that is not in the known-hosts file
///
/// A key that contradicts a recorded one is refused under every policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKeyPolicy {
    /// Refuse unknown hosts
    #[default]
    Strict,
    /// Log and continue
    Warn,
    /// Skip verification entirely
    Accept,
}

impl FromStr for HostKeyPolicy {
    type Err = CloneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "warn" => Ok(Self::Warn),
            "accept" => Ok(Self::Accept),
            other => Err(CloneError::Configuration {
                message: format!("Unknown host key policy {other:?} (strict, warn, accept)"),
            }),
        }
    }
}

impl fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Strict => "strict",
            Self::Warn => "warn",
            Self::Accept => "accept",
        };
        f.write_str(name)
    }
}

fn unknown_host_message(endpoint: &HostEndpoint, file: &Path) -> String {
    format!(
        "Host key for {host}:{port} is not in {file}. Verify the server fingerprint out of band, \
         then add it with: ssh-keyscan -p {port} {host} >> {file}",
        host = endpoint.hostname,
        port = endpoint.port,
        file = file.display(),
    )
}

/// Check the key presented during the handshake
pub(crate) fn verify_host_key(
    session: &Session,
    endpoint: &HostEndpoint,
    known_hosts_file: Option<&Path>,
    policy: HostKeyPolicy,
) -> CloneResult<()> {
    if policy == HostKeyPolicy::Accept {
        return Ok(());
    }

    let failure = |message: String| CloneError::HostKeyVerification {
        host: endpoint.hostname.clone(),
        message,
    };

    let (key, _) = session
        .host_key()
        .ok_or_else(|| failure("Server presented no host key".to_string()))?;

    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| failure(format!("Failed to initialise known hosts: {e}")))?;

    let file = known_hosts_file
        .map(expand_home)
        .unwrap_or_else(|| expand_home(Path::new("~/.ssh/known_hosts")));
    if file.exists() {
        known_hosts
            .read_file(&file, KnownHostFileKind::OpenSSH)
            .map_err(|e| failure(format!("Failed to read {}: {e}", file.display())))?;
    }

    match known_hosts.check_port(&endpoint.hostname, endpoint.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(failure(format!(
            "Host key for {host} does not match the entry in {file}. This may indicate a \
             man-in-the-middle attack. If the host was reinstalled, remove the stale entry \
             with: ssh-keygen -R {host}",
            host = endpoint.hostname,
            file = file.display(),
        ))),
        CheckResult::NotFound | CheckResult::Failure => match policy {
            HostKeyPolicy::Strict => Err(failure(unknown_host_message(endpoint, &file))),
            _ => {
                warn!(
                    "Unverified host key accepted host={} policy={}",
                    endpoint.hostname, policy
                );
                Ok(())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("STRICT".parse::<HostKeyPolicy>().unwrap(), HostKeyPolicy::Strict);
        assert_eq!("warn".parse::<HostKeyPolicy>().unwrap(), HostKeyPolicy::Warn);
        assert_eq!("Accept".parse::<HostKeyPolicy>().unwrap(), HostKeyPolicy::Accept);
        assert!("auto".parse::<HostKeyPolicy>().is_err());
    }

    #[test]
    fn unknown_host_message_has_remediation() {
        let endpoint = HostEndpoint {
            alias: "web1".into(),
            hostname: "10.0.0.5".into(),
            port: 2222,
            username: "deploy".into(),
            identity_file: None,
        };
        let msg = unknown_host_message(&endpoint, Path::new("/home/x/.ssh/known_hosts"));
        assert!(msg.contains("ssh-keyscan -p 2222 10.0.0.5"));
        assert!(msg.contains("fingerprint"));
    }
}
