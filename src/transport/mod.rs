// ============================================================================
// File: src/transport/mod.rs
// ----------------------------------------------------------------------------
// Remote execution seam.
//
// Everything above this module talks to hosts through `RemoteExecutor`.
// `SessionManager` is the libssh2 implementation; tests swap in a fake.
// ============================================================================

mod alias;
mod host_key;
mod manager;
mod retry;
mod session;

pub use alias::{AliasEntry, AliasFile, AliasMatch};
pub use host_key::HostKeyPolicy;
pub use manager::{SessionManager, resolve_username};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use session::{RemoteSession, SshAuth};

use std::fmt::Debug;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::async_task::{AsyncTask, AsyncTaskBuilder};
use crate::error::{CloneError, CloneResult};

/// Captured result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Where a host name actually leads after alias resolution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostEndpoint {
    /// Name the caller used
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub identity_file: Option<PathBuf>,
}

impl HostEndpoint {
    /// `user@hostname`
    pub fn login(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }
}

/// Command execution and file upload against named hosts
///
/// Implementations hide authentication, alias lookup, retries, and
/// connection reuse.
pub trait RemoteExecutor: Send + Sync + Debug {
    /// Run `command` on `host`
    ///
    /// A non-zero exit is reported in the output, not as an error. Exceeding
    /// `timeout` yields [`CloneError::Timeout`].
    fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> AsyncTask<CloneResult<CommandOutput>>;

    /// Run `command` on `host` and stop it remotely if `cancel` fires
    ///
    /// Cancellation yields [`CloneError::Cancelled`] once the command is
    /// gone. The default aborts the local task; executors holding a live
    /// channel close it so the remote process sees EOF.
    fn execute_cancellable(
        &self,
        host: &str,
        command: &str,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> AsyncTask<CloneResult<CommandOutput>> {
        let mut task = self.execute(host, command, timeout);
        let host = host.to_string();
        AsyncTaskBuilder::new(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    task.abort();
                    Err(CloneError::Cancelled { operation_id: format!("command on {host}") })
                }
                joined = &mut task => joined?,
            }
        })
        .spawn()
    }

    /// Copy a local file to `remote_path` on `host`, returning bytes sent
    fn upload(&self, host: &str, local_path: &Path, remote_path: &str)
    -> AsyncTask<CloneResult<u64>>;

    /// Resolved connection details for `host`
    fn resolve(&self, host: &str) -> CloneResult<HostEndpoint>;

    /// Drop every cached connection
    fn close_all(&self);
}

/// Run a command and turn a non-zero exit into [`CloneError::RemoteCommand`]
pub async fn run_checked(
    executor: &dyn RemoteExecutor,
    host: &str,
    command: &str,
    timeout: Option<Duration>,
) -> CloneResult<CommandOutput> {
    let output = executor.execute(host, command, timeout).await??;
    checked(host, command, output)
}

/// [`run_checked`] for long-running commands that `cancel` must be able to stop
///
/// Returns only after the remote command has ended or been torn down.
pub async fn run_until_cancelled(
    executor: &dyn RemoteExecutor,
    host: &str,
    command: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    operation_id: &str,
) -> CloneResult<CommandOutput> {
    let cancelled = || CloneError::Cancelled {
        operation_id: operation_id.to_string(),
    };
    if cancel.is_cancelled() {
        return Err(cancelled());
    }
    let output = executor
        .execute_cancellable(host, command, timeout, cancel.clone())
        .await?
        .map_err(|e| match e {
            CloneError::Cancelled { .. } => cancelled(),
            other => other,
        })?;
    checked(host, command, output)
}

fn checked(host: &str, command: &str, output: CommandOutput) -> CloneResult<CommandOutput> {
    if !output.success() {
        return Err(CloneError::RemoteCommand {
            host: host.to_string(),
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Race `future` against `cancel`
///
/// Cancellation wins ties so no new remote work starts once it is requested.
pub async fn cancellable<T, F>(
    cancel: &CancellationToken,
    operation_id: &str,
    future: F,
) -> CloneResult<T>
where
    F: Future<Output = CloneResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CloneError::Cancelled {
            operation_id: operation_id.to_string(),
        }),
        result = future => result,
    }
}
