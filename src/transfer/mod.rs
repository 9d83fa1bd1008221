// ============================================================================
// File: src/transfer/mod.rs
// ----------------------------------------------------------------------------
// Disk transfer strategies.
//
// Three interchangeable ways to move one disk image between hosts:
// - bulk sync: rsync tuned for sparse images (default)
// - direct stream: dd piped over ssh, no intermediate file
// - block incremental: block-level diff for repeated syncs
//
// Every strategy runs its copy command on the source host and falls back to
// a local sparse copy when both ends are the same host.
// ============================================================================

mod block_sync;
mod bulk_sync;
mod direct_stream;

pub use block_sync::BlockSyncStrategy;
pub use bulk_sync::BulkSyncStrategy;
pub use direct_stream::DirectStreamStrategy;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio_util::sync::CancellationToken;

use crate::AsyncTask;
use crate::error::{CloneError, CloneResult};
use crate::models::{BandwidthLimit, TransferMethod};
use crate::security::CommandBuilder;
use crate::transport::{RemoteExecutor, run_until_cancelled};

/// One disk copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub operation_id: String,
    pub source_host: String,
    pub dest_host: String,
    pub source_path: String,
    pub dest_path: String,
    pub bandwidth_limit: Option<BandwidthLimit>,
    /// Known source size in bytes, reported when the strategy cannot measure
    pub size_hint: u64,
    /// Bound on the copy command itself
    pub timeout: Option<Duration>,
}

impl TransferJob {
    pub fn new(
        operation_id: impl Into<String>,
        source_host: impl Into<String>,
        dest_host: impl Into<String>,
        source_path: impl Into<String>,
        dest_path: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            source_host: source_host.into(),
            dest_host: dest_host.into(),
            source_path: source_path.into(),
            dest_path: dest_path.into(),
            bandwidth_limit: None,
            size_hint: 0,
            timeout: None,
        }
    }

    pub fn with_bandwidth_limit(mut self, limit: Option<BandwidthLimit>) -> Self {
        self.bandwidth_limit = limit;
        self
    }

    pub fn with_size_hint(mut self, bytes: u64) -> Self {
        self.size_hint = bytes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Both ends on one host
    pub fn is_local(&self) -> bool {
        self.source_host == self.dest_host
    }

    /// Turn a non-zero copy exit into a transfer error tagged with both hosts
    fn tag(&self, err: CloneError) -> CloneError {
        match err {
            CloneError::RemoteCommand {
                exit_code, stderr, ..
            } => CloneError::transfer(
                &self.source_host,
                &self.dest_host,
                format!(
                    "{} -> {} exited with code {exit_code}: {stderr}",
                    self.source_path, self.dest_path
                ),
            ),
            other => other,
        }
    }
}

/// A way to copy one disk image from one host to another
pub trait TransferStrategy: Send + Sync + Debug {
    fn method(&self) -> TransferMethod;

    /// Copy the job's file, returning bytes transferred
    fn transfer(&self, job: TransferJob, cancel: CancellationToken) -> AsyncTask<CloneResult<u64>>;
}

/// Run one command for a transfer, tagging failures
///
/// Cancelling stops the command on the host, not just the local wait.
async fn run_step(
    executor: &dyn RemoteExecutor,
    job: &TransferJob,
    host: &str,
    command: &str,
    cancel: &CancellationToken,
) -> CloneResult<String> {
    run_until_cancelled(executor, host, command, job.timeout, cancel, &job.operation_id)
        .await
        .map(|out| out.stdout)
        .map_err(|e| job.tag(e))
}

/// Sparse copy on a single host
async fn local_copy(
    executor: &dyn RemoteExecutor,
    job: &TransferJob,
    cancel: &CancellationToken,
) -> CloneResult<u64> {
    info!(
        "Local copy host={} src={} dst={}",
        job.source_host, job.source_path, job.dest_path
    );
    let command = CommandBuilder::copy(&job.source_path, &job.dest_path)?;
    run_step(executor, job, &job.source_host, &command, cancel).await?;
    Ok(job.size_hint)
}

/// Parse `stat -c %s` output
fn parse_size(job: &TransferJob, stdout: &str) -> CloneResult<u64> {
    stdout.trim().parse().map_err(|_| {
        CloneError::transfer(
            &job.source_host,
            &job.dest_host,
            format!("Unexpected size output for {}: {:?}", job.source_path, stdout.trim()),
        )
    })
}

/// Parent directory of a remote path
fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// Build the strategy for `method`
pub fn create_strategy(
    method: TransferMethod,
    executor: Arc<dyn RemoteExecutor>,
) -> Arc<dyn TransferStrategy> {
    match method {
        TransferMethod::BulkSync => Arc::new(BulkSyncStrategy::new(executor)),
        TransferMethod::DirectStream => Arc::new(DirectStreamStrategy::new(executor)),
        TransferMethod::BlockIncremental => Arc::new(BlockSyncStrategy::new(executor)),
    }
}

/// Every strategy this crate ships
pub fn available_strategies() -> Vec<TransferMethod> {
    vec![
        TransferMethod::BulkSync,
        TransferMethod::DirectStream,
        TransferMethod::BlockIncremental,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeExecutor;

    #[test]
    fn factory_covers_every_method() {
        let executor: Arc<dyn RemoteExecutor> = Arc::new(FakeExecutor::new());
        for method in available_strategies() {
            assert_eq!(create_strategy(method, executor.clone()).method(), method);
        }
    }

    #[test]
    fn parent_directories() {
        assert_eq!(parent_dir("/var/lib/images/a.qcow2"), "/var/lib/images");
        assert_eq!(parent_dir("/a.qcow2"), "/");
        assert_eq!(parent_dir("a.qcow2"), ".");
    }

    #[tokio::test]
    async fn same_host_uses_local_copy_for_every_strategy() {
        for method in available_strategies() {
            let fake = Arc::new(FakeExecutor::new());
            let strategy = create_strategy(method, fake.clone());
            let job = TransferJob::new("op", "hostA", "hostA", "/img/a.qcow2", "/stage/a.qcow2")
                .with_size_hint(4096);

            let bytes = strategy
                .transfer(job, CancellationToken::new())
                .await
                .unwrap()
                .unwrap();

            assert_eq!(bytes, 4096);
            let commands = fake.commands();
            assert_eq!(commands.len(), 1, "{method:?}: {commands:?}");
            assert!(commands[0].starts_with("cp --sparse=always"));
        }
    }

    #[tokio::test]
    async fn nonzero_exit_becomes_tagged_transfer_error() {
        let fake = Arc::new(FakeExecutor::new());
        fake.fail_with_exit("cp ", 1, "No space left on device");
        let strategy = create_strategy(TransferMethod::BulkSync, fake.clone());
        let job = TransferJob::new("op", "hostA", "hostA", "/img/a", "/stage/a");

        let err = strategy
            .transfer(job, CancellationToken::new())
            .await
            .unwrap()
            .unwrap_err();
        match err {
            CloneError::Transfer {
                source_host,
                dest_host,
                message,
            } => {
                assert_eq!(source_host, "hostA");
                assert_eq!(dest_host, "hostA");
                assert!(message.contains("No space left"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
