// ============================================================================
// File: src/transfer/block_sync.rs
// ----------------------------------------------------------------------------
// Block-level incremental transfer through bdsync.
// ============================================================================

use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;

use crate::async_task::{AsyncTask, AsyncTaskBuilder};
use crate::error::{CloneError, CloneResult};
use crate::models::TransferMethod;
use crate::security::{BLOCKSYNC_TOOL, BLOCKSYNC_URL, CommandBuilder, RATE_LIMIT_TOOL};
use crate::transport::{RemoteExecutor, cancellable};

use super::{TransferJob, TransferStrategy, local_copy, parent_dir, parse_size, run_step};

/// Sends only the blocks that differ from the destination file
///
/// Pays off on repeated syncs of a mostly unchanged disk. Needs bdsync on
/// both hosts, and pv on the source when a bandwidth limit is set. A missing
/// destination is first allocated as a sparse file of the source's size, so
/// a first copy sends every non-zero block.
#[derive(Debug, Clone)]
pub struct BlockSyncStrategy {
    executor: Arc<dyn RemoteExecutor>,
}

impl BlockSyncStrategy {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    /// Fail fast when `tool` is missing on `host`
    async fn require_tool(
        &self,
        job: &TransferJob,
        host: &str,
        tool: &str,
        hint: &str,
        cancel: &CancellationToken,
    ) -> CloneResult<()> {
        let command = CommandBuilder::command_exists(tool)?;
        let output = cancellable(cancel, &job.operation_id, async {
            Ok::<_, CloneError>(self.executor.execute(host, &command, job.timeout).await??)
        })
        .await?;

        if !output.success() {
            return Err(CloneError::transfer(
                &job.source_host,
                &job.dest_host,
                format!("{tool} is not installed on {host}. {hint}"),
            ));
        }
        Ok(())
    }

    async fn run(&self, job: TransferJob, cancel: CancellationToken) -> CloneResult<u64> {
        if job.is_local() {
            return local_copy(self.executor.as_ref(), &job, &cancel).await;
        }
        let executor = self.executor.as_ref();

        let install = format!("Install it on both hosts: {BLOCKSYNC_URL}");
        self.require_tool(&job, &job.source_host, BLOCKSYNC_TOOL, &install, &cancel)
            .await?;
        self.require_tool(&job, &job.dest_host, BLOCKSYNC_TOOL, &install, &cancel)
            .await?;
        if job.bandwidth_limit.is_some() {
            let hint = "It is needed on the source host to apply a bandwidth limit.";
            self.require_tool(&job, &job.source_host, RATE_LIMIT_TOOL, hint, &cancel)
                .await?;
        }

        let mkdir_cmd = CommandBuilder::mkdir(parent_dir(&job.dest_path))?;
        run_step(executor, &job, &job.dest_host, &mkdir_cmd, &cancel).await?;

        let exists_cmd = CommandBuilder::file_exists(&job.dest_path)?;
        let existing = run_step(executor, &job, &job.dest_host, &exists_cmd, &cancel).await?;
        let full = existing.trim() != "exists";

        let size_cmd = CommandBuilder::file_size(&job.source_path)?;
        let stdout = run_step(executor, &job, &job.source_host, &size_cmd, &cancel).await?;
        let size = parse_size(&job, &stdout)?;

        if full {
            let allocate_cmd = CommandBuilder::allocate(&job.dest_path, size)?;
            run_step(executor, &job, &job.dest_host, &allocate_cmd, &cancel).await?;
        }

        let dest = executor.resolve(&job.dest_host)?;
        let mbps = job.bandwidth_limit.map(|limit| limit.to_megabytes_per_sec());
        let command = CommandBuilder::blocksync(&job.source_path, &dest, &job.dest_path, mbps)?;

        info!(
            "bdsync op={} mode={} {}:{} -> {}:{}",
            job.operation_id,
            if full { "full" } else { "incremental" },
            job.source_host,
            job.source_path,
            job.dest_host,
            job.dest_path
        );
        run_step(executor, &job, &job.source_host, &command, &cancel).await?;

        Ok(size)
    }
}

impl TransferStrategy for BlockSyncStrategy {
    fn method(&self) -> TransferMethod {
        TransferMethod::BlockIncremental
    }

    fn transfer(&self, job: TransferJob, cancel: CancellationToken) -> AsyncTask<CloneResult<u64>> {
        let strategy = self.clone();
        AsyncTaskBuilder::new(async move { strategy.run(job, cancel).await }).spawn()
    }
}
