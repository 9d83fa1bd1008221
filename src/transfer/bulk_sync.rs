// ============================================================================
// File: src/transfer/bulk_sync.rs
// ----------------------------------------------------------------------------
// rsync push from the source host, tuned for large sparse disk images.
// ============================================================================

use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;

use crate::async_task::{AsyncTask, AsyncTaskBuilder};
use crate::error::CloneResult;
use crate::models::TransferMethod;
use crate::security::CommandBuilder;
use crate::transport::RemoteExecutor;

use super::{TransferJob, TransferStrategy, local_copy, run_step};

/// Default strategy
///
/// Archive, sparse, resumable, no compression: disk images rarely compress
/// well enough to pay for the CPU.
#[derive(Debug, Clone)]
pub struct BulkSyncStrategy {
    executor: Arc<dyn RemoteExecutor>,
}

impl BulkSyncStrategy {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    async fn run(&self, job: TransferJob, cancel: CancellationToken) -> CloneResult<u64> {
        if job.is_local() {
            return local_copy(self.executor.as_ref(), &job, &cancel).await;
        }

        let dest = self.executor.resolve(&job.dest_host)?;
        let command = CommandBuilder::rsync(
            &job.source_path,
            Some(&dest),
            &job.dest_path,
            job.bandwidth_limit.as_ref(),
        )?;

        info!(
            "rsync op={} {}:{} -> {}:{}",
            job.operation_id, job.source_host, job.source_path, job.dest_host, job.dest_path
        );
        run_step(self.executor.as_ref(), &job, &job.source_host, &command, &cancel).await?;
        Ok(job.size_hint)
    }
}

impl TransferStrategy for BulkSyncStrategy {
    fn method(&self) -> TransferMethod {
        TransferMethod::BulkSync
    }

    fn transfer(&self, job: TransferJob, cancel: CancellationToken) -> AsyncTask<CloneResult<u64>> {
        let strategy = self.clone();
        AsyncTaskBuilder::new(async move { strategy.run(job, cancel).await }).spawn()
    }
}
