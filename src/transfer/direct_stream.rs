// ============================================================================
// File: src/transfer/direct_stream.rs
// ----------------------------------------------------------------------------
// dd on the source piped through ssh into a sparse dd on the destination.
// ============================================================================

use std::sync::Arc;

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::async_task::{AsyncTask, AsyncTaskBuilder};
use crate::error::CloneResult;
use crate::models::TransferMethod;
use crate::security::CommandBuilder;
use crate::transport::RemoteExecutor;

use super::{TransferJob, TransferStrategy, local_copy, parent_dir, parse_size, run_step};

/// Single-pass stream with no delta computation and no temporary files
#[derive(Debug, Clone)]
pub struct DirectStreamStrategy {
    executor: Arc<dyn RemoteExecutor>,
}

impl DirectStreamStrategy {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    async fn run(&self, job: TransferJob, cancel: CancellationToken) -> CloneResult<u64> {
        if job.is_local() {
            return local_copy(self.executor.as_ref(), &job, &cancel).await;
        }
        let executor = self.executor.as_ref();

        let size_cmd = CommandBuilder::file_size(&job.source_path)?;
        let stdout = run_step(executor, &job, &job.source_host, &size_cmd, &cancel).await?;
        let size = parse_size(&job, &stdout)?;
        debug!("Stream source size op={} bytes={}", job.operation_id, size);

        let mkdir_cmd = CommandBuilder::mkdir(parent_dir(&job.dest_path))?;
        run_step(executor, &job, &job.dest_host, &mkdir_cmd, &cancel).await?;

        let dest = executor.resolve(&job.dest_host)?;
        let stream_cmd = CommandBuilder::stream_copy(&job.source_path, &dest, &job.dest_path)?;
        info!(
            "Streaming op={} {}:{} -> {}:{} ({} bytes)",
            job.operation_id, job.source_host, job.source_path, job.dest_host, job.dest_path, size
        );
        run_step(executor, &job, &job.source_host, &stream_cmd, &cancel).await?;

        Ok(size)
    }
}

impl TransferStrategy for DirectStreamStrategy {
    fn method(&self) -> TransferMethod {
        TransferMethod::DirectStream
    }

    fn transfer(&self, job: TransferJob, cancel: CancellationToken) -> AsyncTask<CloneResult<u64>> {
        let strategy = self.clone();
        AsyncTaskBuilder::new(async move { strategy.run(job, cancel).await }).spawn()
    }
}
