// ============================================================================
// File: src/orchestrator/mod.rs
// ----------------------------------------------------------------------------
// End-to-end clone and sync operations.
//
// A clone moves through validating -> preparing -> transferring ->
// finalizing. Everything from the staging directory onward is tracked by a
// Transaction, so any failure or cancellation after validation rolls back
// every side effect on both hosts.
// ============================================================================

mod sync;
mod validation;


pub use sync::VmSynchronizer;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::CloneConfig;
use crate::error::{CloneError, CloneResult};
use crate::hypervisor::{Hypervisor, descriptor};
use crate::models::{
    BandwidthLimit, CloneOperation, CloneOptions, CloneSummary, ValidationResult, VmInfo,
};
use crate::security::{CommandBuilder, sanitize_path};
use crate::transaction::{CleanupRegistry, Transaction};
use crate::transfer::{TransferJob, TransferStrategy, create_strategy};
use crate::transport::{RemoteExecutor, cancellable, run_checked};

use validation::{Preflight, preflight};

/// One staged disk: where it lands during the transfer and where commit puts it
#[derive(Debug, Clone)]
struct StagedDisk {
    job: TransferJob,
    final_path: String,
}

/// Device name used in a disk's final file name, `disk{index}` when the
/// domain gives none usable
fn disk_label(index: usize, target: &str) -> String {
    if !target.is_empty() && target.chars().all(|c| c.is_ascii_alphanumeric()) {
        target.to_string()
    } else {
        format!("disk{index}")
    }
}

/// Clone orchestrator
///
/// Owns no connection state of its own; the executor and hypervisor are
/// injected so callers decide how sessions are cached and closed.
#[derive(Debug)]
pub struct VmCloner {
    executor: Arc<dyn RemoteExecutor>,
    hypervisor: Arc<dyn Hypervisor>,
    config: CloneConfig,
    registry: CleanupRegistry,
}

impl VmCloner {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        hypervisor: Arc<dyn Hypervisor>,
        config: CloneConfig,
    ) -> Self {
        Self {
            executor,
            hypervisor,
            config,
            registry: CleanupRegistry::new(),
        }
    }

    /// Custom cleanup handlers available to every transaction this cloner opens
    pub fn with_cleanup_registry(mut self, registry: CleanupRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &CloneConfig {
        &self.config
    }

    /// Options seeded from configuration defaults
    pub fn default_options(&self) -> CloneOptions {
        let mut options = CloneOptions::default().with_parallel(self.config.parallel_transfers.max(1));
        if let Some(limit) = &self.config.bandwidth_limit {
            options = options.with_bandwidth_limit(limit.clone());
        }
        options
    }

    fn default_bandwidth(&self) -> Option<BandwidthLimit> {
        self.config.default_bandwidth().unwrap_or_else(|e| {
            warn!("Ignoring configured bandwidth limit: {e}");
            None
        })
    }

    /// Check prerequisites without touching either host's state
    pub async fn validate(
        &self,
        source_host: &str,
        dest_host: &str,
        vm_name: &str,
        options: CloneOptions,
    ) -> ValidationResult {
        let op = CloneOperation::new(source_host, dest_host, vm_name, options);
        preflight(self.hypervisor.as_ref(), &op, self.default_bandwidth())
            .await
            .result
    }

    /// Clone `vm_name` from `source_host` to `dest_host`
    ///
    /// Always returns a summary; failures are reported in it rather than as
    /// an error. Cancelling `cancel` aborts at the next remote step and rolls
    /// back like any other failure.
    pub async fn clone(
        &self,
        source_host: &str,
        dest_host: &str,
        vm_name: &str,
        options: CloneOptions,
        cancel: CancellationToken,
    ) -> CloneSummary {
        let started = Instant::now();
        let op = CloneOperation::new(source_host, dest_host, vm_name, options);
        info!(
            "Starting clone op={} vm={} target={} src={} dst={}",
            op.id, op.vm_name, op.target_name, op.source_host, op.dest_host
        );

        let pre = preflight(self.hypervisor.as_ref(), &op, self.default_bandwidth()).await;
        let warnings = pre.result.warnings.clone();

        if !pre.result.is_valid() {
            let message = format!("Validation failed: {}", pre.result.errors.join("; "));
            warn!("Clone rejected op={}: {message}", op.id);
            let kind = pre.failure.as_ref().map(CloneError::kind);
            let mut summary = self.summary(&op, started, Ok(0), warnings, Some(pre.result));
            summary.success = false;
            summary.error = Some(message);
            summary.error_kind = kind;
            return summary;
        }

        if op.options.dry_run {
            info!("Dry run completed op={}", op.id);
            let validation = Some(pre.result.clone());
            return self.summary(&op, started, Ok(0), warnings, validation);
        }

        let validation = Some(pre.result.clone());
        let outcome = self.execute(&op, pre, &cancel).await;
        match &outcome {
            Ok(bytes) => info!(
                "Clone completed op={} target={} bytes={bytes} elapsed={:?}",
                op.id,
                op.target_name,
                started.elapsed()
            ),
            Err(e) => error!("Clone failed op={}: {e}", op.id),
        }
        self.summary(&op, started, outcome, warnings, validation)
    }

    fn summary(
        &self,
        op: &CloneOperation,
        started: Instant,
        outcome: CloneResult<u64>,
        warnings: Vec<String>,
        validation: Option<ValidationResult>,
    ) -> CloneSummary {
        let (success, bytes, error, error_kind) = match outcome {
            Ok(bytes) => (true, bytes, None, None),
            Err(e) => (false, 0, Some(e.to_string()), Some(e.kind())),
        };
        CloneSummary {
            operation_id: op.id_string(),
            success,
            vm_name: op.vm_name.clone(),
            new_vm_name: op.target_name.clone(),
            source_host: op.source_host.clone(),
            dest_host: op.dest_host.clone(),
            duration: started.elapsed(),
            bytes_transferred: bytes,
            error,
            error_kind,
            warnings,
            validation,
        }
    }

    async fn execute(
        &self,
        op: &CloneOperation,
        pre: Preflight,
        cancel: &CancellationToken,
    ) -> CloneResult<u64> {
        let op_id = op.id_string();
        let source = pre
            .source
            .ok_or_else(|| CloneError::internal("Validated clone is missing source VM info"))?;

        if pre.target_exists && (op.options.force || op.options.idempotent) {
            info!(
                "Removing existing target vm={} host={} op={op_id}",
                op.target_name, op.dest_host
            );
            cancellable(cancel, &op_id, async {
                self.hypervisor
                    .cleanup_vm(&op.dest_host, &op.target_name)
                    .await?
            })
            .await?;
        }

        let descriptor = cancellable(cancel, &op_id, async {
            self.hypervisor
                .clone_descriptor(
                    &op.source_host,
                    &op.vm_name,
                    &op.target_name,
                    op.options.preserve_mac,
                )
                .await?
        })
        .await?;

        let mut txn = Transaction::begin(
            op_id.clone(),
            "clone",
            self.executor.clone(),
            self.config.audit_dir.clone(),
        )
        .with_registry(self.registry.clone())
        .with_command_timeout(self.config.command_timeout);

        let body = self
            .transactional(&mut txn, op, &source, descriptor, pre.bandwidth, cancel)
            .await;
        txn.finish(body).await
    }

    /// Steps 4 to 8 of a clone; every side effect is registered on `txn`
    async fn transactional(
        &self,
        txn: &mut Transaction,
        op: &CloneOperation,
        source: &VmInfo,
        descriptor_xml: String,
        bandwidth: Option<BandwidthLimit>,
        cancel: &CancellationToken,
    ) -> CloneResult<u64> {
        let op_id = op.id_string();
        let image_dir = self.config.image_dir.trim_end_matches('/');
        let timeout = Some(self.config.command_timeout);

        let staging = sanitize_path(&format!(".vmclone-staging-{op_id}"), image_dir)?;
        txn.register_staging_dir(&op.dest_host, &staging)?;
        let mkdir = CommandBuilder::mkdir(&staging)?;
        cancellable(cancel, &op_id, async {
            run_checked(self.executor.as_ref(), &op.dest_host, &mkdir, timeout).await
        })
        .await?;

        let staged = self.plan(op, source, &staging, image_dir, bandwidth)?;
        for disk in &staged {
            txn.register_temp_disk(&op.dest_host, &disk.job.dest_path, &disk.final_path)?;
        }

        let strategy = create_strategy(op.options.transfer_method, self.executor.clone());
        let jobs: Vec<TransferJob> = staged.iter().map(|d| d.job.clone()).collect();
        let bytes = transfer_all(strategy, jobs, op.options.parallel.max(1), cancel).await?;

        if op.options.verify {
            for disk in &staged {
                self.verify(&disk.job, cancel).await?;
            }
        }

        let mapping: HashMap<String, String> = staged
            .iter()
            .map(|d| (d.job.source_path.clone(), d.final_path.clone()))
            .collect();
        let rewritten = descriptor::rewrite_disk_sources(&descriptor_xml, &mapping);

        // Define runs to completion once started; the VM is registered right after
        if cancel.is_cancelled() {
            return Err(CloneError::Cancelled { operation_id: op_id });
        }
        self.hypervisor
            .create_from_descriptor(&op.dest_host, rewritten)
            .await??;
        txn.register_vm(&op.dest_host, &op.target_name)?;

        txn.commit().await?;
        Ok(bytes)
    }

    /// Staging and final paths for every source disk, in declaration order
    fn plan(
        &self,
        op: &CloneOperation,
        source: &VmInfo,
        staging: &str,
        image_dir: &str,
        bandwidth: Option<BandwidthLimit>,
    ) -> CloneResult<Vec<StagedDisk>> {
        let mut finals = HashSet::new();
        let mut staged = Vec::with_capacity(source.disks.len());

        for (index, disk) in source.disks.iter().enumerate() {
            let basename = disk
                .path
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty() && *name != "." && *name != "..")
                .ok_or_else(|| {
                    CloneError::validation("disk_path", format!("Disk path has no file name: {}", disk.path))
                })?;

            // Two disks may share a basename in different directories
            let device = disk_label(index, &disk.target);
            let final_path =
                sanitize_path(&format!("{}_{device}_{basename}", op.target_name), image_dir)?;
            if !finals.insert(final_path.clone()) {
                return Err(CloneError::validation(
                    "disk_path",
                    format!("Two disks of {} would both be placed at {final_path}", op.vm_name),
                ));
            }
            let staged_path = sanitize_path(&format!("{index}-{basename}"), staging)?;

            let job = TransferJob::new(
                op.id_string(),
                op.source_host.clone(),
                op.dest_host.clone(),
                disk.path.clone(),
                staged_path,
            )
            .with_bandwidth_limit(bandwidth)
            .with_size_hint(disk.size)
            .with_timeout(self.config.transfer_timeout);

            staged.push(StagedDisk { job, final_path });
        }
        Ok(staged)
    }

    /// Compare the staged file's size with the source file's
    async fn verify(&self, job: &TransferJob, cancel: &CancellationToken) -> CloneResult<()> {
        let timeout = Some(self.config.command_timeout);
        let size_on = |host: String, path: String| async move {
            let command = CommandBuilder::file_size(&path)?;
            let output = run_checked(self.executor.as_ref(), &host, &command, timeout).await?;
            output.stdout.trim().parse::<u64>().map_err(|_| CloneError::Integrity {
                path: path.clone(),
                message: format!("Unreadable size on {host}: {:?}", output.stdout.trim()),
            })
        };

        let (expected, actual) = cancellable(cancel, &job.operation_id, async {
            let expected = size_on(job.source_host.clone(), job.source_path.clone()).await?;
            let actual = size_on(job.dest_host.clone(), job.dest_path.clone()).await?;
            Ok::<_, CloneError>((expected, actual))
        })
        .await?;

        if expected != actual {
            return Err(CloneError::Integrity {
                path: job.dest_path.clone(),
                message: format!("size {actual} on {} does not match source size {expected}", job.dest_host),
            });
        }
        info!("Verified {} ({actual} bytes) op={}", job.dest_path, job.operation_id);
        Ok(())
    }
}

/// Run every job, at most `parallel` at a time, and sum the bytes moved
///
/// With `parallel == 1` jobs run strictly in order. Otherwise the first
/// failure cancels the jobs still running and is the error returned.
pub(crate) async fn transfer_all(
    strategy: Arc<dyn TransferStrategy>,
    jobs: Vec<TransferJob>,
    parallel: usize,
    cancel: &CancellationToken,
) -> CloneResult<u64> {
    if parallel <= 1 {
        let mut total = 0u64;
        for job in jobs {
            total += strategy.transfer(job, cancel.clone()).await??;
        }
        return Ok(total);
    }

    let permits = Arc::new(Semaphore::new(parallel));
    let abort = cancel.child_token();
    let mut set = JoinSet::new();

    for job in jobs {
        let strategy = strategy.clone();
        let permits = permits.clone();
        let abort = abort.clone();
        set.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| CloneError::internal(format!("Transfer semaphore closed: {e}")))?;
            strategy.transfer(job, abort).await?
        });
    }

    let mut total = 0u64;
    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match joined.map_err(CloneError::from).and_then(|result| result) {
            Ok(bytes) => total += bytes,
            Err(e) if first_error.is_none() => {
                abort.cancel();
                first_error = Some(e);
            }
            Err(e) => warn!("Additional transfer failure after abort: {e}"),
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(total),
    }
}
