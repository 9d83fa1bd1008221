// ============================================================================
// File: src/orchestrator/sync.rs
// ----------------------------------------------------------------------------
// Incremental sync of a source VM's disks into an existing target VM.
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CloneConfig;
use crate::error::{CloneError, CloneResult};
use crate::hypervisor::Hypervisor;
use crate::models::{BandwidthLimit, SyncOptions, SyncSummary, VmInfo};
use crate::security::{CommandBuilder, validate_hostname, validate_snapshot_name, validate_vm_name};
use crate::transaction::Transaction;
use crate::transfer::{TransferJob, create_strategy};
use crate::transport::{RemoteExecutor, cancellable, run_checked};

use super::transfer_all;

/// Outcome of the sync body, before it is folded into a summary
#[derive(Debug, Default)]
struct SyncProgress {
    bytes: u64,
    disks: usize,
    checkpoint: Option<String>,
    warnings: Vec<String>,
}

/// Sync orchestrator
///
/// Disks are written in place, so there is nothing to roll back; the
/// optional checkpoint snapshot is the recovery path. A transaction is still
/// opened so every sync leaves an audit record.
#[derive(Debug)]
pub struct VmSynchronizer {
    executor: Arc<dyn RemoteExecutor>,
    hypervisor: Arc<dyn Hypervisor>,
    config: CloneConfig,
}

impl VmSynchronizer {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        hypervisor: Arc<dyn Hypervisor>,
        config: CloneConfig,
    ) -> Self {
        Self {
            executor,
            hypervisor,
            config,
        }
    }

    /// Bring the target VM's disks up to date with the source VM's
    ///
    /// Disks are paired by declaration order. The target must exist and be
    /// stopped. Always returns a summary.
    pub async fn sync(
        &self,
        source_host: &str,
        dest_host: &str,
        vm_name: &str,
        options: SyncOptions,
        cancel: CancellationToken,
    ) -> SyncSummary {
        let started = Instant::now();
        let op_id = Uuid::new_v4().to_string();
        let target_name = options
            .target_name
            .clone()
            .unwrap_or_else(|| vm_name.to_string());
        info!("Starting sync op={op_id} vm={vm_name} target={target_name} src={source_host} dst={dest_host}");

        let mut progress = SyncProgress::default();
        let outcome = self
            .run(
                &op_id,
                source_host,
                dest_host,
                vm_name,
                &target_name,
                &options,
                &cancel,
                &mut progress,
            )
            .await;

        let (success, error, error_kind) = match &outcome {
            Ok(()) => {
                info!(
                    "Sync completed op={op_id} disks={} bytes={}",
                    progress.disks, progress.bytes
                );
                (true, None, None)
            }
            Err(e) => {
                error!("Sync failed op={op_id}: {e}");
                (false, Some(e.to_string()), Some(e.kind()))
            }
        };

        SyncSummary {
            operation_id: op_id,
            success,
            vm_name: vm_name.to_string(),
            target_vm_name: target_name,
            source_host: source_host.to_string(),
            dest_host: dest_host.to_string(),
            duration: started.elapsed(),
            bytes_transferred: if success { progress.bytes } else { 0 },
            disks_synchronized: if success { progress.disks } else { 0 },
            checkpoint: progress.checkpoint,
            error,
            error_kind,
            warnings: progress.warnings,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        op_id: &str,
        source_host: &str,
        dest_host: &str,
        vm_name: &str,
        target_name: &str,
        options: &SyncOptions,
        cancel: &CancellationToken,
        progress: &mut SyncProgress,
    ) -> CloneResult<()> {
        validate_vm_name(vm_name)?;
        validate_vm_name(target_name)?;
        validate_hostname(source_host)?;
        validate_hostname(dest_host)?;
        if source_host == dest_host && vm_name == target_name {
            return Err(CloneError::validation(
                "target_name",
                "Cannot sync a VM into itself",
            ));
        }
        let bandwidth = match options.bandwidth_limit.as_deref() {
            Some(literal) => Some(BandwidthLimit::parse(literal)?),
            None => self.config.default_bandwidth()?,
        };

        let source = self.lookup(source_host, vm_name, cancel, op_id).await?;
        let target = self.lookup(dest_host, target_name, cancel, op_id).await?;
        if target.state.is_running() {
            return Err(CloneError::validation(
                "target_state",
                format!("Target VM '{target_name}' on {dest_host} is running; stop it before syncing"),
            ));
        }

        let jobs = self.pair_disks(op_id, &source, &target, bandwidth, progress);
        if jobs.is_empty() {
            return Err(CloneError::validation(
                "disks",
                format!("No disk pairs to sync between '{vm_name}' and '{target_name}'"),
            ));
        }

        if options.checkpoint {
            progress.checkpoint = self.checkpoint(dest_host, target_name, progress).await;
        }

        let mut txn = Transaction::begin(
            op_id,
            "sync",
            self.executor.clone(),
            self.config.audit_dir.clone(),
        )
        .with_command_timeout(self.config.command_timeout);

        let disks = jobs.len();
        let strategy = create_strategy(options.transfer_method, self.executor.clone());
        let body = match transfer_all(strategy, jobs, 1, cancel).await {
            Ok(bytes) => txn.commit().await.map(|()| bytes),
            Err(e) => Err(e),
        };
        progress.bytes = txn.finish(body).await?;
        progress.disks = disks;
        Ok(())
    }

    async fn lookup(
        &self,
        host: &str,
        name: &str,
        cancel: &CancellationToken,
        op_id: &str,
    ) -> CloneResult<VmInfo> {
        cancellable(cancel, op_id, async {
            if !self.hypervisor.vm_exists(host, name).await?? {
                return Err(CloneError::VmNotFound {
                    name: name.to_string(),
                    host: host.to_string(),
                });
            }
            self.hypervisor.get_vm_info(host, name).await?
        })
        .await
    }

    fn pair_disks(
        &self,
        op_id: &str,
        source: &VmInfo,
        target: &VmInfo,
        bandwidth: Option<BandwidthLimit>,
        progress: &mut SyncProgress,
    ) -> Vec<TransferJob> {
        for extra in source.disks.iter().skip(target.disks.len()) {
            let message = format!(
                "Source disk {} ({}) has no counterpart on target '{}'; skipped",
                extra.path, extra.target, target.name
            );
            warn!("{message}");
            progress.warnings.push(message);
        }

        source
            .disks
            .iter()
            .zip(&target.disks)
            .map(|(src, dst)| {
                TransferJob::new(
                    op_id,
                    source.host.clone(),
                    target.host.clone(),
                    src.path.clone(),
                    dst.path.clone(),
                )
                .with_bandwidth_limit(bandwidth)
                .with_size_hint(src.size)
                .with_timeout(self.config.transfer_timeout)
            })
            .collect()
    }

    /// Snapshot the target before writing; failure is only a warning
    async fn checkpoint(
        &self,
        host: &str,
        vm_name: &str,
        progress: &mut SyncProgress,
    ) -> Option<String> {
        let name = format!("{vm_name}_sync_checkpoint_{}", Utc::now().timestamp());
        let created = match validate_snapshot_name(&name)
            .and_then(|_| CommandBuilder::snapshot_create(vm_name, &name, "Pre-sync checkpoint"))
        {
            Ok(command) => {
                run_checked(
                    self.executor.as_ref(),
                    host,
                    &command,
                    Some(self.config.command_timeout),
                )
                .await
            }
            Err(e) => Err(e),
        };

        match created {
            Ok(_) => {
                info!("Created checkpoint {name} for vm={vm_name} host={host}");
                Some(name)
            }
            Err(e) => {
                let message = format!("Failed to create checkpoint for '{vm_name}': {e}");
                warn!("{message}");
                progress.warnings.push(message);
                None
            }
        }
    }
}
