// ============================================================================
// File: src/transaction/mod.rs
// ----------------------------------------------------------------------------
// All-or-nothing tracking of side effects across hosts.
//
// Lifecycle:
// - pending -> committed
// - pending -> failed -> rolled_back
// - pending -> rolled_back (scope finished without commit, or the
//   transaction was dropped; the rollback then runs on a background task)
//
// Rollback is best effort: each resource gets one cleanup attempt in reverse
// registration order, and failures are logged, not retried.
// ============================================================================

mod audit;
mod cleanup;
mod resource;


pub use audit::{AuditRecord, audit_path, read_audit};
pub use cleanup::{CleanupContext, CleanupHandler, CleanupRegistry};
pub use resource::{CleanupAction, FINAL_PATH, MOVED, ResourceType, TransactionResource};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{CloneError, CloneResult};
use crate::security::CommandBuilder;
use crate::transport::{RemoteExecutor, run_checked};

use audit::write_audit;
use cleanup::run_cleanup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Committed,
    Failed,
    RolledBack,
}

impl TransactionState {
    /// Committed or rolled back; neither ever changes again
    pub fn is_final(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Tracker for every resource one operation creates
#[derive(Debug)]
pub struct Transaction {
    id: String,
    operation: String,
    executor: Arc<dyn RemoteExecutor>,
    registry: CleanupRegistry,
    audit_dir: PathBuf,
    command_timeout: Option<Duration>,
    resources: Vec<TransactionResource>,
    staging_dir: Option<String>,
    state: TransactionState,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    audited: bool,
    /// Set on the copy a dropped transaction hands to a background rollback
    detached: bool,
}

impl Transaction {
    /// Open a transaction for `operation` (clone, sync, ...)
    pub fn begin(
        id: impl Into<String>,
        operation: impl Into<String>,
        executor: Arc<dyn RemoteExecutor>,
        audit_dir: impl Into<PathBuf>,
    ) -> Self {
        let id = id.into();
        let operation = operation.into();
        info!("Transaction started txn={id} operation={operation}");
        Self {
            id,
            operation,
            executor,
            registry: CleanupRegistry::default(),
            audit_dir: audit_dir.into(),
            command_timeout: None,
            resources: Vec::new(),
            staging_dir: None,
            state: TransactionState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            audited: false,
            detached: false,
        }
    }

    pub fn with_registry(mut self, registry: CleanupRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Bound on each commit and cleanup command
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn resources(&self) -> &[TransactionResource] {
        &self.resources
    }

    pub fn staging_dir(&self) -> Option<&str> {
        self.staging_dir.as_deref()
    }

    fn misuse(&self, message: impl Into<String>) -> CloneError {
        CloneError::Transaction {
            transaction_id: self.id.clone(),
            message: message.into(),
        }
    }

    /// Track a resource; bookkeeping only
    pub fn register(&mut self, resource: TransactionResource) -> CloneResult<()> {
        if self.state != TransactionState::Pending {
            return Err(self.misuse(format!(
                "Cannot register {} in state {:?}",
                resource.resource_id, self.state
            )));
        }
        if let CleanupAction::Custom { handler_id } = &resource.cleanup {
            if !self.registry.contains(handler_id) {
                return Err(self.misuse(format!(
                    "Unknown cleanup handler {handler_id:?} for {}",
                    resource.resource_id
                )));
            }
        }

        debug!(
            "Registered txn={} type={:?} id={} host={}",
            self.id, resource.resource_type, resource.resource_id, resource.host
        );
        self.resources.push(resource);
        Ok(())
    }

    /// Track a staged disk that commit moves to `final_path`
    pub fn register_temp_disk(
        &mut self,
        host: &str,
        temp_path: &str,
        final_path: &str,
    ) -> CloneResult<()> {
        self.register(
            TransactionResource::new(ResourceType::TempDiskFile, temp_path, host)
                .with_metadata(FINAL_PATH, final_path),
        )
    }

    /// Track the staging directory; it is removed on rollback
    pub fn register_staging_dir(&mut self, host: &str, path: &str) -> CloneResult<()> {
        self.register(TransactionResource::new(ResourceType::Directory, path, host))?;
        self.staging_dir = Some(path.to_string());
        Ok(())
    }

    pub fn register_vm(&mut self, host: &str, vm_name: &str) -> CloneResult<()> {
        self.register(TransactionResource::new(ResourceType::VmDefinition, vm_name, host))
    }

    /// Move staged files into place and seal the transaction
    ///
    /// A second call after success does nothing. If a move fails the whole
    /// transaction is rolled back and the move error is returned.
    pub async fn commit(&mut self) -> CloneResult<()> {
        match self.state {
            TransactionState::Committed => {
                info!("Transaction already committed txn={}", self.id);
                return Ok(());
            }
            TransactionState::Failed | TransactionState::RolledBack => {
                return Err(self.misuse(format!("Cannot commit in state {:?}", self.state)));
            }
            TransactionState::Pending => {}
        }

        // Nothing moves until every destination is known to be free
        if let Err(e) = self.check_destinations_free().await {
            error!("Commit refused txn={}: {e}", self.id);
            self.fail(&e);
            self.rollback().await;
            return Err(e);
        }

        for index in 0..self.resources.len() {
            let resource = &self.resources[index];
            let Some(final_path) = resource.pending_move() else {
                continue;
            };
            let host = resource.host.clone();

            let moved = match CommandBuilder::move_file(&resource.resource_id, final_path) {
                Ok(command) => {
                    run_checked(self.executor.as_ref(), &host, &command, self.command_timeout)
                        .await
                }
                Err(e) => Err(e),
            };

            if let Err(e) = moved {
                error!("Commit failed txn={} host={host}: {e}", self.id);
                self.fail(&e);
                self.rollback().await;
                return Err(e);
            }

            self.resources[index]
                .metadata
                .insert(MOVED.to_string(), "true".to_string());
        }

        self.state = TransactionState::Committed;
        self.finished_at = Some(Utc::now());
        info!(
            "Transaction committed txn={} resources={}",
            self.id,
            self.resources.len()
        );
        Ok(())
    }

    async fn check_destinations_free(&self) -> CloneResult<()> {
        for resource in &self.resources {
            let Some(final_path) = resource.pending_move() else {
                continue;
            };
            let command = CommandBuilder::path_absent(final_path)?;
            let output = self
                .executor
                .execute(&resource.host, &command, self.command_timeout)
                .await??;
            if !output.success() {
                return Err(CloneError::Transaction {
                    transaction_id: self.id.clone(),
                    message: format!(
                        "Refusing to overwrite existing file {final_path} on {}",
                        resource.host
                    ),
                });
            }
        }
        Ok(())
    }

    fn fail(&mut self, err: &CloneError) {
        if self.state == TransactionState::Pending {
            self.state = TransactionState::Failed;
        }
        if self.error.is_none() {
            self.error = Some(err.to_string());
        }
    }

    /// Undo every resource, newest first
    ///
    /// Idempotent. Does nothing on a committed transaction.
    pub async fn rollback(&mut self) {
        match self.state {
            TransactionState::RolledBack => {
                debug!("Transaction already rolled back txn={}", self.id);
                return;
            }
            TransactionState::Committed => {
                warn!("Refusing to roll back committed txn={}", self.id);
                return;
            }
            TransactionState::Pending | TransactionState::Failed => {}
        }

        warn!(
            "Rolling back txn={} resources={}",
            self.id,
            self.resources.len()
        );

        for resource in self.resources.iter().rev() {
            let context = CleanupContext {
                transaction_id: self.id.clone(),
                resource: resource.clone(),
                executor: self.executor.clone(),
            };
            match run_cleanup(&self.registry, context, self.command_timeout).await {
                Ok(()) => debug!(
                    "Cleaned up txn={} type={:?} id={}",
                    self.id, resource.resource_type, resource.resource_id
                ),
                Err(e) => error!(
                    "Cleanup failed txn={} type={:?} id={} host={}: {e}",
                    self.id, resource.resource_type, resource.resource_id, resource.host
                ),
            }
        }

        self.state = TransactionState::RolledBack;
        self.finished_at = Some(Utc::now());
    }

    /// Close the scope around an operation body
    ///
    /// An error rolls everything back and is returned unchanged. Success
    /// without a prior commit is treated as a usage error: the transaction
    /// is rolled back and the caller gets a transaction error. The audit
    /// record is written in every case.
    pub async fn finish<T>(mut self, outcome: CloneResult<T>) -> CloneResult<T> {
        let result = match outcome {
            Err(e) => {
                self.fail(&e);
                self.rollback().await;
                Err(e)
            }
            Ok(_) if self.state != TransactionState::Committed => {
                warn!("Transaction scope exited without commit txn={}", self.id);
                let err = self.misuse("Operation finished without committing; rolled back");
                self.fail(&err);
                self.rollback().await;
                Err(err)
            }
            Ok(value) => Ok(value),
        };

        self.persist_audit();
        result
    }

    pub fn audit_record(&self) -> AuditRecord {
        AuditRecord {
            transaction_id: self.id.clone(),
            operation: self.operation.clone(),
            status: self.state,
            started_at: self.started_at,
            finished_at: self.finished_at,
            staging_dir: self.staging_dir.clone(),
            resources: self.resources.clone(),
            error: self.error.clone(),
        }
    }

    fn persist_audit(&mut self) {
        write_audit(&self.audit_dir, &self.audit_record());
        self.audited = true;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.audited {
            return;
        }
        if self.state.is_final() || self.resources.is_empty() {
            self.persist_audit();
            return;
        }

        // A cancelled future (or one cut off by a timeout) ends here; hand
        // the resources to a background rollback while a runtime is around
        if !self.detached {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                warn!(
                    "Transaction dropped before finishing txn={} state={:?}; rolling back {} resources in the background",
                    self.id,
                    self.state,
                    self.resources.len()
                );
                let mut orphan = self.detach();
                handle.spawn(async move {
                    let err = orphan.misuse("Dropped before finishing; rolled back");
                    orphan.fail(&err);
                    orphan.rollback().await;
                    orphan.persist_audit();
                });
                return;
            }
        }

        error!(
            "Transaction dropped before finishing txn={} state={:?}; {} resources may be orphaned",
            self.id,
            self.state,
            self.resources.len()
        );
        self.persist_audit();
    }
}

impl Transaction {
    /// Move everything needed for rollback into a new value, leaving `self` inert
    fn detach(&mut self) -> Transaction {
        self.audited = true;
        Transaction {
            id: self.id.clone(),
            operation: self.operation.clone(),
            executor: self.executor.clone(),
            registry: std::mem::take(&mut self.registry),
            audit_dir: std::mem::take(&mut self.audit_dir),
            command_timeout: self.command_timeout,
            resources: std::mem::take(&mut self.resources),
            staging_dir: self.staging_dir.take(),
            state: self.state,
            started_at: self.started_at,
            finished_at: None,
            error: self.error.take(),
            audited: false,
            detached: true,
        }
    }
}
