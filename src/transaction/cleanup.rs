// ============================================================================
// File: src/transaction/cleanup.rs
// ----------------------------------------------------------------------------
// Rollback actions: built-in cleanup per resource type and a registry of
// named custom handlers.
// ============================================================================

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::debug;

use crate::AsyncTask;
use crate::error::{CloneError, CloneResult};
use crate::security::CommandBuilder;
use crate::transport::{RemoteExecutor, run_checked};

use super::resource::{CleanupAction, ResourceType, TransactionResource};

/// Everything a custom handler gets to work with
#[derive(Debug, Clone)]
pub struct CleanupContext {
    pub transaction_id: String,
    pub resource: TransactionResource,
    pub executor: Arc<dyn RemoteExecutor>,
}

/// Custom rollback action
pub type CleanupHandler = Arc<dyn Fn(CleanupContext) -> AsyncTask<CloneResult<()>> + Send + Sync>;

/// Named custom cleanup handlers, shared between transactions
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    handlers: Arc<RwLock<HashMap<String, CleanupHandler>>>,
}

impl fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("CleanupRegistry").field("handlers", &ids).finish()
    }
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `id`, replacing any previous one
    pub fn register(&self, id: impl Into<String>, handler: CleanupHandler) -> CloneResult<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| CloneError::internal("Cleanup registry lock poisoned"))?;
        handlers.insert(id.into(), handler);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<CleanupHandler> {
        self.handlers.read().ok()?.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }
}

/// Undo one resource
pub(crate) async fn run_cleanup(
    registry: &CleanupRegistry,
    context: CleanupContext,
    timeout: Option<Duration>,
) -> CloneResult<()> {
    match &context.resource.cleanup {
        CleanupAction::Custom { handler_id } => {
            let handler = registry.get(handler_id).ok_or_else(|| CloneError::Transaction {
                transaction_id: context.transaction_id.clone(),
                message: format!("No cleanup handler registered as {handler_id:?}"),
            })?;
            handler(context).await?
        }
        CleanupAction::Default => {
            default_cleanup(context.executor.as_ref(), &context.resource, timeout).await
        }
    }
}

/// Built-in cleanup by resource type
async fn default_cleanup(
    executor: &dyn RemoteExecutor,
    resource: &TransactionResource,
    timeout: Option<Duration>,
) -> CloneResult<()> {
    let host = resource.host.as_str();
    match resource.resource_type {
        ResourceType::DiskFile | ResourceType::TempDiskFile => {
            let command = CommandBuilder::remove_file(resource.current_path())?;
            run_checked(executor, host, &command, timeout).await?;
        }
        ResourceType::Directory => {
            let command = CommandBuilder::remove_directory(&resource.resource_id)?;
            run_checked(executor, host, &command, timeout).await?;
        }
        ResourceType::VmDefinition => {
            // Stop is best effort: the VM may never have been started
            let destroy = CommandBuilder::virsh("destroy", &resource.resource_id, &[])?;
            if let Err(e) = run_checked(executor, host, &destroy, timeout).await {
                debug!("Ignoring destroy failure for vm={}: {e}", resource.resource_id);
            }
            let undefine = CommandBuilder::virsh("undefine", &resource.resource_id, &[])?;
            run_checked(executor, host, &undefine, timeout).await?;
        }
        ResourceType::NetworkInterface => {
            debug!(
                "No built-in cleanup for network interface {} on host={}",
                resource.resource_id, host
            );
        }
    }
    Ok(())
}
