// ============================================================================
// File: src/lib.rs
// ----------------------------------------------------------------------------
// vmclone: transactional clone and incremental sync of KVM virtual machines
// between hypervisor hosts over SSH.
//
// Layers, leaf first:
// - security: identifier/path validation and the remote command builders
// - transport: resilient SSH sessions with retry, alias and host-key handling
// - transfer: interchangeable disk copy strategies
// - transaction: all-or-nothing tracking with LIFO rollback and audit records
// - orchestrator: the clone and sync operations
// ============================================================================

pub mod async_task;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod security;
pub mod transaction;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export the public surface
pub use async_task::{AsyncTask, AsyncTaskBuilder};
pub use config::CloneConfig;
pub use error::{CloneError, CloneResult, ErrorKind};
pub use hypervisor::{Hypervisor, VirshHypervisor};
pub use models::{
    BandwidthLimit, CloneOperation, CloneOptions, CloneSummary, SyncOptions, SyncSummary,
    TransferMethod, ValidationResult, VmInfo, VmState,
};
pub use orchestrator::{VmCloner, VmSynchronizer};
pub use transaction::{Transaction, TransactionState};
pub use transfer::{TransferJob, TransferStrategy, create_strategy};
pub use transport::{HostKeyPolicy, RemoteExecutor, SessionManager};

pub use tokio_util::sync::CancellationToken;
