// ============================================================================
// File: src/models/mod.rs
// ----------------------------------------------------------------------------
// Request, option, and result types for clone and sync operations.
// ============================================================================

mod bandwidth;
mod vm;

pub use bandwidth::{BandwidthLimit, BandwidthUnit};
pub use vm::{DiskInfo, HostResources, NetworkInfo, VmInfo, VmState};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Disk copy strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    /// rsync tuned for sparse images
    #[default]
    BulkSync,
    /// dd piped over ssh, no intermediate files
    DirectStream,
    /// block-level diff, for repeated syncs of a mostly unchanged disk
    BlockIncremental,
}

impl TransferMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferMethod::BulkSync => "bulk_sync",
            TransferMethod::DirectStream => "direct_stream",
            TransferMethod::BlockIncremental => "block_incremental",
        }
    }
}

/// Options for a clone operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneOptions {
    /// Target VM name; defaults to `<name>_clone`
    pub new_name: Option<String>,
    /// Overwrite an existing target VM
    pub force: bool,
    /// Remove a conflicting target VM instead of failing
    pub idempotent: bool,
    /// Validate only
    pub dry_run: bool,
    /// Keep the source's MAC addresses
    pub preserve_mac: bool,
    /// Throttle literal such as `100M`
    pub bandwidth_limit: Option<String>,
    pub transfer_method: TransferMethod,
    /// Compare staged file sizes with the source after each transfer
    pub verify: bool,
    /// Upper bound on concurrent disk transfers
    pub parallel: usize,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            new_name: None,
            force: false,
            idempotent: false,
            dry_run: false,
            preserve_mac: false,
            bandwidth_limit: None,
            transfer_method: TransferMethod::BulkSync,
            verify: false,
            parallel: 1,
        }
    }
}

impl CloneOptions {
    pub fn with_new_name(mut self, name: impl Into<String>) -> Self {
        self.new_name = Some(name.into());
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_preserve_mac(mut self, preserve_mac: bool) -> Self {
        self.preserve_mac = preserve_mac;
        self
    }

    pub fn with_bandwidth_limit(mut self, limit: impl Into<String>) -> Self {
        self.bandwidth_limit = Some(limit.into());
        self
    }

    pub fn with_transfer_method(mut self, method: TransferMethod) -> Self {
        self.transfer_method = method;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Options for an incremental sync into an existing VM
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Target VM name on the destination; defaults to the source name
    pub target_name: Option<String>,
    /// Take a snapshot of the target before writing to it
    pub checkpoint: bool,
    pub bandwidth_limit: Option<String>,
    pub transfer_method: TransferMethod,
}

impl SyncOptions {
    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = Some(name.into());
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: bool) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_bandwidth_limit(mut self, limit: impl Into<String>) -> Self {
        self.bandwidth_limit = Some(limit.into());
        self
    }

    pub fn with_transfer_method(mut self, method: TransferMethod) -> Self {
        self.transfer_method = method;
        self
    }
}

/// One clone request, fixed at call entry
#[derive(Debug, Clone, Serialize)]
pub struct CloneOperation {
    pub id: Uuid,
    pub source_host: String,
    pub dest_host: String,
    pub vm_name: String,
    pub target_name: String,
    pub options: CloneOptions,
    pub started_at: DateTime<Utc>,
}

impl CloneOperation {
    pub fn new(
        source_host: impl Into<String>,
        dest_host: impl Into<String>,
        vm_name: impl Into<String>,
        options: CloneOptions,
    ) -> Self {
        let vm_name = vm_name.into();
        let target_name = options
            .new_name
            .clone()
            .unwrap_or_else(|| format!("{vm_name}_clone"));

        Self {
            id: Uuid::new_v4(),
            source_host: source_host.into(),
            dest_host: dest_host.into(),
            vm_name,
            target_name,
            options,
            started_at: Utc::now(),
        }
    }

    pub fn id_string(&self) -> String {
        self.id.to_string()
    }
}

/// Outcome of prerequisite checks
///
/// Valid exactly when `errors` is empty; warnings never affect validity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Result of a clone call
#[derive(Debug, Clone, Serialize)]
pub struct CloneSummary {
    pub operation_id: String,
    pub success: bool,
    pub vm_name: String,
    pub new_vm_name: String,
    pub source_host: String,
    pub dest_host: String,
    pub duration: Duration,
    pub bytes_transferred: u64,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub warnings: Vec<String>,
    pub validation: Option<ValidationResult>,
}

/// Result of a sync call
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub operation_id: String,
    pub success: bool,
    pub vm_name: String,
    pub target_vm_name: String,
    pub source_host: String,
    pub dest_host: String,
    pub duration: Duration,
    pub bytes_transferred: u64,
    pub disks_synchronized: usize,
    pub checkpoint: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_name_defaults_to_clone_suffix() {
        let op = CloneOperation::new("hostA", "hostB", "web01", CloneOptions::default());
        assert_eq!(op.target_name, "web01_clone");

        let op = CloneOperation::new(
            "hostA",
            "hostB",
            "web01",
            CloneOptions::default().with_new_name("web02"),
        );
        assert_eq!(op.target_name, "web02");
    }

    #[test]
    fn validity_tracks_errors_only() {
        let mut result = ValidationResult::new();
        result.warn("VM is running");
        assert!(result.is_valid());
        result.error("not enough disk");
        assert!(!result.is_valid());
    }

    #[test]
    fn default_options_are_sequential_bulk_sync() {
        let options = CloneOptions::default();
        assert_eq!(options.transfer_method, TransferMethod::BulkSync);
        assert_eq!(options.parallel, 1);
        assert!(!options.idempotent);
    }
}
