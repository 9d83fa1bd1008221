// ============================================================================
// File: src/hypervisor/mod.rs
// ----------------------------------------------------------------------------
// Hypervisor management seam used by the orchestrator.
// ============================================================================

pub mod descriptor;
mod virsh;

pub use virsh::VirshHypervisor;

use std::fmt::Debug;

use crate::AsyncTask;
use crate::error::CloneResult;
use crate::models::{HostResources, VmInfo};

/// VM lifecycle operations on a named host
///
/// The orchestrator is the only caller.
pub trait Hypervisor: Send + Sync + Debug {
    fn vm_exists(&self, host: &str, name: &str) -> AsyncTask<CloneResult<bool>>;

    fn get_vm_info(&self, host: &str, name: &str) -> AsyncTask<CloneResult<VmInfo>>;

    /// Source descriptor renamed to `target_name` with a fresh UUID, and new
    /// MAC addresses unless `preserve_mac`
    fn clone_descriptor(
        &self,
        host: &str,
        source_name: &str,
        target_name: &str,
        preserve_mac: bool,
    ) -> AsyncTask<CloneResult<String>>;

    /// Define a VM from descriptor text
    fn create_from_descriptor(&self, host: &str, descriptor: String) -> AsyncTask<CloneResult<()>>;

    /// Stop if running, undefine, delete its disk files
    fn cleanup_vm(&self, host: &str, name: &str) -> AsyncTask<CloneResult<()>>;

    fn get_host_resources(&self, host: &str) -> AsyncTask<CloneResult<HostResources>>;
}
