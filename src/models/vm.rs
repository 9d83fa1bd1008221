// ============================================================================
// File: src/models/vm.rs
// ----------------------------------------------------------------------------
// Virtual machine and host facts reported by the hypervisor collaborator.
// ============================================================================

use serde::{Deserialize, Serialize};

/// Power state of a virtual machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Running,
    Stopped,
    Paused,
    Suspended,
    Unknown,
}

impl VmState {
    /// Map a `virsh domstate` / `dominfo` state string
    pub fn from_virsh(state: &str) -> Self {
        match state.trim() {
            "running" | "idle" | "in shutdown" | "blocked" => VmState::Running,
            "shut off" | "crashed" => VmState::Stopped,
            "paused" => VmState::Paused,
            "pmsuspended" => VmState::Suspended,
            _ => VmState::Unknown,
        }
    }

    pub fn is_running(self) -> bool {
        self == VmState::Running
    }
}

/// One disk image attached to a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Image path on the VM's host
    pub path: String,
    /// Apparent size in bytes
    pub size: u64,
    /// Image format (qcow2, raw, ...)
    pub format: String,
    /// Guest device target (vda, sdb, ...)
    pub target: String,
    /// `size` is a placeholder 0 because the image could not be stat'ed
    #[serde(default)]
    pub size_unknown: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub interface: String,
    pub mac_address: String,
    pub network: String,
}

/// Facts about a single VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub state: VmState,
    pub memory_mb: u64,
    pub vcpus: u32,
    /// Disks in declaration order
    pub disks: Vec<DiskInfo>,
    pub networks: Vec<NetworkInfo>,
    pub host: String,
}

impl VmInfo {
    /// Sum of all disk sizes in bytes
    pub fn total_disk_bytes(&self) -> u64 {
        self.disks.iter().map(|d| d.size).sum()
    }
}

/// Capacity snapshot of a hypervisor host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResources {
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub total_disk_bytes: u64,
    pub available_disk_bytes: u64,
    pub cpu_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virsh_states_map_to_vm_state() {
        assert_eq!(VmState::from_virsh("running"), VmState::Running);
        assert_eq!(VmState::from_virsh("shut off\n"), VmState::Stopped);
        assert_eq!(VmState::from_virsh("paused"), VmState::Paused);
        assert_eq!(VmState::from_virsh("weird"), VmState::Unknown);
    }
}
