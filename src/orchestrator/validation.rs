// ============================================================================
// File: src/orchestrator/validation.rs
// ----------------------------------------------------------------------------
// Prerequisite checks run before any side effect of a clone.
// ============================================================================

use log::{debug, warn};

use crate::error::CloneError;
use crate::hypervisor::Hypervisor;
use crate::models::{BandwidthLimit, CloneOperation, ValidationResult, VmInfo};
use crate::security::{validate_hostname, validate_vm_name};

/// Destination must hold required bytes times this, in percent
const DISK_MARGIN_PCT: u128 = 115;
/// Below required bytes times this, in percent, the clone proceeds with a warning
const DISK_WARN_PCT: u128 = 120;

/// Everything the clone flow learns while validating
#[derive(Debug, Default)]
pub(crate) struct Preflight {
    pub result: ValidationResult,
    pub source: Option<VmInfo>,
    pub target_exists: bool,
    pub bandwidth: Option<BandwidthLimit>,
    /// First hard failure, kept typed for the summary's error kind
    pub failure: Option<CloneError>,
}

impl Preflight {
    fn reject(&mut self, err: CloneError) {
        self.result.error(err.to_string());
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.result.warn(message);
    }
}

#[derive(Debug)]
pub(crate) enum DiskCheck {
    Ample,
    Tight(String),
    Insufficient(CloneError),
}

/// Compare free space on the destination with what the disks need
pub(crate) fn check_disk_space(required: u64, available: u64) -> DiskCheck {
    let with_margin = (required as u128 * DISK_MARGIN_PCT).div_ceil(100);
    if with_margin > available as u128 {
        return DiskCheck::Insufficient(CloneError::InsufficientResources {
            resource: "disk",
            message: format!(
                "need {with_margin} bytes ({required} plus 15% margin), {available} available"
            ),
        });
    }

    let comfortable = (required as u128 * DISK_WARN_PCT).div_ceil(100);
    if (available as u128) < comfortable {
        return DiskCheck::Tight(format!(
            "Low disk space on destination: {available} bytes available for {required} bytes of disks"
        ));
    }
    DiskCheck::Ample
}

/// Run every clone prerequisite check
///
/// Never fails itself: lookup errors become validation errors, and a
/// resource query failure becomes a warning.
pub(crate) async fn preflight(
    hypervisor: &dyn Hypervisor,
    op: &CloneOperation,
    default_bandwidth: Option<BandwidthLimit>,
) -> Preflight {
    let mut pre = Preflight::default();

    for err in [
        validate_vm_name(&op.vm_name).err(),
        validate_vm_name(&op.target_name).err(),
        validate_hostname(&op.source_host).err(),
        validate_hostname(&op.dest_host).err(),
    ]
    .into_iter()
    .flatten()
    {
        pre.reject(err);
    }

    pre.bandwidth = match op.options.bandwidth_limit.as_deref() {
        Some(literal) => match BandwidthLimit::parse(literal) {
            Ok(limit) => Some(limit),
            Err(e) => {
                pre.reject(e);
                None
            }
        },
        None => default_bandwidth,
    };

    if op.options.parallel == 0 {
        pre.reject(CloneError::validation(
            "parallel",
            "Parallel transfers must be at least 1",
        ));
    }

    if op.source_host == op.dest_host && op.vm_name == op.target_name {
        pre.reject(CloneError::validation(
            "new_name",
            "Target name must differ from the source VM when cloning within one host",
        ));
    }

    // Nothing below is safe to run with unvalidated identifiers
    if !pre.result.is_valid() {
        return pre;
    }

    check_source(hypervisor, op, &mut pre).await;
    check_destination(hypervisor, op, &mut pre).await;
    pre
}

async fn check_source(hypervisor: &dyn Hypervisor, op: &CloneOperation, pre: &mut Preflight) {
    let exists = match hypervisor.vm_exists(&op.source_host, &op.vm_name).await {
        Ok(Ok(exists)) => exists,
        Ok(Err(e)) => return pre.reject(e),
        Err(e) => return pre.reject(e.into()),
    };
    if !exists {
        return pre.reject(CloneError::VmNotFound {
            name: op.vm_name.clone(),
            host: op.source_host.clone(),
        });
    }

    let info = match hypervisor.get_vm_info(&op.source_host, &op.vm_name).await {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => return pre.reject(e),
        Err(e) => return pre.reject(e.into()),
    };

    if info.state.is_running() {
        pre.warn(format!(
            "VM '{}' is currently running. Consider stopping it before cloning.",
            op.vm_name
        ));
    }
    if info.disks.is_empty() {
        pre.warn(format!("VM '{}' has no file-backed disks", op.vm_name));
    }
    for disk in info.disks.iter().filter(|d| d.size_unknown) {
        pre.warn(format!(
            "Size of disk {} could not be read; the disk space check may undercount",
            disk.path
        ));
    }
    debug!(
        "Source ok vm={} host={} disks={} bytes={}",
        info.name,
        op.source_host,
        info.disks.len(),
        info.total_disk_bytes()
    );
    pre.source = Some(info);
}

async fn check_destination(hypervisor: &dyn Hypervisor, op: &CloneOperation, pre: &mut Preflight) {
    match hypervisor.vm_exists(&op.dest_host, &op.target_name).await {
        Ok(Ok(true)) => {
            pre.target_exists = true;
            if op.options.force || op.options.idempotent {
                pre.warn(format!(
                    "VM '{}' will be overwritten on destination host {}",
                    op.target_name, op.dest_host
                ));
            } else {
                pre.reject(CloneError::VmExists {
                    name: op.target_name.clone(),
                    host: op.dest_host.clone(),
                });
            }
        }
        Ok(Ok(false)) => {}
        Ok(Err(e)) => pre.reject(e),
        Err(e) => pre.reject(e.into()),
    }

    let resources = match hypervisor.get_host_resources(&op.dest_host).await {
        Ok(Ok(resources)) => resources,
        Ok(Err(e)) => return pre.warn(format!("Could not check destination resources: {e}")),
        Err(e) => return pre.warn(format!("Could not check destination resources: {e}")),
    };

    let Some(source) = pre.source.as_ref() else {
        return;
    };
    let (required, memory_mb, vcpus) = (source.total_disk_bytes(), source.memory_mb, source.vcpus);

    match check_disk_space(required, resources.available_disk_bytes) {
        DiskCheck::Ample => {}
        DiskCheck::Tight(message) => pre.warn(message),
        DiskCheck::Insufficient(err) => pre.reject(err),
    }

    if resources.available_memory_mb < memory_mb {
        pre.warn(format!(
            "Destination has {} MB memory available, VM is configured for {memory_mb} MB",
            resources.available_memory_mb
        ));
    }
    if resources.cpu_count < vcpus {
        pre.warn(format!(
            "Destination has {} CPUs, VM is configured for {vcpus} vCPUs",
            resources.cpu_count
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_margin_boundaries() {
        assert!(matches!(check_disk_space(100, 100), DiskCheck::Insufficient(_)));
        assert!(matches!(check_disk_space(100, 114), DiskCheck::Insufficient(_)));
        assert!(matches!(check_disk_space(100, 115), DiskCheck::Tight(_)));
        assert!(matches!(check_disk_space(100, 119), DiskCheck::Tight(_)));
        assert!(matches!(check_disk_space(100, 120), DiskCheck::Ample));
        assert!(matches!(check_disk_space(100, 140), DiskCheck::Ample));
        assert!(matches!(check_disk_space(0, 0), DiskCheck::Ample));
    }

    #[test]
    fn insufficient_disk_is_a_resource_error() {
        let DiskCheck::Insufficient(err) = check_disk_space(3 << 30, 1 << 30) else {
            panic!("expected insufficient");
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::InsufficientResources);
        assert!(err.to_string().contains("15% margin"));
    }
}
