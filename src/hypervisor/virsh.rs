// ============================================================================
// File: src/hypervisor/virsh.rs
// ----------------------------------------------------------------------------
// Hypervisor implementation driving the virsh CLI over a RemoteExecutor.
// ============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::async_task::{AsyncTask, AsyncTaskBuilder};
use crate::error::{CloneError, CloneResult};
use crate::models::{DiskInfo, HostResources, NetworkInfo, VmInfo, VmState};
use crate::security::{CommandBuilder, validate_vm_name};
use crate::transport::{CommandOutput, RemoteExecutor, run_checked};

use super::Hypervisor;
use super::descriptor;

const MEMINFO_CMD: &str = "cat /proc/meminfo";
const NPROC_CMD: &str = "nproc";

/// virsh over SSH
#[derive(Debug, Clone)]
pub struct VirshHypervisor {
    executor: Arc<dyn RemoteExecutor>,
    image_dir: String,
    command_timeout: Option<Duration>,
}

impl VirshHypervisor {
    pub fn new(executor: Arc<dyn RemoteExecutor>, image_dir: impl Into<String>) -> Self {
        Self {
            executor,
            image_dir: image_dir.into(),
            command_timeout: None,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    async fn run(&self, operation: &str, host: &str, command: &str) -> CloneResult<CommandOutput> {
        run_checked(self.executor.as_ref(), host, command, self.command_timeout)
            .await
            .map_err(|e| match e {
                CloneError::RemoteCommand { stderr, .. } => {
                    CloneError::hypervisor(operation, format!("{host}: {stderr}"))
                }
                other => other,
            })
    }

    async fn exists(&self, host: &str, name: &str) -> CloneResult<bool> {
        validate_vm_name(name)?;
        let command = CommandBuilder::virsh("dominfo", name, &[])?;
        let output = self
            .executor
            .execute(host, &command, self.command_timeout)
            .await??;
        Ok(output.success())
    }

    async fn dumpxml(&self, host: &str, name: &str) -> CloneResult<String> {
        let command = CommandBuilder::virsh("dumpxml", name, &[])?;
        Ok(self.run("dumpxml", host, &command).await?.stdout)
    }

    async fn info(&self, host: &str, name: &str) -> CloneResult<VmInfo> {
        if !self.exists(host, name).await? {
            return Err(CloneError::VmNotFound {
                name: name.to_string(),
                host: host.to_string(),
            });
        }

        let dominfo = self
            .run("dominfo", host, &CommandBuilder::virsh("dominfo", name, &[])?)
            .await?
            .stdout;
        let fields = parse_colon_fields(&dominfo);

        let xml = self.dumpxml(host, name).await?;
        let mut disks = Vec::new();
        for disk in descriptor::disks(&xml) {
            let size_cmd = CommandBuilder::file_size(&disk.source)?;
            let size = match self.run("stat", host, &size_cmd).await {
                Ok(out) => out.stdout.trim().parse::<u64>().map_err(|_| {
                    format!("unexpected stat output {:?}", out.stdout.trim())
                }),
                Err(e) => Err(e.to_string()),
            };
            if let Err(reason) = &size {
                warn!("Could not size disk {} on host={host}: {reason}", disk.source);
            }
            disks.push(DiskInfo {
                path: disk.source,
                size: size.as_ref().copied().unwrap_or(0),
                format: disk.format,
                target: disk.target,
                size_unknown: size.is_err(),
            });
        }

        let iflist = self
            .run("domiflist", host, &CommandBuilder::virsh("domiflist", name, &[])?)
            .await?
            .stdout;

        Ok(VmInfo {
            name: name.to_string(),
            state: fields
                .get("State")
                .map(|s| VmState::from_virsh(s))
                .unwrap_or(VmState::Unknown),
            memory_mb: fields
                .get("Max memory")
                .and_then(|m| parse_kib(m))
                .map(|kib| kib / 1024)
                .unwrap_or(0),
            vcpus: fields
                .get("CPU(s)")
                .and_then(|c| c.parse().ok())
                .unwrap_or(0),
            disks,
            networks: parse_iflist(&iflist),
            host: host.to_string(),
        })
    }

    async fn clone_xml(
        &self,
        host: &str,
        source_name: &str,
        target_name: &str,
        preserve_mac: bool,
    ) -> CloneResult<String> {
        validate_vm_name(target_name)?;
        let xml = self.dumpxml(host, source_name).await?;
        let renamed = descriptor::rename(&xml, target_name)?;
        Ok(if preserve_mac {
            renamed
        } else {
            descriptor::randomize_macs(&renamed)
        })
    }

    async fn define(&self, host: &str, xml: String) -> CloneResult<()> {
        let name = descriptor::domain_name(&xml).unwrap_or_default();
        validate_vm_name(&name)?;

        let mut local = tempfile::NamedTempFile::new()
            .map_err(|e| CloneError::internal(format!("Failed to create temp file: {e}")))?;
        local
            .write_all(xml.as_bytes())
            .map_err(|e| CloneError::internal(format!("Failed to write descriptor: {e}")))?;

        let remote_path = format!("/tmp/vmclone-{}.xml", Uuid::new_v4());
        self.executor
            .upload(host, local.path(), &remote_path)
            .await??;

        let defined = self
            .run("define", host, &CommandBuilder::virsh_define(&remote_path)?)
            .await;

        let remove = CommandBuilder::remove_file(&remote_path)?;
        if let Err(e) = run_checked(self.executor.as_ref(), host, &remove, self.command_timeout).await {
            debug!("Could not remove {remote_path} on host={host}: {e}");
        }

        defined?;
        info!("Defined vm={name} on host={host}");
        Ok(())
    }

    async fn cleanup(&self, host: &str, name: &str) -> CloneResult<()> {
        if !self.exists(host, name).await? {
            debug!("Nothing to clean up, vm={name} not on host={host}");
            return Ok(());
        }

        let disk_paths: Vec<String> = match self.dumpxml(host, name).await {
            Ok(xml) => descriptor::disks(&xml).into_iter().map(|d| d.source).collect(),
            Err(e) => {
                warn!("Could not list disks of vm={name} on host={host}: {e}");
                Vec::new()
            }
        };

        let destroy = CommandBuilder::virsh("destroy", name, &[])?;
        if let Err(e) = self.run("destroy", host, &destroy).await {
            debug!("destroy vm={name} host={host}: {e}");
        }

        self.run("undefine", host, &CommandBuilder::virsh("undefine", name, &[])?)
            .await?;
        info!("Undefined vm={name} on host={host}");

        for path in disk_paths {
            let removed = match CommandBuilder::remove_file(&path) {
                Ok(cmd) => run_checked(self.executor.as_ref(), host, &cmd, self.command_timeout)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => info!("Deleted disk {path} on host={host}"),
                Err(e) => warn!("Failed to delete disk {path} on host={host}: {e}"),
            }
        }
        Ok(())
    }

    async fn resources(&self, host: &str) -> CloneResult<HostResources> {
        let meminfo = self.run("resources", host, MEMINFO_CMD).await?.stdout;
        let mem = parse_colon_fields(&meminfo);
        let kib = |key: &str| mem.get(key).and_then(|v| parse_kib(v)).unwrap_or(0);

        let df = self
            .run("resources", host, &CommandBuilder::disk_free(&self.image_dir)?)
            .await?
            .stdout;
        let (total_disk_bytes, available_disk_bytes) = parse_df(&df).ok_or_else(|| {
            CloneError::hypervisor("resources", format!("Unexpected df output: {:?}", df.trim()))
        })?;

        let cpu_count = self
            .run("resources", host, NPROC_CMD)
            .await?
            .stdout
            .trim()
            .parse()
            .unwrap_or(0);

        Ok(HostResources {
            total_memory_mb: kib("MemTotal") / 1024,
            available_memory_mb: kib("MemAvailable") / 1024,
            total_disk_bytes,
            available_disk_bytes,
            cpu_count,
        })
    }
}

/// `Key:   value` lines
fn parse_colon_fields(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// `2097152 KiB` / `2097152 kB`
fn parse_kib(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}

/// Last line of `df -B1 --output=size,avail`
fn parse_df(text: &str) -> Option<(u64, u64)> {
    let line = text.lines().rev().find(|l| !l.trim().is_empty())?;
    let mut cols = line.split_whitespace();
    let size = cols.next()?.parse().ok()?;
    let avail = cols.next()?.parse().ok()?;
    Some((size, avail))
}

/// Rows of `virsh domiflist`
fn parse_iflist(text: &str) -> Vec<NetworkInfo> {
    text.lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 {
                return None;
            }
            Some(NetworkInfo {
                interface: cols[0].to_string(),
                network: cols[2].to_string(),
                mac_address: cols[4].to_string(),
            })
        })
        .collect()
}

impl Hypervisor for VirshHypervisor {
    fn vm_exists(&self, host: &str, name: &str) -> AsyncTask<CloneResult<bool>> {
        let this = self.clone();
        let (host, name) = (host.to_string(), name.to_string());
        AsyncTaskBuilder::new(async move { this.exists(&host, &name).await }).spawn()
    }

    fn get_vm_info(&self, host: &str, name: &str) -> AsyncTask<CloneResult<VmInfo>> {
        let this = self.clone();
        let (host, name) = (host.to_string(), name.to_string());
        AsyncTaskBuilder::new(async move { this.info(&host, &name).await }).spawn()
    }

    fn clone_descriptor(
        &self,
        host: &str,
        source_name: &str,
        target_name: &str,
        preserve_mac: bool,
    ) -> AsyncTask<CloneResult<String>> {
        let this = self.clone();
        let host = host.to_string();
        let source = source_name.to_string();
        let target = target_name.to_string();
        AsyncTaskBuilder::new(async move {
            this.clone_xml(&host, &source, &target, preserve_mac).await
        })
        .spawn()
    }

    fn create_from_descriptor(&self, host: &str, descriptor: String) -> AsyncTask<CloneResult<()>> {
        let this = self.clone();
        let host = host.to_string();
        AsyncTaskBuilder::new(async move { this.define(&host, descriptor).await }).spawn()
    }

    fn cleanup_vm(&self, host: &str, name: &str) -> AsyncTask<CloneResult<()>> {
        let this = self.clone();
        let (host, name) = (host.to_string(), name.to_string());
        AsyncTaskBuilder::new(async move { this.cleanup(&host, &name).await }).spawn()
    }

    fn get_host_resources(&self, host: &str) -> AsyncTask<CloneResult<HostResources>> {
        let this = self.clone();
        let host = host.to_string();
        AsyncTaskBuilder::new(async move { this.resources(&host).await }).spawn()
    }
}
