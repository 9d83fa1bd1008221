// ============================================================================
// File: src/test_support.rs
// ----------------------------------------------------------------------------
// In-memory stand-ins for remote hosts and the hypervisor, for unit tests.
// ============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::async_task::{AsyncTask, AsyncTaskBuilder};
use crate::error::{CloneError, CloneResult};
use crate::hypervisor::Hypervisor;
use crate::models::{DiskInfo, HostResources, VmInfo, VmState};
use crate::transport::{CommandOutput, HostEndpoint, RemoteExecutor};

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    Error(CloneError),
}

#[derive(Debug, Clone)]
struct Rule {
    host: Option<String>,
    pattern: String,
    reply: Reply,
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct ExecutorState {
    rules: Vec<Rule>,
    calls: Vec<(String, String)>,
    uploads: Vec<(String, String, String)>,
    interrupted: Vec<String>,
    closed: usize,
}

/// Scripted [`RemoteExecutor`]
///
/// Records every command. Replies come from the most recently added rule
/// whose pattern is a substring of the command; unmatched commands succeed
/// with empty output.
#[derive(Debug, Clone, Default)]
pub struct FakeExecutor {
    state: Arc<Mutex<ExecutorState>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, host: Option<&str>, pattern: &str, reply: Reply, delay: Option<Duration>) {
        self.state.lock().unwrap().rules.push(Rule {
            host: host.map(str::to_string),
            pattern: pattern.to_string(),
            reply,
            delay,
        });
    }

    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.push(None, pattern, Reply::Output(output), None);
    }

    pub fn respond_on(&self, host: &str, pattern: &str, output: CommandOutput) {
        self.push(Some(host), pattern, Reply::Output(output), None);
    }

    pub fn stdout(&self, pattern: &str, stdout: &str) {
        self.respond(pattern, CommandOutput {
            stdout: stdout.to_string(),
            ..CommandOutput::default()
        });
    }

    pub fn stdout_on(&self, host: &str, pattern: &str, stdout: &str) {
        self.respond_on(host, pattern, CommandOutput {
            stdout: stdout.to_string(),
            ..CommandOutput::default()
        });
    }

    pub fn fail_with_exit(&self, pattern: &str, exit_code: i32, stderr: &str) {
        self.respond(pattern, CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
        });
    }

    pub fn error(&self, pattern: &str, err: CloneError) {
        self.push(None, pattern, Reply::Error(err), None);
    }

    /// Succeed after `delay`; lets tests observe concurrency and cancellation
    pub fn delay(&self, pattern: &str, delay: Duration) {
        self.push(None, pattern, Reply::Output(CommandOutput::default()), Some(delay));
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, c)| c).collect()
    }

    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c)
            .collect()
    }

    /// (host, remote path, contents)
    pub fn uploads(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().uploads.clone()
    }

    /// Commands still running when their cancellation token fired
    pub fn interrupted(&self) -> Vec<String> {
        self.state.lock().unwrap().interrupted.clone()
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }
}

impl RemoteExecutor for FakeExecutor {
    fn execute(
        &self,
        host: &str,
        command: &str,
        _timeout: Option<Duration>,
    ) -> AsyncTask<CloneResult<CommandOutput>> {
        let (reply, delay) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((host.to_string(), command.to_string()));
            state
                .rules
                .iter()
                .rev()
                .find(|r| {
                    command.contains(&r.pattern) && r.host.as_deref().is_none_or(|h| h == host)
                })
                .map(|r| (r.reply.clone(), r.delay))
                .unwrap_or((Reply::Output(CommandOutput::default()), None))
        };

        AsyncTaskBuilder::new(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match reply {
                Reply::Output(output) => Ok(output),
                Reply::Error(err) => Err(err),
            }
        })
        .spawn()
    }

    fn execute_cancellable(
        &self,
        host: &str,
        command: &str,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> AsyncTask<CloneResult<CommandOutput>> {
        let mut task = self.execute(host, command, timeout);
        let state = self.state.clone();
        let command = command.to_string();
        AsyncTaskBuilder::new(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    task.abort();
                    state.lock().unwrap().interrupted.push(command);
                    Err(CloneError::Cancelled { operation_id: "fake".to_string() })
                }
                joined = &mut task => joined?,
            }
        })
        .spawn()
    }

    fn upload(
        &self,
        host: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> AsyncTask<CloneResult<u64>> {
        let contents = std::fs::read_to_string(local_path).unwrap_or_default();
        let size = contents.len() as u64;
        self.state.lock().unwrap().uploads.push((
            host.to_string(),
            remote_path.to_string(),
            contents,
        ));
        AsyncTaskBuilder::new(async move { Ok(size) }).spawn()
    }

    fn resolve(&self, host: &str) -> CloneResult<HostEndpoint> {
        crate::security::validate_hostname(host)?;
        Ok(HostEndpoint {
            alias: host.to_string(),
            hostname: host.to_string(),
            port: 22,
            username: "deploy".to_string(),
            identity_file: None,
        })
    }

    fn close_all(&self) {
        self.state.lock().unwrap().closed += 1;
    }
}

#[derive(Debug, Default)]
struct HypervisorState {
    vms: HashMap<(String, String), VmInfo>,
    resources: HashMap<String, HostResources>,
    created: Vec<(String, String)>,
    cleaned: Vec<(String, String)>,
    fail_create: bool,
    fail_resources: bool,
}

/// In-memory [`Hypervisor`]
///
/// Descriptors are a minimal XML rendering: a `<name>` element and one
/// `<source file='...'/>` per disk.
#[derive(Debug, Clone, Default)]
pub struct FakeHypervisor {
    state: Arc<Mutex<HypervisorState>>,
}

/// A VM with the given disk sizes, paths under `/var/lib/libvirt/images`
pub fn vm_with_disks(name: &str, host: &str, state: VmState, sizes: &[u64]) -> VmInfo {
    let disks = sizes
        .iter()
        .enumerate()
        .map(|(i, size)| DiskInfo {
            path: format!("/var/lib/libvirt/images/{name}-disk{i}.qcow2"),
            size: *size,
            format: "qcow2".to_string(),
            target: format!("vd{}", (b'a' + i as u8) as char),
            size_unknown: false,
        })
        .collect();
    VmInfo {
        name: name.to_string(),
        state,
        memory_mb: 2048,
        vcpus: 2,
        disks,
        networks: Vec::new(),
        host: host.to_string(),
    }
}

pub fn plenty_of_resources() -> HostResources {
    HostResources {
        total_memory_mb: 65536,
        available_memory_mb: 32768,
        total_disk_bytes: 4 << 40,
        available_disk_bytes: 2 << 40,
        cpu_count: 16,
    }
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vm(&self, vm: VmInfo) {
        let key = (vm.host.clone(), vm.name.clone());
        self.state.lock().unwrap().vms.insert(key, vm);
    }

    pub fn set_resources(&self, host: &str, resources: HostResources) {
        self.state
            .lock()
            .unwrap()
            .resources
            .insert(host.to_string(), resources);
    }

    pub fn fail_create(&self) {
        self.state.lock().unwrap().fail_create = true;
    }

    pub fn fail_resources(&self) {
        self.state.lock().unwrap().fail_resources = true;
    }

    pub fn has_vm(&self, host: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .vms
            .contains_key(&(host.to_string(), name.to_string()))
    }

    /// (host, descriptor) per successful define
    pub fn created(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().created.clone()
    }

    /// (host, name) per cleanup call
    pub fn cleaned(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().cleaned.clone()
    }

    fn lookup(&self, host: &str, name: &str) -> CloneResult<VmInfo> {
        self.state
            .lock()
            .unwrap()
            .vms
            .get(&(host.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| CloneError::VmNotFound {
                name: name.to_string(),
                host: host.to_string(),
            })
    }
}

fn ready<T: Send + 'static>(value: CloneResult<T>) -> AsyncTask<CloneResult<T>> {
    AsyncTaskBuilder::new(async move { value }).spawn()
}

fn descriptor_name(descriptor: &str) -> Option<&str> {
    let start = descriptor.find("<name>")? + "<name>".len();
    let end = descriptor[start..].find("</name>")? + start;
    Some(&descriptor[start..end])
}

impl Hypervisor for FakeHypervisor {
    fn vm_exists(&self, host: &str, name: &str) -> AsyncTask<CloneResult<bool>> {
        ready(Ok(self.has_vm(host, name)))
    }

    fn get_vm_info(&self, host: &str, name: &str) -> AsyncTask<CloneResult<VmInfo>> {
        ready(self.lookup(host, name))
    }

    fn clone_descriptor(
        &self,
        host: &str,
        source_name: &str,
        target_name: &str,
        _preserve_mac: bool,
    ) -> AsyncTask<CloneResult<String>> {
        let result = self.lookup(host, source_name).map(|vm| {
            let disks: String = vm
                .disks
                .iter()
                .map(|d| format!("<disk><source file='{}'/></disk>", d.path))
                .collect();
            format!("<domain><name>{target_name}</name><devices>{disks}</devices></domain>")
        });
        ready(result)
    }

    fn create_from_descriptor(&self, host: &str, descriptor: String) -> AsyncTask<CloneResult<()>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return ready(Err(CloneError::hypervisor("define", "virsh define failed")));
        }
        let name = descriptor_name(&descriptor).unwrap_or("unnamed").to_string();
        state.vms.insert(
            (host.to_string(), name.clone()),
            vm_with_disks(&name, host, VmState::Stopped, &[]),
        );
        state.created.push((host.to_string(), descriptor));
        ready(Ok(()))
    }

    fn cleanup_vm(&self, host: &str, name: &str) -> AsyncTask<CloneResult<()>> {
        let mut state = self.state.lock().unwrap();
        state.cleaned.push((host.to_string(), name.to_string()));
        state.vms.remove(&(host.to_string(), name.to_string()));
        ready(Ok(()))
    }

    fn get_host_resources(&self, host: &str) -> AsyncTask<CloneResult<HostResources>> {
        let state = self.state.lock().unwrap();
        if state.fail_resources {
            return ready(Err(CloneError::hypervisor("resources", "df failed")));
        }
        let resources = state
            .resources
            .get(host)
            .cloned()
            .unwrap_or_else(plenty_of_resources);
        ready(Ok(resources))
    }
}
