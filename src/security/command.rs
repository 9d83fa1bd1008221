// ============================================================================
// File: src/security/command.rs
// ----------------------------------------------------------------------------
// Fixed set of remote command builders.
//
// Every interpolated value is shell-quoted here. Call sites never build
// command strings by concatenating caller input themselves.
// ============================================================================

use std::path::{Component, Path};

use crate::error::{CloneError, CloneResult};
use crate::models::BandwidthLimit;
use crate::transport::HostEndpoint;

use super::validator::{validate_hostname, validate_snapshot_name, validate_username, validate_vm_name};

/// Block-level diff tool used by the block-incremental strategy
pub const BLOCKSYNC_TOOL: &str = "bdsync";

/// Where to get [`BLOCKSYNC_TOOL`]
pub const BLOCKSYNC_URL: &str = "https://github.com/rolffokkens/bdsync";

/// Pipe rate limiter, needed on the source host only when a limit is set
pub const RATE_LIMIT_TOOL: &str = "pv";

/// virsh subcommands that take a VM name as their first argument
const VM_ACTIONS: &[&str] = &[
    "destroy",
    "dominfo",
    "domstate",
    "domblklist",
    "domiflist",
    "dumpxml",
    "shutdown",
    "snapshot-create-as",
    "snapshot-delete",
    "snapshot-list",
    "start",
    "undefine",
];

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c)
}

/// Quote a value for a POSIX shell
///
/// Values made only of safe characters pass through untouched; anything else
/// is wrapped in single quotes with embedded quotes spliced as `'"'"'`.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(is_shell_safe) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

fn check_path(field: &'static str, path: &str) -> CloneResult<()> {
    if path.is_empty() {
        return Err(CloneError::validation(field, "Path must be a non-empty string"));
    }
    if path.contains('\0') || path.contains('\n') {
        return Err(CloneError::validation(
            field,
            format!("Path contains control characters: {path:?}"),
        ));
    }
    Ok(())
}

fn login(endpoint: &HostEndpoint) -> CloneResult<String> {
    validate_username(&endpoint.username)?;
    validate_hostname(&endpoint.hostname)?;
    Ok(format!("{}@{}", endpoint.username, endpoint.hostname))
}

fn remote_target(endpoint: &HostEndpoint, path: &str) -> CloneResult<String> {
    Ok(format!("{}:{}", login(endpoint)?, path))
}

fn ssh_transport(endpoint: &HostEndpoint) -> String {
    format!("ssh -p {} -o BatchMode=yes", endpoint.port)
}

/// Run a pipeline under bash so a failure anywhere in it fails the command
///
/// The remote login shell may be dash or another POSIX sh without
/// `pipefail`.
fn pipefail(pipeline: &str) -> String {
    format!("bash -o pipefail -c {}", shell_quote(pipeline))
}

/// Secure command building utilities
pub struct CommandBuilder;

impl CommandBuilder {
    /// Sparse-aware local copy on a single host
    pub fn copy(src: &str, dst: &str) -> CloneResult<String> {
        check_path("source_path", src)?;
        check_path("dest_path", dst)?;
        Ok(format!(
            "cp --sparse=always -- {} {}",
            shell_quote(src),
            shell_quote(dst)
        ))
    }

    pub fn move_file(src: &str, dst: &str) -> CloneResult<String> {
        check_path("source_path", src)?;
        check_path("dest_path", dst)?;
        Ok(format!("mv -f -- {} {}", shell_quote(src), shell_quote(dst)))
    }

    pub fn remove_file(path: &str) -> CloneResult<String> {
        check_path("path", path)?;
        Ok(format!("rm -f -- {}", shell_quote(path)))
    }

    /// Recursive delete; refuses relative paths and anything directly under `/`
    pub fn remove_directory(path: &str) -> CloneResult<String> {
        check_path("path", path)?;
        let depth = Path::new(path)
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count();
        if !Path::new(path).is_absolute() || depth < 2 {
            return Err(CloneError::validation(
                "path",
                format!("Refusing to recursively delete {path:?}"),
            ));
        }
        Ok(format!("rm -rf -- {}", shell_quote(path)))
    }

    /// Exits non-zero when anything already exists at `path`
    pub fn path_absent(path: &str) -> CloneResult<String> {
        check_path("path", path)?;
        Ok(format!("test ! -e {}", shell_quote(path)))
    }

    /// Sparse file of `size` bytes
    pub fn allocate(path: &str, size: u64) -> CloneResult<String> {
        check_path("path", path)?;
        Ok(format!("truncate -s {size} -- {}", shell_quote(path)))
    }

    pub fn mkdir(path: &str) -> CloneResult<String> {
        check_path("path", path)?;
        Ok(format!("mkdir -p -- {}", shell_quote(path)))
    }

    /// Byte size of a file
    pub fn file_size(path: &str) -> CloneResult<String> {
        check_path("path", path)?;
        Ok(format!("stat -c %s -- {}", shell_quote(path)))
    }

    /// Prints `exists` or `new`
    pub fn file_exists(path: &str) -> CloneResult<String> {
        check_path("path", path)?;
        Ok(format!(
            "test -f {} && echo exists || echo new",
            shell_quote(path)
        ))
    }

    /// Succeeds when `tool` is on the remote PATH
    pub fn command_exists(tool: &str) -> CloneResult<String> {
        if tool.is_empty()
            || !tool
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(CloneError::validation("tool", format!("Invalid tool name: {tool:?}")));
        }
        Ok(format!("command -v {tool}"))
    }

    /// Free and total bytes of the filesystem holding `path`
    pub fn disk_free(path: &str) -> CloneResult<String> {
        check_path("path", path)?;
        Ok(format!(
            "df -B1 --output=size,avail -- {} | tail -n 1",
            shell_quote(path)
        ))
    }

    /// rsync tuned for sparse disk images, run on the source host
    ///
    /// Archive, sparse, in-place and resumable, with progress output and no
    /// compression. A `None` destination copies within the source host.
    pub fn rsync(
        src: &str,
        dest: Option<&HostEndpoint>,
        dst: &str,
        bandwidth: Option<&BandwidthLimit>,
    ) -> CloneResult<String> {
        check_path("source_path", src)?;
        check_path("dest_path", dst)?;

        let mut parts = vec![
            "rsync".to_string(),
            "-avS".to_string(),
            "--partial".to_string(),
            "--inplace".to_string(),
            "--progress".to_string(),
            "--protect-args".to_string(),
        ];

        if let Some(limit) = bandwidth {
            parts.push(format!("--bwlimit={limit}"));
        }

        match dest {
            Some(endpoint) => {
                parts.push("-e".to_string());
                parts.push(shell_quote(&ssh_transport(endpoint)));
                parts.push(shell_quote(src));
                parts.push(shell_quote(&remote_target(endpoint, dst)?));
            }
            None => {
                parts.push(shell_quote(src));
                parts.push(shell_quote(dst));
            }
        }

        Ok(parts.join(" "))
    }

    /// Block-level sync of `src` into the existing file `dst` on the destination
    ///
    /// bdsync on the source compares block hashes with a `bdsync --server`
    /// reached over ssh and emits a patch holding only the differing blocks.
    /// The patch is piped, rate limited by `pv` when `megabytes_per_sec` is
    /// set, into `bdsync --patch` on the destination.
    pub fn blocksync(
        src: &str,
        dest: &HostEndpoint,
        dst: &str,
        megabytes_per_sec: Option<u64>,
    ) -> CloneResult<String> {
        check_path("source_path", src)?;
        check_path("dest_path", dst)?;
        let ssh = format!("{} {}", ssh_transport(dest), login(dest)?);

        let mut stages = vec![format!(
            "{BLOCKSYNC_TOOL} {} {} {}",
            shell_quote(&format!("{ssh} {BLOCKSYNC_TOOL} --server")),
            shell_quote(src),
            shell_quote(dst)
        )];
        if let Some(mbps) = megabytes_per_sec {
            stages.push(format!("{RATE_LIMIT_TOOL} -q -L {mbps}m"));
        }
        let apply = format!("{BLOCKSYNC_TOOL} --patch={}", shell_quote(dst));
        stages.push(format!("{ssh} {}", shell_quote(&apply)));

        Ok(pipefail(&stages.join(" | ")))
    }

    /// Stream `src` from the source host into `dst` on the destination
    ///
    /// `dd` reads on the source and writes sparse on the destination through
    /// one ssh pipe; the remote half is quoted once for each shell it passes.
    pub fn stream_copy(src: &str, dest: &HostEndpoint, dst: &str) -> CloneResult<String> {
        check_path("source_path", src)?;
        check_path("dest_path", dst)?;
        let login = login(dest)?;

        let remote = format!(
            "dd of={} bs=4M conv=sparse status=none",
            shell_quote(dst)
        );
        Ok(pipefail(&format!(
            "dd if={} bs=4M status=none | {} {} {}",
            shell_quote(src),
            ssh_transport(dest),
            shell_quote(&login),
            shell_quote(&remote)
        )))
    }

    /// virsh action against a named VM
    pub fn virsh(action: &str, vm_name: &str, args: &[&str]) -> CloneResult<String> {
        if !VM_ACTIONS.contains(&action) {
            return Err(CloneError::validation(
                "virsh_action",
                format!("Invalid virsh action: {action}"),
            ));
        }
        validate_vm_name(vm_name)?;

        let mut parts = vec![
            "virsh".to_string(),
            action.to_string(),
            shell_quote(vm_name),
        ];
        parts.extend(args.iter().map(|arg| shell_quote(arg)));
        Ok(parts.join(" "))
    }

    /// Snapshot of a VM, used as a pre-sync checkpoint
    pub fn snapshot_create(vm_name: &str, snapshot_name: &str, description: &str) -> CloneResult<String> {
        validate_snapshot_name(snapshot_name)?;
        Self::virsh(
            "snapshot-create-as",
            vm_name,
            &[snapshot_name, "--description", description],
        )
    }

    /// Define a VM from a descriptor file already on the host
    pub fn virsh_define(descriptor_path: &str) -> CloneResult<String> {
        check_path("descriptor_path", descriptor_path)?;
        Ok(format!("virsh define {}", shell_quote(descriptor_path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> HostEndpoint {
        HostEndpoint {
            alias: "hostB".into(),
            hostname: "10.0.0.5".into(),
            port: 2222,
            username: "deploy".into(),
            identity_file: None,
        }
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/var/lib/disk.qcow2"), "/var/lib/disk.qcow2");
        assert_eq!(shell_quote("my disk"), "'my disk'");
        assert_eq!(shell_quote("a'b"), "'a'\"'\"'b'");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn basic_file_commands_quote_arguments() {
        assert_eq!(
            CommandBuilder::move_file("/tmp/a b", "/img/c").unwrap(),
            "mv -f -- '/tmp/a b' /img/c"
        );
        assert_eq!(
            CommandBuilder::remove_file("/img/x;reboot").unwrap(),
            "rm -f -- '/img/x;reboot'"
        );
        assert_eq!(CommandBuilder::mkdir("/img/stage").unwrap(), "mkdir -p -- /img/stage");
        assert!(CommandBuilder::copy("", "/x").is_err());
    }

    #[test]
    fn remove_directory_refuses_shallow_paths() {
        assert!(CommandBuilder::remove_directory("/").is_err());
        assert!(CommandBuilder::remove_directory("/var").is_err());
        assert!(CommandBuilder::remove_directory("stage").is_err());
        assert_eq!(
            CommandBuilder::remove_directory("/var/stage").unwrap(),
            "rm -rf -- /var/stage"
        );
    }

    #[test]
    fn rsync_is_sparse_resumable_and_uncompressed() {
        let limit = BandwidthLimit::parse("100M").unwrap();
        let cmd = CommandBuilder::rsync(
            "/var/lib/libvirt/images/disk1.qcow2",
            Some(&endpoint()),
            "/stage/disk1.qcow2",
            Some(&limit),
        )
        .unwrap();

        let words: Vec<&str> = cmd.split_whitespace().collect();
        assert_eq!(words[0], "rsync");
        assert!(words.contains(&"-avS"));
        assert!(words.contains(&"--partial"));
        assert!(words.contains(&"--inplace"));
        assert!(words.contains(&"--progress"));
        assert!(words.contains(&"--bwlimit=100M"));
        assert!(!words.contains(&"-z"));
        assert!(!words.contains(&"-avz"));
        assert!(cmd.contains("deploy@10.0.0.5:/stage/disk1.qcow2"));
        assert!(cmd.contains("'ssh -p 2222 -o BatchMode=yes'"));
    }

    #[test]
    fn rsync_rejects_unsafe_remote_user() {
        let mut ep = endpoint();
        ep.username = "x;reboot".into();
        assert!(CommandBuilder::rsync("/a", Some(&ep), "/b", None).is_err());
    }

    #[test]
    fn blocksync_diffs_against_a_remote_server_and_patches_in_place() {
        let cmd = CommandBuilder::blocksync("/img/d.qcow2", &endpoint(), "/stage/d.qcow2", Some(100))
            .unwrap();
        assert!(cmd.starts_with("bash -o pipefail -c "));
        assert!(cmd.contains("bdsync --server"));
        assert!(cmd.contains("bdsync --patch=/stage/d.qcow2"));
        assert!(cmd.contains("pv -q -L 100m"));
        assert!(cmd.contains("ssh -p 2222 -o BatchMode=yes deploy@10.0.0.5"));

        let unlimited = CommandBuilder::blocksync("/img/d.qcow2", &endpoint(), "/stage/d.qcow2", None)
            .unwrap();
        assert!(!unlimited.contains("pv "));
    }

    #[test]
    fn stream_copy_runs_under_bash_pipefail() {
        let cmd = CommandBuilder::stream_copy("/img/a.raw", &endpoint(), "/stage/it's.raw").unwrap();
        assert!(cmd.starts_with("bash -o pipefail -c '"));
        assert!(!cmd.contains("set -o pipefail"));
        assert!(cmd.contains("dd if=/img/a.raw"));
        assert!(cmd.contains("ssh -p 2222 -o BatchMode=yes deploy@10.0.0.5"));
        assert!(cmd.contains("conv=sparse"));
    }

    #[test]
    fn absence_check_and_sparse_allocation() {
        assert_eq!(
            CommandBuilder::path_absent("/img/web01_clone_vda_disk.qcow2").unwrap(),
            "test ! -e /img/web01_clone_vda_disk.qcow2"
        );
        assert_eq!(
            CommandBuilder::allocate("/img/a b", 4096).unwrap(),
            "truncate -s 4096 -- '/img/a b'"
        );
        assert!(CommandBuilder::path_absent("").is_err());
    }

    #[test]
    fn virsh_validates_action_and_name() {
        assert_eq!(
            CommandBuilder::virsh("destroy", "web01", &[]).unwrap(),
            "virsh destroy web01"
        );
        assert!(CommandBuilder::virsh("net-destroy", "web01", &[]).is_err());
        assert!(CommandBuilder::virsh("destroy", "web01;reboot", &[]).is_err());
        assert_eq!(
            CommandBuilder::snapshot_create("web01", "pre-sync", "Pre-sync checkpoint").unwrap(),
            "virsh snapshot-create-as web01 pre-sync --description 'Pre-sync checkpoint'"
        );
        assert!(CommandBuilder::snapshot_create("web01", "bad name", "x").is_err());
    }
}
