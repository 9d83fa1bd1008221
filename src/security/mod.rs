// ============================================================================
// File: src/security/mod.rs
// ----------------------------------------------------------------------------
// Input validation and remote command construction.
// ============================================================================

mod command;
mod validator;

pub use command::{BLOCKSYNC_TOOL, BLOCKSYNC_URL, CommandBuilder, RATE_LIMIT_TOOL, shell_quote};
pub use validator::{
    expand_home, path_to_str, sanitize_path, validate_hostname, validate_snapshot_name,
    validate_ssh_key_path, validate_username, validate_vm_name,
};
