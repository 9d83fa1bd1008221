// ============================================================================
// File: src/transaction/audit.rs
// ----------------------------------------------------------------------------
// Per-transaction JSON audit record for postmortem diagnosis.
// ============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::CloneResult;

use super::TransactionState;
use super::resource::TransactionResource;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub transaction_id: String,
    pub operation: String,
    pub status: TransactionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub staging_dir: Option<String>,
    pub resources: Vec<TransactionResource>,
    pub error: Option<String>,
}

/// `<dir>/vmclone-txn-<id>.json`
pub fn audit_path(dir: &Path, transaction_id: &str) -> PathBuf {
    dir.join(format!("vmclone-txn-{transaction_id}.json"))
}

fn write_atomic(dir: &Path, record: &AuditRecord) -> CloneResult<PathBuf> {
    let path = audit_path(dir, &record.transaction_id);
    let json = serde_json::to_vec_pretty(record)?;

    let io_err = |e: std::io::Error| {
        crate::CloneError::internal(format!("Audit write to {} failed: {e}", path.display()))
    };

    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(&json).map_err(io_err)?;
    file.persist(&path).map_err(|e| io_err(e.error))?;
    Ok(path)
}

/// Persist `record`; failures are logged and otherwise ignored
pub(crate) fn write_audit(dir: &Path, record: &AuditRecord) -> Option<PathBuf> {
    match write_atomic(dir, record) {
        Ok(path) => {
            debug!(
                "Audit record written txn={} path={}",
                record.transaction_id,
                path.display()
            );
            Some(path)
        }
        Err(e) => {
            warn!(
                "Could not write audit record txn={}: {e}",
                record.transaction_id
            );
            None
        }
    }
}

/// Read a record back, e.g. for a sweep of failed operations
pub fn read_audit(path: &Path) -> CloneResult<AuditRecord> {
    let bytes = std::fs::read(path).map_err(|e| {
        crate::CloneError::internal(format!("Failed to read {}: {e}", path.display()))
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}
