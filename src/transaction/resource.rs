// ============================================================================
// File: src/transaction/resource.rs
// ----------------------------------------------------------------------------
// Tracked side effects and their serialisable cleanup actions.
// ============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key naming where a staged file goes on commit
pub const FINAL_PATH: &str = "final_path";

/// Metadata key set once commit has moved a staged file
pub const MOVED: &str = "moved";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    DiskFile,
    TempDiskFile,
    VmDefinition,
    NetworkInterface,
    Directory,
}

/// How a resource is undone on rollback
///
/// `Custom` names a handler in the [`super::CleanupRegistry`]; nothing
/// executable is stored on the resource itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CleanupAction {
    #[default]
    Default,
    Custom { handler_id: String },
}

/// One side effect created during an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResource {
    pub resource_type: ResourceType,
    /// Path or VM name
    pub resource_id: String,
    pub host: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub cleanup: CleanupAction,
}

impl TransactionResource {
    pub fn new(
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
            host: host.into(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            cleanup: CleanupAction::Default,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupAction) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn final_path(&self) -> Option<&str> {
        self.metadata.get(FINAL_PATH).map(String::as_str)
    }

    pub fn is_moved(&self) -> bool {
        self.metadata.get(MOVED).is_some_and(|v| v == "true")
    }

    /// Staged file commit still has to move
    pub(crate) fn pending_move(&self) -> Option<&str> {
        match self.resource_type {
            ResourceType::TempDiskFile if !self.is_moved() => self.final_path(),
            _ => None,
        }
    }

    /// Where the file is now: its final path once moved, else where it was made
    pub fn current_path(&self) -> &str {
        match self.final_path() {
            Some(path) if self.is_moved() => path,
            _ => &self.resource_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moved_temp_disk_reports_final_location() {
        let mut resource = TransactionResource::new(ResourceType::TempDiskFile, "/stage/a", "hostB")
            .with_metadata(FINAL_PATH, "/img/a");
        assert_eq!(resource.pending_move(), Some("/img/a"));
        assert_eq!(resource.current_path(), "/stage/a");

        resource.metadata.insert(MOVED.into(), "true".into());
        assert_eq!(resource.pending_move(), None);
        assert_eq!(resource.current_path(), "/img/a");
    }

    #[test]
    fn cleanup_serialises_as_tagged_variant() {
        let json = serde_json::to_string(&CleanupAction::Custom {
            handler_id: "detach-nic".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"custom","handler_id":"detach-nic"}"#);
        assert_eq!(
            serde_json::to_string(&CleanupAction::Default).unwrap(),
            r#"{"kind":"default"}"#
        );
    }
}
