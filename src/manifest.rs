//! # Cross-Run State Manifest
//!
//! A flat identity → entry map keyed by content hash, enabling
//! skip-if-unchanged incremental processing across many independent runs.
//! The manifest is the sole skip/no-skip decision point and is evaluated
//! strictly before admission, so skipped items never consume admission
//! capacity. Single-writer discipline: only the coordinating process
//! mutates it; concurrent coordinators sharing a manifest file are
//! unsupported.

use crate::error::{ConveyorError, Result};
use crate::persist;
use crate::types::WorkItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Success,
    Failed,
}

/// One item's processing record. At most one entry per item identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub content_hash: String,
    pub status: EntryStatus,
    pub output_path: Option<PathBuf>,
    pub last_processed: DateTime<Utc>,
    pub run_id: Uuid,
    pub attempt_count: u32,
    /// Failure reason string, present only for failed entries.
    pub reason: Option<String>,
}

#[derive(Debug)]
pub struct StateManifest {
    path: PathBuf,
    entries: BTreeMap<String, ManifestEntry>,
}

impl StateManifest {
    /// Load the manifest, or start empty when the file has never been
    /// written. A file that fails to parse (after `.bak` fallback) is a
    /// fatal startup error.
    pub fn load(path: &Path) -> Result<Self> {
        let entries: BTreeMap<String, ManifestEntry> = persist::load_with_backup(path)
            .map_err(|detail| ConveyorError::ManifestCorruption {
                path: path.to_path_buf(),
                detail,
            })?
            .unwrap_or_default();

        info!(
            path = %path.display(),
            entries = entries.len(),
            "MANIFEST: loaded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// The sole skip/no-skip decision. True when the item is absent, its
    /// content hash differs from the stored hash, its last attempt did not
    /// succeed, or `force` is set.
    pub fn should_process(&self, item: &WorkItem, force: bool) -> bool {
        if force {
            return true;
        }
        match self.entries.get(&item.id) {
            None => true,
            Some(entry) => {
                entry.content_hash != item.content_hash || entry.status != EntryStatus::Success
            }
        }
    }

    pub fn record_success(
        &mut self,
        item: &WorkItem,
        output_path: Option<PathBuf>,
        run_id: Uuid,
        attempt_count: u32,
    ) {
        debug!(item_id = %item.id, attempt_count, "MANIFEST: recording success");
        self.entries.insert(
            item.id.clone(),
            ManifestEntry {
                content_hash: item.content_hash.clone(),
                status: EntryStatus::Success,
                output_path,
                last_processed: Utc::now(),
                run_id,
                attempt_count,
                reason: None,
            },
        );
    }

    pub fn record_failure(&mut self, item: &WorkItem, run_id: Uuid, reason: &str) {
        debug!(item_id = %item.id, reason, "MANIFEST: recording failure");
        let attempt_count = self
            .entries
            .get(&item.id)
            .map(|e| e.attempt_count + 1)
            .unwrap_or(1);
        self.entries.insert(
            item.id.clone(),
            ManifestEntry {
                content_hash: item.content_hash.clone(),
                status: EntryStatus::Failed,
                output_path: None,
                last_processed: Utc::now(),
                run_id,
                attempt_count,
                reason: Some(reason.to_string()),
            },
        );
    }

    /// Drop entries whose source item no longer exists. Returns the number
    /// removed. Only ever invoked explicitly (`--prune-deleted`).
    pub fn prune(&mut self, existing_items: &BTreeSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, _| existing_items.contains(id));
        let removed = before - self.entries.len();
        if removed > 0 {
            info!(removed, "MANIFEST: pruned entries for deleted items");
        }
        removed
    }

    /// Atomic publish, as for the checkpoint.
    pub fn save(&self) -> Result<()> {
        persist::save_atomic(&self.path, &self.entries, true)?;
        debug!(entries = self.entries.len(), "MANIFEST: saved");
        Ok(())
    }

    pub fn get(&self, item_id: &str) -> Option<&ManifestEntry> {
        self.entries.get(item_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SizeCategory;
    use proptest::prelude::*;

    fn item(id: &str, hash: &str) -> WorkItem {
        WorkItem::new(id, format!("/in/{id}"), 10, SizeCategory::Small, hash)
    }

    fn manifest(dir: &Path) -> StateManifest {
        StateManifest::load(&dir.join("manifest.json")).unwrap()
    }

    #[test]
    fn test_unknown_item_is_processed() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(dir.path());
        assert!(m.should_process(&item("a", "h1"), false));
    }

    #[test]
    fn test_unchanged_successful_item_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        let a = item("a", "h1");
        m.record_success(&a, None, Uuid::new_v4(), 1);
        assert!(!m.should_process(&a, false));
    }

    #[test]
    fn test_hash_change_invalidates_skip() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.record_success(&item("a", "h1"), None, Uuid::new_v4(), 1);
        assert!(m.should_process(&item("a", "h2"), false));
    }

    #[test]
    fn test_force_bypasses_skip() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        let a = item("a", "h1");
        m.record_success(&a, None, Uuid::new_v4(), 1);
        assert!(m.should_process(&a, true));
    }

    #[test]
    fn test_failed_entry_stays_eligible() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        let a = item("a", "h1");
        m.record_failure(&a, Uuid::new_v4(), "timeout");
        assert!(m.should_process(&a, false));
        assert_eq!(m.get("a").unwrap().attempt_count, 1);

        m.record_failure(&a, Uuid::new_v4(), "timeout");
        assert_eq!(m.get("a").unwrap().attempt_count, 2);
    }

    #[test]
    fn test_prune_removes_only_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.record_success(&item("a", "h1"), None, Uuid::new_v4(), 1);
        m.record_success(&item("b", "h2"), None, Uuid::new_v4(), 1);

        let existing = BTreeSet::from(["a".to_string()]);
        assert_eq!(m.prune(&existing), 1);
        assert!(m.get("a").is_some());
        assert!(m.get("b").is_none());
    }

    #[test]
    fn test_save_load_round_trip_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        let mut m = StateManifest::load(&path).unwrap();
        let run = Uuid::new_v4();
        m.record_success(&item("a", "h1"), Some(PathBuf::from("/out/a")), run, 1);
        m.record_failure(&item("b", "h2"), run, "exception");
        m.save().unwrap();

        let reloaded = StateManifest::load(&path).unwrap();
        assert_eq!(reloaded.get("a"), m.get("a"));
        assert_eq!(reloaded.get("b"), m.get("b"));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_corrupt_manifest_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, b"][").unwrap();

        let err = StateManifest::load(&path).unwrap_err();
        assert!(matches!(err, ConveyorError::ManifestCorruption { .. }));
    }

    proptest! {
        /// Untouched entries survive any interleaving of updates to other
        /// items byte-identically across a save/load cycle.
        #[test]
        fn prop_round_trip_preserves_untouched_entries(
            ids in proptest::collection::btree_set("[a-z]{1,8}", 1..20),
            updated_hash in "[0-9a-f]{8}",
        ) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("manifest.json");
            let run = Uuid::new_v4();

            let mut m = StateManifest::load(&path).unwrap();
            for id in &ids {
                m.record_success(&item(id, "base"), None, run, 1);
            }
            m.save().unwrap();

            let mut m = StateManifest::load(&path).unwrap();
            let touched = ids.iter().next().unwrap().clone();
            let before: BTreeMap<String, ManifestEntry> = ids
                .iter()
                .filter(|id| **id != touched)
                .map(|id| (id.clone(), m.get(id).unwrap().clone()))
                .collect();
            m.record_success(&item(&touched, &updated_hash), None, run, 2);
            m.save().unwrap();

            let reloaded = StateManifest::load(&path).unwrap();
            for (id, entry) in &before {
                prop_assert_eq!(reloaded.get(id).unwrap(), entry);
            }
            prop_assert_eq!(
                &reloaded.get(&touched).unwrap().content_hash,
                &updated_hash
            );
        }
    }
}
