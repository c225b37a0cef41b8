//! In-memory metadata store.

use super::{MetadataStore, VersionCommit};
use crate::Result;
use crate::models::{FileHead, FileId, FileVersion};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct State {
    versions: HashMap<FileId, BTreeMap<u32, FileVersion>>,
    counters: HashMap<FileId, u32>,
    heads: HashMap<FileId, FileHead>,
}

/// Metadata store held in process memory.
///
/// Every operation runs under one mutex, which makes `commit_version`
/// trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    state: Mutex<State>,
}

impl InMemoryMetadataStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn commit_version(&self, commit: VersionCommit) -> Result<Option<FileVersion>> {
        let mut state = self.lock();
        let file_id = commit.version.file_id.clone();

        if commit.skip_if_head_matches
            && state
                .heads
                .get(&file_id)
                .is_some_and(|head| head.content_hash == commit.version.content_hash)
        {
            return Ok(None);
        }

        let counter = state.counters.entry(file_id.clone()).or_insert(0);
        *counter += 1;
        let version = commit.version.into_version(*counter, Utc::now());
        state
            .versions
            .entry(file_id.clone())
            .or_default()
            .insert(version.version, version.clone());
        if let Some(head) = commit.head {
            state.heads.insert(file_id, head);
        }
        Ok(Some(version))
    }

    fn list_versions(&self, file_id: &FileId) -> Result<Vec<FileVersion>> {
        Ok(self
            .lock()
            .versions
            .get(file_id)
            .map(|versions| versions.values().rev().cloned().collect())
            .unwrap_or_default())
    }

    fn get_version(&self, file_id: &FileId, version: u32) -> Result<Option<FileVersion>> {
        Ok(self
            .lock()
            .versions
            .get(file_id)
            .and_then(|versions| versions.get(&version))
            .cloned())
    }

    fn delete_versions(&self, file_id: &FileId, versions: &[u32]) -> Result<usize> {
        let mut state = self.lock();
        let Some(existing) = state.versions.get_mut(file_id) else {
            return Ok(0);
        };
        Ok(versions
            .iter()
            .filter(|version| existing.remove(*version).is_some())
            .count())
    }

    fn get_head(&self, file_id: &FileId) -> Result<Option<FileHead>> {
        Ok(self.lock().heads.get(file_id).cloned())
    }

    fn set_head(&self, head: &FileHead) -> Result<()> {
        self.lock().heads.insert(head.file_id.clone(), head.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewVersion;
    use std::sync::Arc;
    use std::thread;

    fn pending(hash: &str) -> NewVersion {
        NewVersion {
            file_id: FileId::new("f1"),
            storage_path: format!("u/2024/01/{hash}.txt"),
            size_bytes: 3,
            content_hash: hash.to_string(),
            change_note: None,
            created_by: "u".to_string(),
        }
    }

    fn head(hash: &str) -> FileHead {
        FileHead {
            file_id: FileId::new("f1"),
            owner_id: "u".to_string(),
            filename: "a.txt".to_string(),
            content_type: "text/plain".to_string(),
            storage_path: format!("u/2024/01/{hash}.txt"),
            content_hash: hash.to_string(),
            size_bytes: 3,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_versions_number_from_one() {
        let store = InMemoryMetadataStore::new();
        for hash in ["a", "b", "c"] {
            store
                .commit_version(VersionCommit {
                    version: pending(hash),
                    head: Some(head(hash)),
                    skip_if_head_matches: true,
                })
                .unwrap();
        }
        let numbers: Vec<u32> = store
            .list_versions(&FileId::new("f1"))
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(numbers, [3, 2, 1]);
        assert_eq!(
            store.get_head(&FileId::new("f1")).unwrap().unwrap().content_hash,
            "c"
        );
    }

    #[test]
    fn test_skip_if_head_matches() {
        let store = InMemoryMetadataStore::new();
        store.set_head(&head("a")).unwrap();
        let skipped = store
            .commit_version(VersionCommit {
                version: pending("a"),
                head: None,
                skip_if_head_matches: true,
            })
            .unwrap();
        assert!(skipped.is_none());
        let forced = store
            .commit_version(VersionCommit {
                version: pending("a"),
                head: None,
                skip_if_head_matches: false,
            })
            .unwrap();
        assert_eq!(forced.unwrap().version, 1);
    }

    #[test]
    fn test_numbers_not_reused_after_delete() {
        let store = InMemoryMetadataStore::new();
        let id = FileId::new("f1");
        for hash in ["a", "b"] {
            store
                .commit_version(VersionCommit {
                    version: pending(hash),
                    head: None,
                    skip_if_head_matches: false,
                })
                .unwrap();
        }
        assert_eq!(store.delete_versions(&id, &[1, 2, 9]).unwrap(), 2);
        let next = store
            .commit_version(VersionCommit {
                version: pending("c"),
                head: None,
                skip_if_head_matches: false,
            })
            .unwrap()
            .unwrap();
        assert_eq!(next.version, 3);
        assert_eq!(store.count_versions(&id).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_commits_get_unique_numbers() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .commit_version(VersionCommit {
                            version: pending(&format!("h{i}")),
                            head: None,
                            skip_if_head_matches: false,
                        })
                        .unwrap()
                        .unwrap()
                        .version
                })
            })
            .collect();
        let mut numbers: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=8).collect::<Vec<_>>());
    }
}
