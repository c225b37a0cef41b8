//! Integration tests for file versioning over the SQLite metadata store.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use stowage::models::{ObjectEntry, ObjectMetadata};
use stowage::services::{ContentHasher, NewFile, VersioningService};
use stowage::storage::{LocalBackend, ObjectBackend, SqliteMetadataStore, StorageFacade};
use stowage::{Error, FileId, MetadataStore, Result};
use tempfile::TempDir;
use test_case::test_case;

struct Fixture {
    _dir: TempDir,
    service: VersioningService,
    store: Arc<SqliteMetadataStore>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let local = LocalBackend::new(dir.path().join("blobs"), "/files").unwrap();
    let storage = Arc::new(StorageFacade::new(Arc::new(local), None));
    let store = Arc::new(SqliteMetadataStore::new(dir.path().join("meta").join("stowage.db")).unwrap());
    let service = VersioningService::new(storage, Arc::clone(&store) as Arc<dyn MetadataStore>);
    Fixture {
        _dir: dir,
        service,
        store,
    }
}

async fn register(fx: &Fixture, id: &str, content: &[u8]) -> FileId {
    let file_id = FileId::new(id);
    fx.service
        .register_file(
            NewFile {
                file_id: file_id.clone(),
                owner_id: "owner-1".to_string(),
                filename: "contract.docx".to_string(),
                content_type: "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
                    .to_string(),
            },
            "alice",
            content,
        )
        .await
        .unwrap();
    file_id
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test]
async fn test_identical_content_creates_one_version() {
    let fx = fixture();
    let id = register(&fx, "doc", b"v1").await;

    let first = fx.service.create_version(&id, "bob", b"v2", None).await.unwrap();
    let second = fx.service.create_version(&id, "bob", b"v2", None).await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(fx.store.count_versions(&id).unwrap(), 2);
}

#[tokio::test]
async fn test_returning_to_older_content_is_a_new_version() {
    let fx = fixture();
    let id = register(&fx, "doc", b"a").await;
    fx.service.create_version(&id, "x", b"b", None).await.unwrap();
    let back = fx
        .service
        .create_version(&id, "x", b"a", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(back.version, 3);
    assert_eq!(back.content_hash, ContentHasher::hash(b"a"));
}

// ============================================================================
// Restore
// ============================================================================

#[test_case(1 ; "oldest")]
#[test_case(2 ; "middle")]
#[test_case(3 ; "current")]
#[tokio::test]
async fn test_restore_adds_exactly_one_version(target: u32) {
    let fx = fixture();
    let id = register(&fx, "doc", b"one").await;
    fx.service.create_version(&id, "a", b"two", None).await.unwrap();
    fx.service.create_version(&id, "a", b"three", None).await.unwrap();

    let before = fx.store.count_versions(&id).unwrap();
    let target_hash = fx.service.get_version(&id, target).unwrap().unwrap().content_hash;

    let outcome = fx.service.restore_version(&id, target, "carol").await.unwrap();

    assert_eq!(fx.store.count_versions(&id).unwrap(), before + 1);
    assert_eq!(outcome.restored_from, target);
    assert_eq!(outcome.snapshot.created_by, "carol");
    assert_eq!(outcome.head.content_hash, target_hash);
    assert_eq!(fx.service.head(&id).unwrap().unwrap().content_hash, target_hash);
}

#[tokio::test]
async fn test_restore_then_create_same_content_is_deduplicated() {
    let fx = fixture();
    let id = register(&fx, "doc", b"one").await;
    fx.service.create_version(&id, "a", b"two", None).await.unwrap();
    fx.service.restore_version(&id, 1, "a").await.unwrap();

    let again = fx.service.create_version(&id, "a", b"one", None).await.unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn test_restore_unknown_version() {
    let fx = fixture();
    let id = register(&fx, "doc", b"one").await;
    let err = fx.service.restore_version(&id, 42, "a").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(fx.store.count_versions(&id).unwrap(), 1);
}

/// Local tier whose uploads can be switched off, e.g. a full disk.
struct DiskFullAfter {
    inner: LocalBackend,
    full: AtomicBool,
}

#[async_trait]
impl ObjectBackend for DiskFullAfter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        if self.full.load(Ordering::SeqCst) {
            return Err(Error::LocalIo {
                operation: "write".to_string(),
                cause: "No space left on device".to_string(),
            });
        }
        self.inner.upload(path, bytes, content_type).await
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.download(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn metadata(&self, path: &str) -> Result<Option<ObjectMetadata>> {
        self.inner.metadata(path).await
    }

    async fn signed_url(&self, path: &str, ttl_secs: u64) -> Result<String> {
        self.inner.signed_url(path, ttl_secs).await
    }

    fn public_url(&self, path: &str) -> Option<String> {
        self.inner.public_url(path)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        self.inner.list(prefix).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}

#[tokio::test]
async fn test_failed_restore_upload_leaves_history_unchanged() {
    let dir = TempDir::new().unwrap();
    let local = Arc::new(DiskFullAfter {
        inner: LocalBackend::new(dir.path().join("blobs"), "/files").unwrap(),
        full: AtomicBool::new(false),
    });
    let storage = Arc::new(StorageFacade::new(
        Arc::clone(&local) as Arc<dyn ObjectBackend>,
        None,
    ));
    let store = Arc::new(SqliteMetadataStore::new(dir.path().join("stowage.db")).unwrap());
    let service = VersioningService::new(storage, Arc::clone(&store) as Arc<dyn MetadataStore>);

    let id = FileId::new("doc");
    service
        .register_file(
            NewFile {
                file_id: id.clone(),
                owner_id: "o".to_string(),
                filename: "a.txt".to_string(),
                content_type: "text/plain".to_string(),
            },
            "a",
            b"one",
        )
        .await
        .unwrap();
    service.create_version(&id, "a", b"two", None).await.unwrap();
    let head_before = service.head(&id).unwrap().unwrap();

    local.full.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        assert!(service.restore_version(&id, 1, "a").await.is_err());
    }
    assert_eq!(store.count_versions(&id).unwrap(), 2);
    assert_eq!(service.head(&id).unwrap().unwrap(), head_before);

    // Once space frees up the restore adds exactly one version.
    local.full.store(false, Ordering::SeqCst);
    let outcome = service.restore_version(&id, 1, "a").await.unwrap();
    assert_eq!(outcome.snapshot.version, 3);
    assert_eq!(store.count_versions(&id).unwrap(), 3);
    assert_eq!(outcome.head.content_hash, ContentHasher::hash(b"one"));
}

// ============================================================================
// Pruning
// ============================================================================

#[test_case(0, 6 ; "keep none")]
#[test_case(1, 6 ; "keep one")]
#[test_case(3, 6 ; "keep some")]
#[test_case(10, 6 ; "keep more than exist")]
#[tokio::test]
async fn test_prune_leaves_min_of_keep_and_existing(keep: usize, existing: u32) {
    let fx = fixture();
    let id = register(&fx, "doc", b"c1").await;
    for n in 2..=existing {
        fx.service
            .create_version(&id, "a", format!("c{n}").as_bytes(), None)
            .await
            .unwrap();
    }

    let report = fx.service.prune_old_versions(&id, keep).await.unwrap();
    let remaining: Vec<u32> = fx
        .service
        .list_versions(&id)
        .unwrap()
        .into_iter()
        .map(|v| v.version)
        .collect();

    let expected = keep.min(existing as usize);
    assert_eq!(remaining.len(), expected);
    assert_eq!(report.kept, expected);
    let newest: Vec<u32> = (1..=existing).rev().take(expected).collect();
    assert_eq!(remaining, newest);

    // The live content is untouched by pruning.
    let head = fx.service.head(&id).unwrap().unwrap();
    let live = fx
        .service
        .storage()
        .download_as_buffer(&head.storage_path)
        .await
        .unwrap();
    assert_eq!(live.value, format!("c{existing}").into_bytes());
}

#[tokio::test]
async fn test_history_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("stowage.db");
    let id = FileId::new("doc");
    {
        let local = LocalBackend::new(dir.path().join("blobs"), "/files").unwrap();
        let service = VersioningService::new(
            Arc::new(StorageFacade::new(Arc::new(local), None)),
            Arc::new(SqliteMetadataStore::new(&db).unwrap()),
        );
        service
            .register_file(
                NewFile {
                    file_id: id.clone(),
                    owner_id: "o".to_string(),
                    filename: "a.txt".to_string(),
                    content_type: "text/plain".to_string(),
                },
                "a",
                b"x",
            )
            .await
            .unwrap();
        service.create_version(&id, "a", b"y", None).await.unwrap();
    }

    let reopened = SqliteMetadataStore::new(&db).unwrap();
    assert_eq!(reopened.count_versions(&id).unwrap(), 2);
    assert_eq!(
        reopened.get_head(&id).unwrap().unwrap().content_hash,
        ContentHasher::hash(b"y")
    );
}
