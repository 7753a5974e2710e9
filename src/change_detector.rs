//! Change Detector: classifies a freshly scanned file set against the Hash Store.

use anyhow::{bail, Result};
use std::collections::HashSet;

use crate::hash_store::HashStore;
use crate::models::{ChangeSet, FileDescriptor, SourceKind};

/// Given the scanned source kinds and the current file set, loads the
/// corresponding Hash Store rows and classifies each path as New / Modified
/// / Unchanged, then reports any stored path not seen in the current scan
/// (restricted to the queried kinds) as Deleted.
///
/// Duplicate paths within `current_files` are a caller bug and rejected.
pub async fn detect_changes(
    store: &HashStore,
    source_kinds: &[SourceKind],
    current_files: Vec<FileDescriptor>,
) -> Result<ChangeSet> {
    let mut seen_paths = HashSet::with_capacity(current_files.len());
    for f in &current_files {
        if !seen_paths.insert(f.path.clone()) {
            bail!("duplicate path in current scan: {}", f.path);
        }
    }

    let stored = store.get_all(source_kinds).await?;

    let mut out = ChangeSet::default();
    for file in current_files {
        let key = (file.source_kind, file.path.clone());
        match stored.get(&key) {
            None => out.new.push(file),
            Some(record) if record.content_hash != file.content_hash => {
                let old_hash = record.content_hash.clone();
                out.modified.push((file, old_hash));
            }
            Some(_) => out.unchanged.push(file),
        }
    }

    for (_, path) in stored.keys() {
        if !seen_paths.contains(path) {
            out.deleted.push(path.clone());
        }
    }
    out.deleted.sort();
    out.deleted.dedup();

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use sqlx::sqlite::SqlitePoolOptions;

    fn descriptor(path: &str, hash: &str) -> FileDescriptor {
        FileDescriptor {
            source_kind: SourceKind::Local,
            path: path.to_string(),
            name: path.to_string(),
            size: 10,
            mtime: 0,
            is_markdown: true,
            is_tabular: false,
            content: "x".to_string(),
            content_hash: hash.to_string(),
        }
    }

    async fn store() -> HashStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        HashStore::new(pool)
    }

    #[tokio::test]
    async fn totality_over_empty_store() {
        let s = store().await;
        let current = vec![descriptor("/a.md", "h1"), descriptor("/b.md", "h2")];
        let cs = detect_changes(&s, &[SourceKind::Local], current)
            .await
            .unwrap();
        assert_eq!(cs.new.len(), 2);
        assert_eq!(cs.modified.len(), 0);
        assert_eq!(cs.unchanged.len(), 0);
        assert_eq!(cs.deleted.len(), 0);
    }

    #[tokio::test]
    async fn reingest_unchanged_file_is_unchanged() {
        let s = store().await;
        s.upsert(&crate::models::FileHashRecord {
            source_kind: SourceKind::Local,
            path: "/a.md".to_string(),
            content_hash: "h1".to_string(),
            size: 10,
            indexed_at: 0,
        })
        .await
        .unwrap();

        let current = vec![descriptor("/a.md", "h1")];
        let cs = detect_changes(&s, &[SourceKind::Local], current)
            .await
            .unwrap();
        assert_eq!(cs.new.len(), 0);
        assert_eq!(cs.modified.len(), 0);
        assert_eq!(cs.unchanged.len(), 1);
    }

    #[tokio::test]
    async fn edited_file_is_modified_with_old_hash() {
        let s = store().await;
        s.upsert(&crate::models::FileHashRecord {
            source_kind: SourceKind::Local,
            path: "/a.md".to_string(),
            content_hash: "h0".to_string(),
            size: 10,
            indexed_at: 0,
        })
        .await
        .unwrap();

        let current = vec![descriptor("/a.md", "h1")];
        let cs = detect_changes(&s, &[SourceKind::Local], current)
            .await
            .unwrap();
        assert_eq!(cs.modified.len(), 1);
        assert_eq!(cs.modified[0].1, "h0");
        assert_eq!(cs.modified[0].0.content_hash, "h1");
    }

    #[tokio::test]
    async fn missing_from_current_scan_is_deleted() {
        let s = store().await;
        s.upsert(&crate::models::FileHashRecord {
            source_kind: SourceKind::Local,
            path: "/gone.md".to_string(),
            content_hash: "h0".to_string(),
            size: 10,
            indexed_at: 0,
        })
        .await
        .unwrap();

        let cs = detect_changes(&s, &[SourceKind::Local], vec![])
            .await
            .unwrap();
        assert_eq!(cs.deleted, vec!["/gone.md".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_path_in_scan_is_rejected() {
        let s = store().await;
        let current = vec![descriptor("/a.md", "h1"), descriptor("/a.md", "h2")];
        let result = detect_changes(&s, &[SourceKind::Local], current).await;
        assert!(result.is_err());
    }
}
