//! Hash Store: the durable `(source_kind, path) -> (content_hash, size, indexed_at)` mapping.
//!
//! The store is opened once per process and shared; every operation is a
//! single statement-level transaction against the `file_hashes` table
//! created by [`crate::migrate`].

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::{FileHashRecord, SourceKind};

pub struct HashStore {
    pool: SqlitePool,
}

impl HashStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, kind: SourceKind, path: &str) -> Result<Option<FileHashRecord>> {
        let row = sqlx::query(
            "SELECT source_kind, path, content_hash, size, indexed_at FROM file_hashes WHERE source_kind = ? AND path = ?",
        )
        .bind(kind.as_str())
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_record))
    }

    /// Queries multiple kinds in one call, for mixed-source runs.
    pub async fn get_all(
        &self,
        kinds: &[SourceKind],
    ) -> Result<std::collections::HashMap<(SourceKind, String), FileHashRecord>> {
        let mut out = std::collections::HashMap::new();
        for kind in kinds {
            let rows = sqlx::query(
                "SELECT source_kind, path, content_hash, size, indexed_at FROM file_hashes WHERE source_kind = ?",
            )
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;

            for row in rows {
                let rec = row_to_record(row);
                out.insert((rec.source_kind, rec.path.clone()), rec);
            }
        }
        Ok(out)
    }

    /// Insert or replace on the natural key `(source_kind, path)`.
    pub async fn upsert(&self, record: &FileHashRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_hashes (source_kind, path, content_hash, size, indexed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source_kind, path) DO UPDATE SET
                content_hash = excluded.content_hash,
                size = excluded.size,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(record.source_kind.as_str())
        .bind(&record.path)
        .bind(&record.content_hash)
        .bind(record.size as i64)
        .bind(record.indexed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, kind: SourceKind, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM file_hashes WHERE source_kind = ? AND path = ?")
            .bind(kind.as_str())
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_by_kind(&self, kind: SourceKind) -> Result<u64> {
        let result = sqlx::query("DELETE FROM file_hashes WHERE source_kind = ?")
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> FileHashRecord {
    let kind_str: String = row.get("source_kind");
    FileHashRecord {
        source_kind: SourceKind::parse(&kind_str).unwrap_or(SourceKind::Local),
        path: row.get("path"),
        content_hash: row.get("content_hash"),
        size: row.get::<i64, _>("size") as u64,
        indexed_at: row.get("indexed_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> HashStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        HashStore::new(pool)
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let store = test_store().await;
        let rec = FileHashRecord {
            source_kind: SourceKind::Local,
            path: "/a.md".to_string(),
            content_hash: "abc123".to_string(),
            size: 42,
            indexed_at: 1000,
        };
        store.upsert(&rec).await.unwrap();

        let fetched = store.get(SourceKind::Local, "/a.md").await.unwrap().unwrap();
        assert_eq!(fetched.content_hash, "abc123");
        assert_eq!(fetched.size, 42);
    }

    #[tokio::test]
    async fn upsert_overwrites_existing_row() {
        let store = test_store().await;
        let mut rec = FileHashRecord {
            source_kind: SourceKind::Local,
            path: "/a.md".to_string(),
            content_hash: "h0".to_string(),
            size: 1,
            indexed_at: 1000,
        };
        store.upsert(&rec).await.unwrap();
        rec.content_hash = "h1".to_string();
        rec.indexed_at = 2000;
        store.upsert(&rec).await.unwrap();

        let all = store.get_all(&[SourceKind::Local]).await.unwrap();
        assert_eq!(all.len(), 1);
        let fetched = &all[&(SourceKind::Local, "/a.md".to_string())];
        assert_eq!(fetched.content_hash, "h1");
        assert_eq!(fetched.indexed_at, 2000);
    }

    #[tokio::test]
    async fn delete_by_kind_removes_only_that_kind() {
        let store = test_store().await;
        store
            .upsert(&FileHashRecord {
                source_kind: SourceKind::Local,
                path: "/a.md".to_string(),
                content_hash: "h".to_string(),
                size: 1,
                indexed_at: 1,
            })
            .await
            .unwrap();
        store
            .upsert(&FileHashRecord {
                source_kind: SourceKind::Repository,
                path: "repo://o/r/a.md".to_string(),
                content_hash: "h".to_string(),
                size: 1,
                indexed_at: 1,
            })
            .await
            .unwrap();

        let deleted = store.delete_by_kind(SourceKind::Local).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = store
            .get_all(&[SourceKind::Local, SourceKind::Repository])
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
