//! Database schema migrations.
//!
//! Creates the Hash Store table, the document/full-text/vector backend
//! tables, and supporting indexes. Idempotent; safe to run on every startup
//! (`ctx sync` runs it before scanning).

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Hash Store: natural key (source_kind, path).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_hashes (
            source_kind TEXT NOT NULL,
            path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            size INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL,
            PRIMARY KEY (source_kind, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_hashes_kind ON file_hashes(source_kind)",
    )
    .execute(pool)
    .await?;

    // Documents: one row per indexed unit, one embedding per document (no chunking).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            content_normalized TEXT NOT NULL,
            category TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            author TEXT,
            reference TEXT NOT NULL,
            source TEXT NOT NULL,
            file_path TEXT NOT NULL,
            word_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_updated_at ON documents(updated_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_reference ON documents(reference)")
        .execute(pool)
        .await?;

    // Full-text backend: BM25 over title/content/content_normalized/reference.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                id UNINDEXED,
                title,
                content,
                content_normalized,
                reference
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Vector backend: one dense vector per document, stored as a BLOB of f32 LE.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_vectors (
            id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
