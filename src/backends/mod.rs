//! Backend contracts: full-text and vector storage interfaces.
//!
//! `FullTextBackend` and `VectorBackend` are narrow interfaces; only their
//! contracts are specified, not their internals. This crate's own SQLite
//! FTS5 / brute-force-cosine implementations (in `fulltext.rs` / `vector.rs`)
//! are the reference backend, built the way the rest of the crate already
//! talks to SQLite (`sqlx`), not a prescribed wire format.

pub mod fulltext;
pub mod vector;

use async_trait::async_trait;

use crate::models::DocumentRecord;

/// A single full-text or vector hit before fusion: id, backend-native score,
/// and enough of the document to build the opaque `source` payload.
#[derive(Debug, Clone)]
pub struct BackendHit {
    pub id: String,
    pub score: f64,
    pub document: DocumentRecord,
}

#[async_trait]
pub trait FullTextBackend: Send + Sync {
    /// Creates the index/table if absent. Refuses names shorter than three
    /// characters or starting with `.`.
    async fn create_index(&self, name: &str) -> anyhow::Result<()>;
    async fn delete_index(&self, name: &str) -> anyhow::Result<()>;
    /// Bulk-indexes up to 1000 records at a time.
    async fn bulk_index(&self, docs: &[DocumentRecord]) -> anyhow::Result<()>;
    async fn delete_document(&self, id: &str) -> anyhow::Result<()>;
    /// BM25 search over `fields`, with `should` phrase-boost clauses for
    /// critical phrases and `must` equality filters.
    async fn search(
        &self,
        fields: &[String],
        query: &str,
        phrase_boosts: &[String],
        filters: &[(String, String)],
        minimum_should_match_all: bool,
        k: i64,
    ) -> anyhow::Result<Vec<BackendHit>>;
    /// Exact-match term query on a keyword field (the URL fast path).
    async fn term_query(&self, field: &str, values: &[String], size: i64) -> anyhow::Result<Vec<BackendHit>>;
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Creates an HNSW/cosine index of `dims` if absent, guarded the same way
    /// as [`FullTextBackend::create_index`].
    async fn create_index(&self, name: &str, dims: usize) -> anyhow::Result<()>;
    async fn delete_index(&self, name: &str) -> anyhow::Result<()>;
    async fn upsert(&self, id: &str, vector: &[f32], document: &DocumentRecord) -> anyhow::Result<()>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
    async fn knn(
        &self,
        vector: &[f32],
        k: i64,
        filters: &[(String, String)],
        min_score: f64,
    ) -> anyhow::Result<Vec<BackendHit>>;
}

/// Refuses to touch an index whose name begins with `.` or is shorter than
/// three characters. Shared by both backend implementations.
pub fn validate_index_name(name: &str) -> anyhow::Result<()> {
    if name.starts_with('.') || name.chars().count() < 3 {
        anyhow::bail!(
            "refusing to create/delete index '{}': names must be >= 3 characters and not start with '.'",
            name
        );
    }
    Ok(())
}
