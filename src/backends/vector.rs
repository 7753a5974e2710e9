//! SQLite-backed implementation of [`super::VectorBackend`].
//!
//! No HNSW library is in the dependency stack, so similarity search here is
//! brute-force cosine over BLOB-encoded `f32` vectors. `create_index` still
//! enforces the dimension and naming contract, so a real HNSW backend could
//! be swapped in behind the same trait without changing any caller.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::{validate_index_name, BackendHit, VectorBackend};
use crate::models::DocumentRecord;

pub struct SqliteVectorBackend {
    pool: SqlitePool,
}

impl SqliteVectorBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

pub fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn blob_to_vec(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorBackend for SqliteVectorBackend {
    async fn create_index(&self, name: &str, _dims: usize) -> anyhow::Result<()> {
        validate_index_name(name)?;
        crate::migrate::migrate_pool(&self.pool).await
    }

    async fn delete_index(&self, name: &str) -> anyhow::Result<()> {
        validate_index_name(name)?;
        sqlx::query("DELETE FROM document_vectors").execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert(&self, id: &str, vector: &[f32], _document: &DocumentRecord) -> anyhow::Result<()> {
        let blob = vec_to_blob(vector);
        sqlx::query(
            r#"
            INSERT INTO document_vectors (id, model, dims, embedding)
            VALUES (?, 'default', ?, ?)
            ON CONFLICT(id) DO UPDATE SET dims = excluded.dims, embedding = excluded.embedding
            "#,
        )
        .bind(id)
        .bind(vector.len() as i64)
        .bind(blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM document_vectors WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn knn(
        &self,
        vector: &[f32],
        k: i64,
        filters: &[(String, String)],
        min_score: f64,
    ) -> anyhow::Result<Vec<BackendHit>> {
        let filter_sql = if filters.is_empty() {
            String::new()
        } else {
            let mut parts = Vec::new();
            for (field, _) in filters {
                match field.as_str() {
                    "source" => parts.push("d.source = ?".to_string()),
                    "category" => parts.push("d.category = ?".to_string()),
                    _ => {}
                }
            }
            if parts.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", parts.join(" AND "))
            }
        };

        let sql = format!(
            "SELECT v.id as vid, v.embedding as embedding, d.* FROM document_vectors v JOIN documents d ON d.id = v.id{}",
            filter_sql
        );
        let mut q = sqlx::query(&sql);
        for (_, value) in filters {
            q = q.bind(value);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut scored: Vec<BackendHit> = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let candidate = blob_to_vec(&blob);
            let score = cosine_similarity(vector, &candidate);
            if score < min_score {
                continue;
            }
            let doc = row_to_document(&row)?;
            scored.push(BackendHit { id: doc.id.clone(), score, document: doc });
        }

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k.max(0) as usize);
        Ok(scored)
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<DocumentRecord> {
    let tags_json: String = row.try_get("tags")?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    Ok(DocumentRecord {
        id: row.try_get("vid").or_else(|_| row.try_get("id"))?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        content_normalized: row.try_get("content_normalized")?,
        category: row.try_get("category")?,
        tags,
        author: row.try_get("author")?,
        reference: row.try_get("reference")?,
        source: row.try_get("source")?,
        file_path: row.try_get("file_path")?,
        word_count: row.try_get("word_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        indexed_at: row.try_get("indexed_at")?,
        embedding: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip_preserves_values() {
        let v = vec![0.1_f32, -0.5, 2.0];
        let blob = vec_to_blob(&v);
        let back = blob_to_vec(&blob);
        assert_eq!(v, back);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0_f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![0.0_f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
    }
}
