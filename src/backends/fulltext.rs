//! SQLite FTS5 implementation of [`super::FullTextBackend`].
//!
//! Grounded in the existing `chunks_fts` virtual-table pattern: one FTS5
//! table (`documents_fts`, created in `migrate.rs`) mirrored against the
//! `documents` table, with `bm25()` providing the ranking function.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::{validate_index_name, BackendHit, FullTextBackend};
use crate::models::DocumentRecord;

pub struct SqliteFullTextBackend {
    pool: SqlitePool,
}

impl SqliteFullTextBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FullTextBackend for SqliteFullTextBackend {
    async fn create_index(&self, name: &str) -> anyhow::Result<()> {
        validate_index_name(name)?;
        crate::migrate::migrate_pool(&self.pool).await
    }

    async fn delete_index(&self, name: &str) -> anyhow::Result<()> {
        validate_index_name(name)?;
        sqlx::query("DELETE FROM documents_fts").execute(&self.pool).await?;
        sqlx::query("DELETE FROM documents").execute(&self.pool).await?;
        Ok(())
    }

    async fn bulk_index(&self, docs: &[DocumentRecord]) -> anyhow::Result<()> {
        for batch in docs.chunks(1000) {
            let mut tx = self.pool.begin().await?;
            for doc in batch {
                let tags_json = serde_json::to_string(&doc.tags)?;
                sqlx::query(
                    r#"
                    INSERT INTO documents
                        (id, title, content, content_normalized, category, tags, author,
                         reference, source, file_path, word_count, created_at, updated_at, indexed_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        title = excluded.title,
                        content = excluded.content,
                        content_normalized = excluded.content_normalized,
                        category = excluded.category,
                        tags = excluded.tags,
                        author = excluded.author,
                        reference = excluded.reference,
                        source = excluded.source,
                        file_path = excluded.file_path,
                        word_count = excluded.word_count,
                        updated_at = excluded.updated_at,
                        indexed_at = excluded.indexed_at
                    "#,
                )
                .bind(&doc.id)
                .bind(&doc.title)
                .bind(&doc.content)
                .bind(&doc.content_normalized)
                .bind(&doc.category)
                .bind(&tags_json)
                .bind(&doc.author)
                .bind(&doc.reference)
                .bind(&doc.source)
                .bind(&doc.file_path)
                .bind(doc.word_count)
                .bind(doc.created_at)
                .bind(doc.updated_at)
                .bind(doc.indexed_at)
                .execute(&mut *tx)
                .await?;

                sqlx::query("DELETE FROM documents_fts WHERE id = ?")
                    .bind(&doc.id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(
                    "INSERT INTO documents_fts (id, title, content, content_normalized, reference) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&doc.id)
                .bind(&doc.title)
                .bind(&doc.content)
                .bind(&doc.content_normalized)
                .bind(&doc.reference)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM documents_fts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        fields: &[String],
        query: &str,
        phrase_boosts: &[String],
        filters: &[(String, String)],
        minimum_should_match_all: bool,
        k: i64,
    ) -> anyhow::Result<Vec<BackendHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let column_list: Vec<&str> = fields
            .iter()
            .map(|f| match f.as_str() {
                "title" | "content" | "content_normalized" | "reference" => f.as_str(),
                _ => "content",
            })
            .collect();

        let terms: Vec<&str> = query.split_whitespace().collect();
        let joiner = if minimum_should_match_all { " AND " } else { " OR " };

        let mut clauses: Vec<String> = Vec::new();
        for col in &column_list {
            let per_field: Vec<String> = terms
                .iter()
                .map(|t| format!("{}:{}", col, fts5_escape(t)))
                .collect();
            if !per_field.is_empty() {
                clauses.push(format!("({})", per_field.join(joiner)));
            }
        }
        let mut match_expr = clauses.join(" OR ");

        for phrase in phrase_boosts {
            match_expr = format!("{} OR content:{}", match_expr, fts5_escape(phrase));
        }

        if match_expr.trim().is_empty() {
            return Ok(Vec::new());
        }

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
                format!(" AND {}", parts.join(" AND "))
            }
        };

        let sql = format!(
            r#"
            SELECT bm25(documents_fts) as score, d.*
            FROM documents_fts
            JOIN documents d ON d.id = documents_fts.id
            WHERE documents_fts MATCH ?{}
            ORDER BY score ASC
            LIMIT ?
            "#,
            filter_sql
        );

        let mut q = sqlx::query(&sql).bind(&match_expr);
        for (_, value) in filters {
            q = q.bind(value);
        }
        q = q.bind(k);

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_hit).collect()
    }

    async fn term_query(&self, field: &str, values: &[String], size: i64) -> anyhow::Result<Vec<BackendHit>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let column = match field {
            "reference.keyword" | "reference" => "reference",
            other => other,
        };
        let placeholders = values.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT * FROM documents WHERE {} IN ({}) LIMIT ?",
            column, placeholders
        );
        let mut q = sqlx::query(&sql);
        for v in values {
            q = q.bind(v);
        }
        q = q.bind(size);
        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let doc = row_to_document(&row)?;
                Ok(BackendHit {
                    id: doc.id.clone(),
                    score: 1.0,
                    document: doc,
                })
            })
            .collect()
    }
}

fn fts5_escape(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

fn row_to_hit(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<BackendHit> {
    let score: f64 = row.try_get("score")?;
    // bm25() returns lower-is-better; flip sign so higher is better, matching vector cosine semantics.
    let doc = row_to_document(&row)?;
    Ok(BackendHit {
        id: doc.id.clone(),
        score: -score,
        document: doc,
    })
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<DocumentRecord> {
    let tags_json: String = row.try_get("tags")?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    Ok(DocumentRecord {
        id: row.try_get("id")?,
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
