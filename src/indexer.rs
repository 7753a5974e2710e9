//! Dual Indexer: for each staged document, normalizes content,
//! computes an embedding (skipped in dry-run), and writes independently to
//! the full-text and vector backends, tallying each backend's outcome on its
//! own. The Hash Store is only updated once at least one backend accepted
//! the write.

use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::backends::{FullTextBackend, VectorBackend};
use crate::config::EmbeddingConfig;
use crate::embedding::{embed_texts, EmbeddingProvider};
use crate::errors::is_retryable;
use crate::hash_store::HashStore;
use crate::models::{DocumentRecord, FileHashRecord, ProcessingResult, SourceKind};
use crate::query_preprocessor::normalize_content;
use crate::ratelimit::TokenBucket;
use crate::run_controller::RunStateHandle;

/// One file staged for indexing: identity for the Hash Store upsert, plus the
/// document record to write to both backends.
pub struct PendingDocument {
    pub source_kind: SourceKind,
    pub path: String,
    pub content_hash: String,
    pub size: u64,
    pub record: DocumentRecord,
}

pub struct IndexerConfig<'a> {
    pub fulltext: &'a dyn FullTextBackend,
    pub vector: &'a dyn VectorBackend,
    pub hash_store: &'a HashStore,
    pub embedding: &'a dyn EmbeddingProvider,
    pub embedding_config: &'a EmbeddingConfig,
    pub rate_limiter: &'a TokenBucket,
    pub cancel: &'a CancellationToken,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub progress: Option<&'a RunStateHandle>,
    /// Upper bound on parallel per-file indexing workers (`run.concurrency`).
    pub concurrency: usize,
}

/// Outcome of indexing exactly one [`PendingDocument`], folded into the
/// run's [`ProcessingResult`] after every worker has finished.
enum DocOutcome {
    /// The cancellation token had already fired before this file's turn
    /// came up; it was never touched and does not count against totals.
    Cancelled,
    Invalid {
        path: String,
    },
    DryRun,
    Indexed {
        fulltext_ok: bool,
        vector_ok: bool,
        embedding_error: Option<String>,
        fulltext_error: Option<String>,
        vector_error: Option<String>,
        hash_upsert_error: Option<anyhow::Error>,
    },
}

/// Indexes every pending document, running up to `cfg.concurrency` files'
/// worth of embed-then-write work concurrently (bounded by
/// [`futures::stream::StreamExt::buffer_unordered`]); per-file ordering is
/// not guaranteed, matching §5's "no ordering guarantee" across files in one run.
pub async fn index_files(
    cfg: &IndexerConfig<'_>,
    docs: Vec<PendingDocument>,
    dry_run: bool,
) -> Result<ProcessingResult> {
    let mut result = ProcessingResult {
        total: docs.len() as u64,
        ..Default::default()
    };

    let concurrency = cfg.concurrency.max(1);
    let outcomes: Vec<DocOutcome> = stream::iter(docs)
        .map(|pending| process_one(cfg, pending, dry_run))
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let mut first_hash_store_error = None;
    for outcome in outcomes {
        match outcome {
            DocOutcome::Cancelled => {}
            DocOutcome::Invalid { path } => {
                result.both_failed += 1;
                result.errors.push(format!("{}: skipped, empty id or content", path));
            }
            DocOutcome::DryRun => {
                result.fulltext_succeeded += 1;
                result.vector_succeeded += 1;
                result.both_succeeded += 1;
            }
            DocOutcome::Indexed {
                fulltext_ok,
                vector_ok,
                embedding_error,
                fulltext_error,
                vector_error,
                hash_upsert_error,
            } => {
                result.errors.extend(embedding_error);
                result.errors.extend(fulltext_error);
                result.errors.extend(vector_error);
                match (fulltext_ok, vector_ok) {
                    (true, true) => {
                        result.fulltext_succeeded += 1;
                        result.vector_succeeded += 1;
                        result.both_succeeded += 1;
                    }
                    (true, false) => {
                        result.fulltext_succeeded += 1;
                        result.vector_failed += 1;
                        result.partial_succeeded += 1;
                    }
                    (false, true) => {
                        result.fulltext_failed += 1;
                        result.vector_succeeded += 1;
                        result.partial_succeeded += 1;
                    }
                    (false, false) => {
                        result.fulltext_failed += 1;
                        result.vector_failed += 1;
                        result.both_failed += 1;
                    }
                }
                if first_hash_store_error.is_none() {
                    first_hash_store_error = hash_upsert_error;
                }
            }
        }
    }

    if let Some(e) = first_hash_store_error {
        return Err(e);
    }

    Ok(result)
}

/// One file's worth of work: normalize, embed (unless dry-run), write to
/// both backends, upsert the hash store. Runs as one of up to
/// `cfg.concurrency` concurrently-polled futures inside [`index_files`].
async fn process_one(cfg: &IndexerConfig<'_>, pending: PendingDocument, dry_run: bool) -> DocOutcome {
    if cfg.cancel.is_cancelled() {
        return DocOutcome::Cancelled;
    }
    if let Some(p) = cfg.progress {
        p.set_current_file(Some(pending.path.clone()));
    }

    if pending.record.id.is_empty() || pending.record.content.trim().is_empty() {
        if let Some(p) = cfg.progress {
            p.record_file(false);
        }
        return DocOutcome::Invalid { path: pending.path };
    }

    let mut record = pending.record;
    record.content_normalized = normalize_content(&record.content);

    let mut embedding_error = None;
    let embedding = if dry_run {
        None
    } else {
        match embed_with_retry(cfg, &record.content).await {
            Ok(vec) => Some(vec),
            Err(e) => {
                embedding_error = Some(format!("{}: embedding failed: {}", pending.path, e));
                None
            }
        }
    };
    record.embedding = embedding.clone();

    if dry_run {
        if let Some(p) = cfg.progress {
            p.record_file(true);
        }
        return DocOutcome::DryRun;
    }

    let fulltext_result = retry(cfg, || {
        let record = &record;
        async move { cfg.fulltext.bulk_index(std::slice::from_ref(record)).await }
    })
    .await;
    let fulltext_error = fulltext_result
        .as_ref()
        .err()
        .map(|e| format!("{}: full-text write failed: {}", pending.path, e));

    let vector_result = match &embedding {
        Some(vec) => {
            retry(cfg, || {
                let record = &record;
                async move { cfg.vector.upsert(&record.id, vec, record).await }
            })
            .await
        }
        None => Err(anyhow::anyhow!("no embedding available for this document")),
    };
    let vector_error = vector_result
        .as_ref()
        .err()
        .map(|e| format!("{}: vector write failed: {}", pending.path, e));

    let fulltext_ok = fulltext_result.is_ok();
    let vector_ok = vector_result.is_ok();

    if !fulltext_ok && !vector_ok {
        if let Some(p) = cfg.progress {
            p.record_file(false);
        }
        return DocOutcome::Indexed {
            fulltext_ok,
            vector_ok,
            embedding_error,
            fulltext_error,
            vector_error,
            hash_upsert_error: None,
        };
    }

    let hash_upsert_error = cfg
        .hash_store
        .upsert(&FileHashRecord {
            source_kind: pending.source_kind,
            path: pending.path.clone(),
            content_hash: pending.content_hash.clone(),
            size: pending.size,
            indexed_at: chrono::Utc::now().timestamp(),
        })
        .await
        .err();

    if let Some(p) = cfg.progress {
        p.record_file(true);
    }

    DocOutcome::Indexed {
        fulltext_ok,
        vector_ok,
        embedding_error,
        fulltext_error,
        vector_error,
        hash_upsert_error,
    }
}

/// Acquires a rate-limit token, then embeds `text` with retry/backoff on
/// transient provider errors.
async fn embed_with_retry(cfg: &IndexerConfig<'_>, text: &str) -> Result<Vec<f32>> {
    let text = text.to_string();
    retry(cfg, || {
        let text = text.clone();
        async move {
            cfg.rate_limiter
                .acquire(cfg.cancel)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let results = embed_texts(cfg.embedding, cfg.embedding_config, std::slice::from_ref(&text)).await?;
            results
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("embedding provider returned no vectors"))
        }
    })
    .await
}

/// Retries `f` up to `cfg.max_retries` times on transient errors, sleeping
/// `retry_base_delay * 2^(attempt-1)` between attempts, cutting the wait
/// short if `cfg.cancel` fires.
async fn retry<F, Fut, T>(cfg: &IndexerConfig<'_>, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        // Every backend operation acquires one token before dispatch.
        if cfg.rate_limiter.acquire(cfg.cancel).await.is_err() {
            return Err(anyhow::anyhow!("cancelled while waiting for rate limiter"));
        }
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= cfg.max_retries || !is_retryable(&e) {
                    return Err(e);
                }
                attempt += 1;
                let delay = cfg.retry_base_delay * 2u32.pow(attempt - 1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cfg.cancel.cancelled() => return Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::fulltext::SqliteFullTextBackend;
    use crate::backends::vector::SqliteVectorBackend;
    use crate::config::EmbeddingConfig;
    use crate::embedding::DisabledProvider;
    use crate::migrate::migrate_pool;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> sqlx::SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        pool
    }

    fn record(id: &str, content: &str) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            title: id.to_string(),
            content: content.to_string(),
            content_normalized: String::new(),
            category: "general".to_string(),
            tags: vec![],
            author: None,
            reference: format!("file:///{}.md", id),
            source: "local".to_string(),
            file_path: format!("/{}.md", id),
            word_count: content.split_whitespace().count() as i64,
            created_at: 0,
            updated_at: 0,
            indexed_at: 0,
            embedding: None,
        }
    }

    #[tokio::test]
    async fn dry_run_counts_succeed_without_writing() {
        let pool = test_pool().await;
        let fulltext = SqliteFullTextBackend::new(pool.clone());
        let vector = SqliteVectorBackend::new(pool.clone());
        let hash_store = HashStore::new(pool.clone());
        let provider = DisabledProvider;
        let embedding_config = EmbeddingConfig::default();
        let rate_limiter = TokenBucket::new(1000.0, 1000);
        let cancel = CancellationToken::new();

        let cfg = IndexerConfig {
            fulltext: &fulltext,
            vector: &vector,
            hash_store: &hash_store,
            embedding: &provider,
            embedding_config: &embedding_config,
            rate_limiter: &rate_limiter,
            cancel: &cancel,
            max_retries: 0,
            retry_base_delay: Duration::from_millis(1),
            progress: None,
            concurrency: 4,
        };

        let docs = vec![PendingDocument {
            source_kind: SourceKind::Local,
            path: "/a.md".to_string(),
            content_hash: "h".to_string(),
            size: 1,
            record: record("a", "hello world"),
        }];

        let result = index_files(&cfg, docs, true).await.unwrap();
        assert_eq!(result.both_succeeded, 1);
        assert!(hash_store.get(SourceKind::Local, "/a.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_embedding_provider_still_writes_fulltext() {
        let pool = test_pool().await;
        let fulltext = SqliteFullTextBackend::new(pool.clone());
        let vector = SqliteVectorBackend::new(pool.clone());
        let hash_store = HashStore::new(pool.clone());
        let provider = DisabledProvider;
        let embedding_config = EmbeddingConfig::default();
        let rate_limiter = TokenBucket::new(1000.0, 1000);
        let cancel = CancellationToken::new();

        let cfg = IndexerConfig {
            fulltext: &fulltext,
            vector: &vector,
            hash_store: &hash_store,
            embedding: &provider,
            embedding_config: &embedding_config,
            rate_limiter: &rate_limiter,
            cancel: &cancel,
            max_retries: 0,
            retry_base_delay: Duration::from_millis(1),
            progress: None,
            concurrency: 4,
        };

        let docs = vec![PendingDocument {
            source_kind: SourceKind::Local,
            path: "/a.md".to_string(),
            content_hash: "h".to_string(),
            size: 1,
            record: record("a", "hello world"),
        }];

        let result = index_files(&cfg, docs, false).await.unwrap();
        assert_eq!(result.fulltext_succeeded, 1);
        assert_eq!(result.vector_failed, 1);
        assert_eq!(result.partial_succeeded, 1);
        assert!(hash_store.get(SourceKind::Local, "/a.md").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_content_is_rejected_without_touching_backends() {
        let pool = test_pool().await;
        let fulltext = SqliteFullTextBackend::new(pool.clone());
        let vector = SqliteVectorBackend::new(pool.clone());
        let hash_store = HashStore::new(pool.clone());
        let provider = DisabledProvider;
        let embedding_config = EmbeddingConfig::default();
        let rate_limiter = TokenBucket::new(1000.0, 1000);
        let cancel = CancellationToken::new();

        let cfg = IndexerConfig {
            fulltext: &fulltext,
            vector: &vector,
            hash_store: &hash_store,
            embedding: &provider,
            embedding_config: &embedding_config,
            rate_limiter: &rate_limiter,
            cancel: &cancel,
            max_retries: 0,
            retry_base_delay: Duration::from_millis(1),
            progress: None,
            concurrency: 4,
        };

        let docs = vec![PendingDocument {
            source_kind: SourceKind::Local,
            path: "/empty.md".to_string(),
            content_hash: "h".to_string(),
            size: 0,
            record: record("empty", "   "),
        }];

        let result = index_files(&cfg, docs, false).await.unwrap();
        assert_eq!(result.both_failed, 1);
        assert_eq!(result.errors.len(), 1);
    }
}
