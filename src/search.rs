//! Hybrid Search Engine.
//!
//! Three stages: the URL Detector's exact-match fast path, then (when no URL
//! is found) the BM25 and embedding/vector legs running concurrently, fused
//! by [`crate::fusion`]. A leg failing degrades the response to
//! `partial_results = true` with a `fallback_reason` rather than failing the
//! whole request; both legs failing is the only hard error.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tokio::time::timeout;

use crate::backends::{BackendHit, FullTextBackend, VectorBackend};
use crate::config::{EmbeddingConfig, RetrievalConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::fusion::{self, FusionMethod, FusionParams, LegHit};
use crate::models::{ScoredDoc, SearchType};
use crate::query_preprocessor::{self, ProcessedQuery, CURRENCY_UNIT_MARKERS};
use crate::url_detector::detect_urls;

const URL_FAST_PATH_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_FIELDS: &[&str] = &["title", "content", "reference"];

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub size: i64,
    pub k: i64,
    pub bm25_weight: f64,
    pub vector_weight: f64,
    pub fusion_method: String,
    pub rank_constant: f64,
    pub timeout_seconds: u64,
    pub fields: Vec<String>,
    pub filters: Vec<(String, String)>,
}

impl SearchRequest {
    pub fn from_config(query: String, retrieval: &RetrievalConfig) -> Self {
        Self {
            query,
            size: retrieval.size,
            k: retrieval.k,
            bm25_weight: retrieval.bm25_weight,
            vector_weight: retrieval.vector_weight,
            fusion_method: retrieval.fusion_method.clone(),
            rank_constant: retrieval.rank_constant,
            timeout_seconds: retrieval.timeout_seconds,
            fields: Vec::new(),
            filters: Vec::new(),
        }
    }

    /// Clamps every field to its valid range and substitutes the configured
    /// defaults for anything out of bounds.
    fn normalized(&self) -> SearchRequest {
        let (bm25_weight, vector_weight) = if self.bm25_weight == 0.0 && self.vector_weight == 0.0 {
            (0.5, 0.5)
        } else {
            (self.bm25_weight, self.vector_weight)
        };
        SearchRequest {
            query: self.query.clone(),
            size: self.size.clamp(1, 1000),
            k: self.k.clamp(1, 10_000),
            bm25_weight,
            vector_weight,
            fusion_method: if FusionMethod::parse(&self.fusion_method).is_some() {
                self.fusion_method.clone()
            } else {
                "rrf".to_string()
            },
            rank_constant: if self.rank_constant > 0.0 { self.rank_constant } else { 60.0 },
            timeout_seconds: if self.timeout_seconds > 0 { self.timeout_seconds } else { 30 },
            fields: if self.fields.is_empty() {
                DEFAULT_FIELDS.iter().map(|s| s.to_string()).collect()
            } else {
                self.fields.clone()
            },
            filters: self.filters.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<ScoredDoc>,
    pub search_method: SearchType,
    pub url_detected: bool,
    pub partial_results: bool,
    pub fallback_reason: Option<String>,
    pub errors: Vec<String>,
    pub bm25_time_ms: u128,
    pub vector_time_ms: u128,
    pub embedding_time_ms: u128,
    pub fusion_time_ms: u128,
    pub execution_time_ms: u128,
}

pub struct SearchEngine<'a> {
    fulltext: &'a dyn FullTextBackend,
    vector: &'a dyn VectorBackend,
    embedding_provider: &'a dyn EmbeddingProvider,
    embedding_config: &'a EmbeddingConfig,
}

impl<'a> SearchEngine<'a> {
    pub fn new(
        fulltext: &'a dyn FullTextBackend,
        vector: &'a dyn VectorBackend,
        embedding_provider: &'a dyn EmbeddingProvider,
        embedding_config: &'a EmbeddingConfig,
    ) -> Self {
        Self {
            fulltext,
            vector,
            embedding_provider,
            embedding_config,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let request = request.normalized();
        let started = Instant::now();

        if request.query.trim().is_empty() {
            anyhow::bail!("query must not be empty");
        }

        let urls = detect_urls(&request.query);
        if !urls.is_empty() {
            return self.url_exact_match(&urls, &request, started).await;
        }

        let overall = Duration::from_secs(request.timeout_seconds);
        match timeout(overall, self.run_hybrid(&request, started)).await {
            Ok(result) => result,
            Err(_) => Ok(SearchResponse {
                results: vec![],
                search_method: SearchType::Hybrid,
                url_detected: false,
                partial_results: true,
                fallback_reason: Some("search deadline exceeded".to_string()),
                errors: vec!["search deadline exceeded".to_string()],
                bm25_time_ms: 0,
                vector_time_ms: 0,
                embedding_time_ms: 0,
                fusion_time_ms: 0,
                execution_time_ms: started.elapsed().as_millis(),
            }),
        }
    }

    /// Exact match against the `reference` field, against every URL detected
    /// in the query at once. A miss (or a sub-deadline timeout) falls back
    /// to the full hybrid search rather than returning empty.
    async fn url_exact_match(&self, urls: &[String], request: &SearchRequest, started: Instant) -> Result<SearchResponse> {
        let size = request.size.max(urls.len() as i64);
        let bm25_start = Instant::now();
        let lookup = timeout(URL_FAST_PATH_TIMEOUT, self.fulltext.term_query("reference", urls, size)).await;
        let bm25_time_ms = bm25_start.elapsed().as_millis();

        let fallback_reason = match &lookup {
            Ok(Ok(hits)) if !hits.is_empty() => None,
            Ok(Ok(_)) => Some("no exact match for the detected URL(s)".to_string()),
            Ok(Err(e)) => Some(format!("URL exact-match lookup failed: {}", e)),
            Err(_) => Some("URL exact-match lookup exceeded its sub-deadline".to_string()),
        };

        if let Some(reason) = fallback_reason {
            let mut response = self.run_hybrid(request, started).await?;
            response.url_detected = true;
            response.partial_results = true;
            response.fallback_reason = Some(reason);
            return Ok(response);
        }

        let hits = lookup.unwrap().unwrap();
        let results = hits
            .into_iter()
            .enumerate()
            .map(|(i, h)| url_hit_to_scored(h, i))
            .collect::<Result<Vec<_>>>()?;

        Ok(SearchResponse {
            results,
            search_method: SearchType::UrlExactMatch,
            url_detected: true,
            partial_results: false,
            fallback_reason: None,
            errors: vec![],
            bm25_time_ms,
            vector_time_ms: 0,
            embedding_time_ms: 0,
            fusion_time_ms: 0,
            execution_time_ms: started.elapsed().as_millis(),
        })
    }

    async fn run_hybrid(&self, request: &SearchRequest, started: Instant) -> Result<SearchResponse> {
        let processed = query_preprocessor::preprocess(&request.query);
        let minimum_should_match_all = is_digit_heavy(&processed);

        let bm25_start = Instant::now();
        let bm25_future = self.fulltext.search(
            &request.fields,
            &processed.normalized,
            &processed.critical_phrases,
            &request.filters,
            minimum_should_match_all,
            request.k,
        );
        let embedding_start = Instant::now();
        let embed_future = embedding::embed_query(self.embedding_provider, self.embedding_config, &processed.normalized);

        let (bm25_outcome, embed_outcome) = tokio::join!(bm25_future, embed_future);
        let bm25_time_ms = bm25_start.elapsed().as_millis();
        let embedding_time_ms = embedding_start.elapsed().as_millis();

        let mut errors = Vec::new();
        let mut bm25_failed = false;
        let bm25_hits = match bm25_outcome {
            Ok(hits) => hits,
            Err(e) => {
                bm25_failed = true;
                errors.push(format!("bm25 leg failed: {}", e));
                vec![]
            }
        };

        let vector_start = Instant::now();
        let mut vector_failed = false;
        let vector_hits = match embed_outcome {
            Ok(vector) => match self.vector.knn(&vector, request.k, &request.filters, 0.0).await {
                Ok(hits) => hits,
                Err(e) => {
                    vector_failed = true;
                    errors.push(format!("vector leg failed: {}", e));
                    vec![]
                }
            },
            Err(e) => {
                vector_failed = true;
                errors.push(format!("embedding leg failed: {}", e));
                vec![]
            }
        };
        let vector_time_ms = vector_start.elapsed().as_millis();

        // Both legs erroring is the only hard failure; a leg that merely
        // returned zero hits is a legitimate empty result, not a failure.
        if bm25_failed && vector_failed {
            anyhow::bail!("both search legs failed: {}", errors.join("; "));
        }

        let fusion_start = Instant::now();
        let bm25_legs = to_leg_hits(bm25_hits)?;
        let vector_legs = to_leg_hits(vector_hits)?;
        let params = FusionParams {
            method: FusionMethod::parse(&request.fusion_method).unwrap_or(FusionMethod::Rrf),
            rank_constant: request.rank_constant,
            bm25_weight: request.bm25_weight,
            vector_weight: request.vector_weight,
        };
        let fused = fusion::fuse(&bm25_legs, &vector_legs, &params);
        let fused = fusion::rank_and_limit(fused, request.size as usize);
        let fusion_time_ms = fusion_start.elapsed().as_millis();

        let partial_results = !errors.is_empty();
        let fallback_reason = if partial_results { Some(errors.join("; ")) } else { None };

        Ok(SearchResponse {
            results: fused,
            search_method: SearchType::Hybrid,
            url_detected: false,
            partial_results,
            fallback_reason,
            errors,
            bm25_time_ms,
            vector_time_ms,
            embedding_time_ms,
            fusion_time_ms,
            execution_time_ms: started.elapsed().as_millis(),
        })
    }
}

/// A query is treated as digit-heavy (and BM25 terms ANDed instead of ORed)
/// when it is short (<=24 code points, <=4 whitespace tokens), contains at
/// least one digit, and either carries a currency/unit marker or is very
/// short (<=2 tokens) — e.g. an order number or a currency amount where
/// every term must match.
fn is_digit_heavy(processed: &ProcessedQuery) -> bool {
    let code_points = processed.normalized.chars().count();
    if code_points == 0 || code_points > 24 {
        return false;
    }
    let tokens: Vec<&str> = processed.normalized.split_whitespace().collect();
    if tokens.len() > 4 {
        return false;
    }
    if !processed.normalized.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }
    let has_marker = processed.normalized.chars().any(|c| CURRENCY_UNIT_MARKERS.contains(&c));
    has_marker || tokens.len() <= 2
}

fn to_leg_hits(hits: Vec<BackendHit>) -> Result<Vec<LegHit>> {
    hits.into_iter()
        .enumerate()
        .map(|(i, h)| {
            Ok(LegHit {
                id: h.id,
                score: h.score,
                rank: i + 1,
                payload: serde_json::to_value(&h.document)?,
            })
        })
        .collect()
}

fn url_hit_to_scored(hit: BackendHit, index: usize) -> Result<ScoredDoc> {
    Ok(ScoredDoc {
        id: hit.id,
        score: hit.score,
        bm25_score: Some(hit.score),
        vector_score: None,
        fused_score: hit.score,
        source: serde_json::to_value(&hit.document)?,
        index,
        rank: index + 1,
        search_type: SearchType::UrlExactMatch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::fulltext::SqliteFullTextBackend;
    use crate::backends::vector::SqliteVectorBackend;
    use crate::embedding::DisabledProvider;
    use crate::migrate::migrate_pool;
    use crate::models::DocumentRecord;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> sqlx::SqlitePool {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        migrate_pool(&pool).await.unwrap();
        pool
    }

    fn doc(id: &str, title: &str, content: &str, reference: &str) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            content_normalized: content.to_lowercase(),
            category: "general".to_string(),
            tags: vec![],
            author: None,
            reference: reference.to_string(),
            source: "local".to_string(),
            file_path: format!("/{}.md", id),
            word_count: content.split_whitespace().count() as i64,
            created_at: 0,
            updated_at: 0,
            indexed_at: 0,
            embedding: None,
        }
    }

    #[test]
    fn empty_weights_default_to_even_split() {
        let req = SearchRequest {
            query: "q".to_string(),
            size: 0,
            k: 0,
            bm25_weight: 0.0,
            vector_weight: 0.0,
            fusion_method: "bogus".to_string(),
            rank_constant: -1.0,
            timeout_seconds: 0,
            fields: vec![],
            filters: vec![],
        };
        let norm = req.normalized();
        assert_eq!(norm.size, 1);
        assert_eq!(norm.k, 1);
        assert_eq!((norm.bm25_weight, norm.vector_weight), (0.5, 0.5));
        assert_eq!(norm.fusion_method, "rrf");
        assert_eq!(norm.rank_constant, 60.0);
        assert_eq!(norm.timeout_seconds, 30);
        assert_eq!(norm.fields, vec!["title", "content", "reference"]);
    }

    #[tokio::test]
    async fn url_query_short_circuits_to_exact_match() {
        let pool = test_pool().await;
        let fulltext = SqliteFullTextBackend::new(pool.clone());
        let vector = SqliteVectorBackend::new(pool.clone());
        fulltext.bulk_index(&[doc("a", "Doc A", "body", "https://example.com/a")]).await.unwrap();

        let provider = DisabledProvider;
        let embedding_config = EmbeddingConfig::default();
        let engine = SearchEngine::new(&fulltext, &vector, &provider, &embedding_config);

        let req = SearchRequest::from_config("see https://example.com/a for details".to_string(), &RetrievalConfig::default());
        let response = engine.search(&req).await.unwrap();
        assert_eq!(response.search_method, SearchType::UrlExactMatch);
        assert!(response.url_detected);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].id, "a");
    }

    #[tokio::test]
    async fn unmatched_url_falls_back_to_hybrid() {
        let pool = test_pool().await;
        let fulltext = SqliteFullTextBackend::new(pool.clone());
        let vector = SqliteVectorBackend::new(pool.clone());
        fulltext.bulk_index(&[doc("a", "Doc A", "body about widgets", "https://example.com/other")]).await.unwrap();

        let provider = DisabledProvider;
        let embedding_config = EmbeddingConfig::default();
        let engine = SearchEngine::new(&fulltext, &vector, &provider, &embedding_config);

        let req = SearchRequest::from_config("https://example.com/missing widgets".to_string(), &RetrievalConfig::default());
        let response = engine.search(&req).await.unwrap();
        assert!(response.url_detected);
        assert!(response.partial_results);
        assert!(response.fallback_reason.is_some());
    }

    #[tokio::test]
    async fn bm25_only_search_degrades_to_partial_when_embeddings_disabled() {
        let pool = test_pool().await;
        let fulltext = SqliteFullTextBackend::new(pool.clone());
        let vector = SqliteVectorBackend::new(pool.clone());
        fulltext.bulk_index(&[doc("a", "Widgets Guide", "how to build widgets", "file:///a.md")]).await.unwrap();

        let provider = DisabledProvider;
        let embedding_config = EmbeddingConfig::default();
        let engine = SearchEngine::new(&fulltext, &vector, &provider, &embedding_config);

        let req = SearchRequest::from_config("widgets".to_string(), &RetrievalConfig::default());
        let response = engine.search(&req).await.unwrap();
        assert_eq!(response.search_method, SearchType::Hybrid);
        assert!(response.partial_results);
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].id, "a");
    }

    #[test]
    fn digit_heavy_short_query_is_detected() {
        let processed = query_preprocessor::preprocess("12345");
        assert!(is_digit_heavy(&processed));
        let processed = query_preprocessor::preprocess("a guide to widgets and gadgets");
        assert!(!is_digit_heavy(&processed));
    }

    #[test]
    fn digit_currency_mixed_query_is_digit_heavy() {
        let processed = query_preprocessor::preprocess("0円チャージ API");
        assert!(is_digit_heavy(&processed));
    }
}
