//! Single-run ingestion pipeline:
//! Scanners -> Change Detector -> Metadata Extractor -> Dual Indexer -> Hash Store.
//!
//! [`run_pipeline`] is the mechanics; lifecycle (idle/running/follow-mode,
//! the busy flag, shutdown) belongs to [`crate::run_controller`], which
//! calls this once per cycle.

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backends::fulltext::SqliteFullTextBackend;
use crate::backends::vector::SqliteVectorBackend;
use crate::backends::{FullTextBackend, VectorBackend};
use crate::change_detector::detect_changes;
use crate::config::Config;
use crate::connector_fs::FilesystemConnector;
use crate::connector_git::GitConnector;
use crate::connector_s3::S3Connector;
use crate::db;
use crate::embedding;
use crate::hash_store::HashStore;
use crate::indexer::{index_files, IndexerConfig, PendingDocument};
use crate::metadata::{extract_metadata, OriginContext};
use crate::migrate::migrate_pool;
use crate::models::{DocumentRecord, FileDescriptor, ProcessingResult, SourceKind};
use crate::ratelimit::TokenBucket;
use crate::run_controller::RunStateHandle;
use crate::scanner::{ScanContext, Scanner};

/// Uuidv5 namespace for deriving a stable document id from a file's
/// canonical path, so re-ingesting the same file always yields the same id.
const PATH_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3a, 0x1c, 0x9e, 0x5d, 0x7b, 0x4f, 0x4a, 0x2e, 0x9c, 0x61, 0x2d, 0x8e, 0x5b, 0x4f, 0x6a, 0x10,
]);

/// Builds every connector matching `source_filter` (an instance name or a
/// source-kind string: `"local"`, `"repository"`, `"object-store"`); `None`
/// selects every configured connector.
pub fn build_scanners(config: &Config, source_filter: Option<&str>) -> Result<Vec<Box<dyn Scanner>>> {
    let mut scanners: Vec<Box<dyn Scanner>> = Vec::new();

    for (name, c) in &config.connectors.filesystem {
        if matches_filter(source_filter, name, "local") {
            scanners.push(Box::new(FilesystemConnector::new(name.clone(), c.clone())));
        }
    }
    for (name, c) in &config.connectors.git {
        if matches_filter(source_filter, name, "repository") {
            scanners.push(Box::new(GitConnector::new(
                name.clone(),
                c.clone(),
                config.run.repo_token.clone(),
            )?));
        }
    }
    for (name, c) in &config.connectors.s3 {
        if matches_filter(source_filter, name, "object-store") {
            scanners.push(Box::new(S3Connector::new(name.clone(), c.clone())));
        }
    }

    if scanners.is_empty() {
        bail!("no connector matches source filter {:?}", source_filter);
    }
    Ok(scanners)
}

fn matches_filter(filter: Option<&str>, instance_name: &str, kind: &str) -> bool {
    match filter {
        None => true,
        Some(f) => f == instance_name || f == kind,
    }
}

pub async fn run_pipeline(
    config: &Config,
    source_filter: Option<&str>,
    dry_run: bool,
    cancel: &CancellationToken,
    progress: Option<&RunStateHandle>,
) -> Result<ProcessingResult> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;

    let hash_store = HashStore::new(pool.clone());
    let fulltext = SqliteFullTextBackend::new(pool.clone());
    let vector = SqliteVectorBackend::new(pool.clone());

    let provider = embedding::create_provider(&config.embedding)?;
    let dims = config.run.embedding_dimension.unwrap_or_else(|| provider.dims());
    fulltext.create_index(&config.run.vector_index_name).await?;
    if dims > 0 {
        vector.create_index(&config.run.vector_index_name, dims).await?;
    }

    let mut all_files = Vec::new();
    let mut kinds_seen = std::collections::HashSet::new();
    for scanner in build_scanners(config, source_filter)? {
        if cancel.is_cancelled() {
            break;
        }
        kinds_seen.insert(scanner.source_kind());
        let ctx = ScanContext::unbounded();
        let files = scanner
            .scan(&ctx)
            .await
            .map_err(|e| anyhow::anyhow!("connector '{}' failed: {}", scanner.name(), e))?;
        all_files.extend(files);
    }

    let kinds: Vec<SourceKind> = kinds_seen.into_iter().collect();
    let change_set = detect_changes(&hash_store, &kinds, all_files).await?;
    let to_process = change_set.to_process();

    if let Some(p) = progress {
        p.set_total(to_process.len() as u64);
    }

    let mut pending = Vec::with_capacity(to_process.len());
    for file in to_process {
        let record = build_document_record(file)?;
        pending.push(PendingDocument {
            source_kind: file.source_kind,
            path: file.path.clone(),
            content_hash: file.content_hash.clone(),
            size: file.size,
            record,
        });
    }

    let rate_limiter = TokenBucket::new(config.run.rate_limit, config.run.rate_burst);
    let idx_cfg = IndexerConfig {
        fulltext: &fulltext,
        vector: &vector,
        hash_store: &hash_store,
        embedding: provider.as_ref(),
        embedding_config: &config.embedding,
        rate_limiter: &rate_limiter,
        cancel,
        max_retries: config.run.max_retries,
        retry_base_delay: std::time::Duration::from_millis(config.run.retry_base_delay_ms),
        progress,
        concurrency: config.run.concurrency,
    };

    let mut result = index_files(&idx_cfg, pending, dry_run).await?;

    if !change_set.deleted.is_empty() {
        result.errors.push(format!(
            "{} file(s) deleted at source; not removed from the index automatically",
            change_set.deleted.len()
        ));
    }

    pool.close().await;
    Ok(result)
}

/// Derives an [`OriginContext`] from a [`FileDescriptor`]'s uniform path
/// encoding (`<scheme>://owner/repo/relpath`, `<scheme>://bucket/key`, or a
/// bare local path) and extracts metadata from its content.
fn build_document_record(file: &FileDescriptor) -> Result<DocumentRecord> {
    let file_stem = std::path::Path::new(&file.name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file.name.clone());

    let (relative_path, repo_owner_name, reference, source_label) = match file.source_kind {
        SourceKind::Repository => {
            let tail = file.path.strip_prefix("repository://").unwrap_or(&file.path);
            let mut parts = tail.splitn(3, '/');
            let owner = parts.next().unwrap_or_default().to_string();
            let repo = parts.next().unwrap_or_default().to_string();
            let relpath = parts.next().unwrap_or_default().to_string();
            let reference = format!("https://github.com/{}/{}/blob/main/{}", owner, repo, relpath);
            (relpath, Some((owner, repo)), reference, "repository")
        }
        SourceKind::ObjectStore => {
            let tail = file.path.strip_prefix("object-store://").unwrap_or(&file.path);
            let (_bucket, key) = tail.split_once('/').unwrap_or((tail, ""));
            (key.to_string(), None, file.path.clone(), "object-store")
        }
        SourceKind::Local => (file.path.clone(), None, format!("file://{}", file.path), "local"),
    };

    let owner_name_refs = repo_owner_name.as_ref().map(|(o, r)| (o.as_str(), r.as_str()));

    let ctx = OriginContext {
        source_kind: file.source_kind,
        relative_path: &relative_path,
        file_stem: &file_stem,
        mtime: file.mtime,
        repo_owner_name: owner_name_refs,
        reference: &reference,
    };

    let metadata = extract_metadata(&file.content, &ctx)?;
    let id = Uuid::new_v5(&PATH_NAMESPACE, file.path.as_bytes()).to_string();
    let now = chrono::Utc::now().timestamp();

    Ok(DocumentRecord {
        id,
        title: metadata.title,
        content: file.content.clone(),
        content_normalized: String::new(),
        category: metadata.category,
        tags: metadata.tags,
        author: metadata.author,
        reference: metadata.reference,
        source: source_label.to_string(),
        file_path: file.path.clone(),
        word_count: file.content.split_whitespace().count() as i64,
        created_at: metadata.created_at.unwrap_or(file.mtime),
        updated_at: metadata.updated_at.unwrap_or(file.mtime),
        indexed_at: now,
        embedding: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: SourceKind, path: &str, content: &str) -> FileDescriptor {
        FileDescriptor {
            source_kind: kind,
            path: path.to_string(),
            name: "doc.md".to_string(),
            size: content.len() as u64,
            mtime: 1_700_000_000,
            is_markdown: true,
            is_tabular: false,
            content: content.to_string(),
            content_hash: FileDescriptor::compute_hash(content),
        }
    }

    #[test]
    fn repository_path_yields_owner_repo_reference() {
        let file = descriptor(
            SourceKind::Repository,
            "repository://acme/widgets/docs/readme.md",
            "# Readme\nbody",
        );
        let record = build_document_record(&file).unwrap();
        assert_eq!(record.title, "Readme");
        assert_eq!(record.tags, vec!["acme".to_string(), "widgets".to_string()]);
        assert_eq!(
            record.reference,
            "https://github.com/acme/widgets/blob/main/docs/readme.md"
        );
    }

    #[test]
    fn local_path_reference_is_a_file_url() {
        let file = descriptor(SourceKind::Local, "/srv/docs/a.md", "no heading here");
        let record = build_document_record(&file).unwrap();
        assert_eq!(record.reference, "file:///srv/docs/a.md");
        assert_eq!(record.source, "local");
    }

    #[test]
    fn document_id_is_stable_across_reingests() {
        let file = descriptor(SourceKind::Local, "/srv/docs/a.md", "body one");
        let a = build_document_record(&file).unwrap().id;
        let file2 = descriptor(SourceKind::Local, "/srv/docs/a.md", "body one edited");
        let b = build_document_record(&file2).unwrap().id;
        assert_eq!(a, b);
    }
}
