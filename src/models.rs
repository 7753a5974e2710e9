//! Core data types shared across scanning, indexing, and search.

use serde::Serialize;

/// Which kind of source a [`FileDescriptor`] or [`FileHashRecord`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Local,
    ObjectStore,
    Repository,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Local => "local",
            SourceKind::ObjectStore => "object-store",
            SourceKind::Repository => "repository",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(SourceKind::Local),
            "object-store" => Some(SourceKind::ObjectStore),
            "repository" => Some(SourceKind::Repository),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single scanned file, emitted by every [`crate::scanner::Scanner`].
///
/// `content_hash` is always `md5(content)`, computed once at read time; it is
/// a pure function of `content`, so two descriptors with equal content are
/// indistinguishable for change-detection purposes (hash collisions are
/// treated as unchanged, documented in [`crate::hash_store`]).
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub source_kind: SourceKind,
    /// Canonical identifier, unique within a scan: a local absolute path,
    /// `<scheme>://bucket/key`, or `<scheme>://owner/repo/relpath`.
    pub path: String,
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub is_markdown: bool,
    pub is_tabular: bool,
    pub content: String,
    pub content_hash: String,
}

impl FileDescriptor {
    pub fn compute_hash(content: &str) -> String {
        format!("{:x}", md5::compute(content.as_bytes()))
    }
}

/// Persistent row of the Hash Store: `(source_kind, path) -> (content_hash, size, indexed_at)`.
#[derive(Debug, Clone)]
pub struct FileHashRecord {
    pub source_kind: SourceKind,
    pub path: String,
    pub content_hash: String,
    pub size: u64,
    pub indexed_at: i64,
}

/// Output of the Change Detector: four disjoint partitions of the current
/// scan plus deleted paths observed only in the Hash Store.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub new: Vec<FileDescriptor>,
    pub modified: Vec<(FileDescriptor, String /* old_hash */)>,
    pub unchanged: Vec<FileDescriptor>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    /// `new ∪ modified` — the files that require (re)indexing this run.
    pub fn to_process(&self) -> Vec<&FileDescriptor> {
        self.new
            .iter()
            .chain(self.modified.iter().map(|(d, _)| d))
            .collect()
    }
}

/// Metadata derived from a file's content and origin context.
#[derive(Debug, Clone, Default)]
pub struct DocumentMetadata {
    pub title: String,
    pub category: String,
    pub tags: Vec<String>,
    pub author: Option<String>,
    pub reference: String,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

/// The indexed unit written to both backends.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    /// Stable identifier derived from `path` (UUIDv5 over the canonical path).
    pub id: String,
    pub title: String,
    pub content: String,
    /// Language-processed projection of `content`; derived, never authoritative.
    pub content_normalized: String,
    pub category: String,
    pub tags: Vec<String>,
    pub author: Option<String>,
    /// A URL or path back to the origin.
    pub reference: String,
    /// Origin label, e.g. `"local"`, `"object-store"`, `"repository"`.
    pub source: String,
    pub file_path: String,
    pub word_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub indexed_at: i64,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

/// Output of the Query Preprocessor.
#[derive(Debug, Clone, Default)]
pub struct ProcessedQuery {
    pub original: String,
    pub normalized: String,
    pub terms: Vec<String>,
    pub cjk_text: String,
    pub alpha_numeric: String,
    pub language: Language,
    /// Digit+currency/unit substrings used to build phrase-match boosts.
    pub critical_phrases: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Cjk,
    Latin,
    Mixed,
    #[default]
    Unknown,
}

/// One fusion-engine output record.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredDoc {
    pub id: String,
    pub score: f64,
    pub bm25_score: Option<f64>,
    pub vector_score: Option<f64>,
    pub fused_score: f64,
    pub source: serde_json::Value,
    pub index: usize,
    pub rank: usize,
    pub search_type: SearchType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Bm25,
    Vector,
    Hybrid,
    UrlExactMatch,
}

/// Per-run progress state, exclusively owned and mutated by the Run Controller.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub run_id: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub state: RunLifecycle,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub current_file: Option<String>,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunLifecycle {
    Idle,
    Running,
    Waiting,
    Stopping,
    Error,
}

impl RunState {
    pub fn idle(dry_run: bool) -> Self {
        Self {
            run_id: String::new(),
            started_at: 0,
            ended_at: None,
            state: RunLifecycle::Idle,
            total: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            current_file: None,
            errors: Vec::new(),
            dry_run,
        }
    }
}

/// Result of one Dual Indexer pass, tallying both backends independently.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingResult {
    pub total: u64,
    pub fulltext_succeeded: u64,
    pub fulltext_failed: u64,
    pub vector_succeeded: u64,
    pub vector_failed: u64,
    pub both_succeeded: u64,
    pub partial_succeeded: u64,
    pub both_failed: u64,
    pub errors: Vec<String>,
}
