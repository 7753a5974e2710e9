//! Source Scanners: one per source kind, each producing a uniform
//! [`FileDescriptor`] stream.

use async_trait::async_trait;

use crate::models::{FileDescriptor, SourceKind};

/// Extensions a scanner recognizes as markdown or tabular content, shared by
/// all three scanner implementations.
pub const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown", "mdx"];
pub const TABULAR_EXTENSIONS: &[&str] = &["csv", "tsv"];

pub fn classify_extension(name: &str) -> Option<(bool /* markdown */, bool /* tabular */)> {
    let ext = name.rsplit('.').next()?.to_ascii_lowercase();
    if MARKDOWN_EXTENSIONS.contains(&ext.as_str()) {
        Some((true, false))
    } else if TABULAR_EXTENSIONS.contains(&ext.as_str()) {
        Some((false, true))
    } else {
        None
    }
}

/// Cancellation context passed to a scan; currently carries a deadline. Kept
/// as its own type (rather than a bare `Duration`) so scanners can be
/// extended with per-call cancellation without changing the trait surface.
#[derive(Debug, Clone, Copy)]
pub struct ScanContext {
    pub deadline: Option<std::time::Instant>,
}

impl ScanContext {
    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.map(|d| std::time::Instant::now() >= d).unwrap_or(false)
    }
}

#[async_trait]
pub trait Scanner: Send + Sync {
    fn source_kind(&self) -> SourceKind;
    /// Human-readable instance name, used in logs and the `sources` report.
    fn name(&self) -> &str;
    /// Walks the source tree and returns every recognized file. Per-entry
    /// I/O errors are logged and skipped; scan-wide errors (auth failure,
    /// missing bucket) propagate and abort the scan.
    async fn scan(&self, ctx: &ScanContext) -> anyhow::Result<Vec<FileDescriptor>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_markdown_and_tabular_extensions() {
        assert_eq!(classify_extension("a.md"), Some((true, false)));
        assert_eq!(classify_extension("a.MD"), Some((true, false)));
        assert_eq!(classify_extension("a.csv"), Some((false, true)));
        assert_eq!(classify_extension("a.png"), None);
        assert_eq!(classify_extension("no_extension"), None);
    }
}
