//! Local filesystem scanner.
//!
//! Walks a directory root depth-first; symbolic links are not followed
//! unless configured otherwise. Only files whose name ends in a recognized
//! markdown or tabular extension are emitted.

use anyhow::{bail, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::FilesystemConnectorConfig;
use crate::models::{FileDescriptor, SourceKind};
use crate::scanner::{classify_extension, ScanContext, Scanner};

pub struct FilesystemConnector {
    name: String,
    config: FilesystemConnectorConfig,
}

impl FilesystemConnector {
    pub fn new(name: String, config: FilesystemConnectorConfig) -> Self {
        Self { name, config }
    }
}

#[async_trait]
impl Scanner for FilesystemConnector {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Local
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, _ctx: &ScanContext) -> Result<Vec<FileDescriptor>> {
        scan_filesystem(&self.config)
    }
}

/// Walk the configured `root`, apply include/exclude globs, and read every
/// matching file. Per-entry I/O errors are logged and skipped; a missing
/// root aborts the scan.
pub fn scan_filesystem(fs_config: &FilesystemConnectorConfig) -> Result<Vec<FileDescriptor>> {
    let root = &fs_config.root;
    if !root.exists() {
        bail!(
            "Filesystem connector root does not exist: {}",
            root.display()
        );
    }

    let include_set = build_globset(&fs_config.include_globs)?;
    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(fs_config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut items = Vec::new();
    let walker = WalkDir::new(root).follow_links(fs_config.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                eprintln!("warning: skipping entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let Some((is_markdown, is_tabular)) = classify_extension(&name) else {
            continue;
        };

        let Ok(content) = std::fs::read_to_string(path) else {
            eprintln!("warning: skipping unreadable file: {}", path.display());
            continue;
        };
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                eprintln!("warning: skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let mtime = metadata
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let content_hash = FileDescriptor::compute_hash(&content);
        items.push(FileDescriptor {
            source_kind: SourceKind::Local,
            path: path.to_string_lossy().to_string(),
            name,
            size: metadata.len(),
            mtime,
            is_markdown,
            is_tabular,
            content,
            content_hash,
        });
    }

    items.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(items)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn scans_markdown_and_skips_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let md_path = dir.path().join("a.md");
        std::fs::File::create(&md_path)
            .unwrap()
            .write_all(b"# Title\ncontent")
            .unwrap();
        std::fs::File::create(dir.path().join("b.png"))
            .unwrap()
            .write_all(b"binary")
            .unwrap();

        let config = FilesystemConnectorConfig {
            root: dir.path().to_path_buf(),
            include_globs: vec!["**/*".to_string()],
            exclude_globs: vec![],
            follow_symlinks: false,
        };
        let items = scan_filesystem(&config).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "a.md");
        assert!(items[0].is_markdown);
        assert_eq!(
            items[0].content_hash,
            FileDescriptor::compute_hash("# Title\ncontent")
        );
    }
}
