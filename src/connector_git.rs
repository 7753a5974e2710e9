//! Repository scanner.
//!
//! Performs a shallow fetch (depth 1) of the default revision into a
//! caller-scoped temporary directory, released on all exit paths via
//! [`tempfile::TempDir`]'s `Drop`. Authentication uses an optional bearer
//! token sent as HTTP Basic with a well-known synthetic username. The
//! `.git` subtree is skipped. Paths in emitted [`FileDescriptor`]s take the
//! form `<scheme>://owner/repo/relpath`.
//!
//! Branch or revision selection is out of scope:
//! the default branch is always used, and the synthesized reference URL
//! assumes `main` — cosmetically wrong for repositories whose default
//! branch differs, but retrieval correctness is unaffected.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::config::GitConnectorConfig;
use crate::models::{FileDescriptor, SourceKind};
use crate::scanner::{classify_extension, ScanContext, Scanner};

/// Synthetic username paired with the bearer token for HTTP Basic auth,
/// following the convention used by hosted Git providers for token auth.
const TOKEN_USERNAME: &str = "x-access-token";

pub struct GitConnector {
    name: String,
    config: GitConnectorConfig,
    owner: String,
    repo: String,
    token: Option<String>,
}

impl GitConnector {
    /// Construct a Git connector instance. Fails here, not at scan time, if
    /// `url` does not resolve to an `owner/repo` pair.
    pub fn new(name: String, config: GitConnectorConfig, token: Option<String>) -> Result<Self> {
        let (owner, repo) = parse_owner_repo(&config.url)
            .with_context(|| format!("could not derive owner/repo from url '{}'", config.url))?;
        Ok(Self {
            name,
            config,
            owner,
            repo,
            token,
        })
    }
}

#[async_trait]
impl Scanner for GitConnector {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Repository
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, _ctx: &ScanContext) -> Result<Vec<FileDescriptor>> {
        scan_git(&self.config, &self.owner, &self.repo, self.token.as_deref())
    }
}

/// Extract `(owner, repo)` from a Git remote URL (`https://host/owner/repo.git`
/// or `git@host:owner/repo.git`).
fn parse_owner_repo(url: &str) -> Result<(String, String)> {
    let trimmed = url.trim_end_matches(".git").trim_end_matches('/');
    let tail = if let Some(rest) = trimmed.split_once("://") {
        rest.1
    } else if let Some((_, rest)) = trimmed.split_once(':') {
        rest
    } else {
        trimmed
    };
    let mut parts: Vec<&str> = tail.rsplit('/').collect();
    if parts.len() < 2 {
        bail!("url '{}' does not contain an owner/repo path", url);
    }
    let repo = parts.remove(0);
    let owner = parts.remove(0);
    if owner.is_empty() || repo.is_empty() {
        bail!("url '{}' has an empty owner or repo segment", url);
    }
    Ok((owner.to_string(), repo.to_string()))
}

/// Shallow-clone the default branch into a scoped temp directory, walk the
/// configured `root` subdirectory, and release the clone on return.
pub fn scan_git(
    git_config: &GitConnectorConfig,
    owner: &str,
    repo: &str,
    token: Option<&str>,
) -> Result<Vec<FileDescriptor>> {
    let tmp = TempDir::new().context("failed to create scoped temp directory for git clone")?;
    let clone_dir = tmp.path();

    git_shallow_clone(&git_config.url, clone_dir, token)?;

    let scan_root = if git_config.root == "." {
        clone_dir.to_path_buf()
    } else {
        clone_dir.join(&git_config.root)
    };
    if !scan_root.exists() {
        bail!(
            "repository root '{}' does not exist in {}/{}",
            git_config.root,
            owner,
            repo
        );
    }

    let include_set = build_globset(&git_config.include_globs)?;
    let mut default_excludes = vec!["**/.git/**".to_string(), "**/node_modules/**".to_string()];
    default_excludes.extend(git_config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut items = Vec::new();
    for entry in WalkDir::new(&scan_root) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                eprintln!("warning: skipping repository entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(clone_dir).unwrap_or(path);
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
            eprintln!("warning: skipping unreadable repository file: {}", path.display());
            continue;
        };
        let metadata = std::fs::metadata(path)?;
        let mtime = metadata
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        // Relative-to-repo-root path for the `relpath` component; strip the
        // configured `root` prefix so `<scheme>://owner/repo/relpath` stays
        // rooted at the repository, not the configured subdirectory.
        let repo_relpath = path.strip_prefix(&scan_root).unwrap_or(path).to_string_lossy().to_string();

        let content_hash = FileDescriptor::compute_hash(&content);
        items.push(FileDescriptor {
            source_kind: SourceKind::Repository,
            path: format!("repository://{}/{}/{}", owner, repo, repo_relpath),
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
    // `tmp` drops here, removing the scoped clone on every exit path including errors above.
    Ok(items)
}

fn git_shallow_clone(url: &str, dest: &Path, token: Option<&str>) -> Result<()> {
    let auth_url = match token {
        Some(t) if url.starts_with("https://") => {
            let rest = url.trim_start_matches("https://");
            format!("https://{}:{}@{}", TOKEN_USERNAME, t, rest)
        }
        _ => url.to_string(),
    };

    let output = Command::new("git")
        .args(["clone", "--depth", "1", "--single-branch"])
        .arg(&auth_url)
        .arg(dest)
        .output()
        .context("failed to execute 'git clone'. Is git installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("git clone failed: {}", stderr.trim()));
    }
    Ok(())
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

    #[test]
    fn parses_owner_repo_from_https_url() {
        assert_eq!(
            parse_owner_repo("https://github.com/acme/platform.git").unwrap(),
            ("acme".to_string(), "platform".to_string())
        );
    }

    #[test]
    fn parses_owner_repo_from_ssh_url() {
        assert_eq!(
            parse_owner_repo("git@github.com:acme/platform.git").unwrap(),
            ("acme".to_string(), "platform".to_string())
        );
    }

    #[test]
    fn rejects_url_without_owner_repo() {
        assert!(parse_owner_repo("https://github.com/").is_err());
    }
}
