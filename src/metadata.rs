//! Metadata Extractor: derives [`DocumentMetadata`] from `(content, origin-context)`.
//!
//! Precedence for every field is frontmatter > heading/structural inference >
//! path- or source-derived default. Only unrecoverable frontmatter syntax is
//! an error; partial frontmatter (missing keys) is tolerated.

use anyhow::Result;
use serde::Deserialize;

use crate::models::{DocumentMetadata, SourceKind};

#[derive(Debug, thiserror::Error)]
#[error("could not parse frontmatter: {0}")]
pub struct MetadataParseError(String);

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    title: Option<String>,
    category: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    author: Option<String>,
    reference: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

/// Context describing where a file came from, used for source-derived defaults.
pub struct OriginContext<'a> {
    pub source_kind: SourceKind,
    /// Path relative to the source root (e.g. repo-relative path, or object key).
    pub relative_path: &'a str,
    pub file_stem: &'a str,
    pub mtime: i64,
    /// `(owner, repo)` for repository sources.
    pub repo_owner_name: Option<(&'a str, &'a str)>,
    /// Pre-synthesized web/canonical reference URL for this file.
    pub reference: &'a str,
}

/// Splits a leading `---\n...\n---` YAML block off `content`, returning the
/// parsed frontmatter (if any) and the remaining body.
fn split_frontmatter(content: &str) -> Result<(Option<Frontmatter>, &str), MetadataParseError> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        return Ok((None, content));
    }

    let after_open = &trimmed[3..];
    let Some(end) = after_open.find("\n---") else {
        // Opens a frontmatter block but never closes it: tolerate as "no frontmatter"
        // rather than failing the whole extraction.
        return Ok((None, content));
    };

    let yaml_block = &after_open[..end];
    let body_start = after_open[end + 4..].trim_start_matches(['\r', '\n']);

    let fm: Frontmatter = serde_yaml::from_str(yaml_block)
        .map_err(|e| MetadataParseError(e.to_string()))?;

    Ok((Some(fm), body_start))
}

/// First top-level Markdown heading (`# ...`), if any.
fn first_heading(body: &str) -> Option<String> {
    for line in body.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("# ") {
            return Some(rest.trim().to_string());
        }
    }
    None
}

pub fn extract_metadata(content: &str, ctx: &OriginContext) -> Result<DocumentMetadata> {
    let (fm, body) = match split_frontmatter(content) {
        Ok(v) => v,
        Err(e) => anyhow::bail!(e),
    };

    let title = fm
        .as_ref()
        .and_then(|f| f.title.clone())
        .or_else(|| first_heading(body))
        .unwrap_or_else(|| ctx.file_stem.to_string());

    let category = fm
        .as_ref()
        .and_then(|f| f.category.clone())
        .unwrap_or_else(|| default_category(ctx));

    let tags = fm
        .as_ref()
        .filter(|f| !f.tags.is_empty())
        .map(|f| f.tags.clone())
        .unwrap_or_else(|| default_tags(ctx));

    let author = fm
        .as_ref()
        .and_then(|f| f.author.clone())
        .or_else(|| ctx.repo_owner_name.map(|(owner, _)| owner.to_string()));

    let reference = fm
        .as_ref()
        .and_then(|f| f.reference.clone())
        .unwrap_or_else(|| ctx.reference.to_string());

    let created_at = fm
        .as_ref()
        .and_then(|f| f.created_at.as_deref())
        .and_then(parse_ts)
        .or(Some(ctx.mtime));

    let updated_at = fm
        .as_ref()
        .and_then(|f| f.updated_at.as_deref())
        .and_then(parse_ts)
        .or(Some(ctx.mtime));

    Ok(DocumentMetadata {
        title,
        category,
        tags,
        author,
        reference,
        created_at,
        updated_at,
    })
}

fn default_category(ctx: &OriginContext) -> String {
    match ctx.source_kind {
        SourceKind::Repository => {
            let mut parts = ctx.relative_path.rsplitn(2, '/');
            let _file = parts.next();
            match parts.next() {
                Some(dir) => dir
                    .rsplit('/')
                    .next()
                    .unwrap_or("general")
                    .to_string(),
                None => "general".to_string(),
            }
        }
        SourceKind::Local | SourceKind::ObjectStore => {
            let mut parts = ctx.relative_path.rsplitn(2, '/');
            let _file = parts.next();
            parts
                .next()
                .and_then(|dir| dir.rsplit('/').next())
                .unwrap_or("general")
                .to_string()
        }
    }
}

fn default_tags(ctx: &OriginContext) -> Vec<String> {
    match ctx.repo_owner_name {
        Some((owner, repo)) => vec![owner.to_string(), repo.to_string()],
        None => Vec::new(),
    }
}

/// Accepts RFC3339 and a bare `YYYY-MM-DD` date for backward compatibility,
/// mirroring the Hash Store's two-format timestamp tolerance.
fn parse_ts(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(relative_path: &'a str, file_stem: &'a str, reference: &'a str) -> OriginContext<'a> {
        OriginContext {
            source_kind: SourceKind::Local,
            relative_path,
            file_stem,
            mtime: 1_700_000_000,
            repo_owner_name: None,
            reference,
        }
    }

    #[test]
    fn frontmatter_title_wins_over_heading_and_filename() {
        let content = "---\ntitle: From Frontmatter\n---\n# Heading Title\nbody";
        let c = ctx("docs/a.md", "a", "file:///docs/a.md");
        let md = extract_metadata(content, &c).unwrap();
        assert_eq!(md.title, "From Frontmatter");
    }

    #[test]
    fn heading_wins_over_filename_when_no_frontmatter() {
        let content = "# Heading Title\nbody";
        let c = ctx("docs/a.md", "a", "file:///docs/a.md");
        let md = extract_metadata(content, &c).unwrap();
        assert_eq!(md.title, "Heading Title");
    }

    #[test]
    fn filename_stem_is_last_resort() {
        let content = "just a body, no heading";
        let c = ctx("docs/a.md", "a", "file:///docs/a.md");
        let md = extract_metadata(content, &c).unwrap();
        assert_eq!(md.title, "a");
    }

    #[test]
    fn partial_frontmatter_is_tolerated() {
        let content = "---\ntitle: Only Title\n---\nbody";
        let c = ctx("docs/a.md", "a", "file:///docs/a.md");
        let md = extract_metadata(content, &c).unwrap();
        assert_eq!(md.title, "Only Title");
        assert!(md.tags.is_empty());
    }

    #[test]
    fn repo_category_is_last_relative_directory() {
        let c = OriginContext {
            source_kind: SourceKind::Repository,
            relative_path: "guides/setup/install.md",
            file_stem: "install",
            mtime: 0,
            repo_owner_name: Some(("acme", "widgets")),
            reference: "https://github.com/acme/widgets/blob/main/guides/setup/install.md",
        };
        let md = extract_metadata("body with no frontmatter", &c).unwrap();
        assert_eq!(md.category, "setup");
        assert_eq!(md.tags, vec!["acme".to_string(), "widgets".to_string()]);
        assert_eq!(md.author.as_deref(), Some("acme"));
    }

    #[test]
    fn repo_root_file_category_is_general() {
        let c = OriginContext {
            source_kind: SourceKind::Repository,
            relative_path: "README.md",
            file_stem: "README",
            mtime: 0,
            repo_owner_name: Some(("acme", "widgets")),
            reference: "https://github.com/acme/widgets/blob/main/README.md",
        };
        let md = extract_metadata("no heading here", &c).unwrap();
        assert_eq!(md.category, "general");
    }
}
