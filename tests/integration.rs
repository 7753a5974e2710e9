//! Black-box CLI tests driving the `ctx` binary end to end: init, sync
//! (full and incremental), dry-run, and search, against a throwaway
//! filesystem connector and SQLite database.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ctx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ctx");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.csv"),
        "name,note\nwidget,deployment and infrastructure notes\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/ctx.sqlite"

[run]
follow_interval_secs = 300

[connectors.filesystem.docs]
root = "{root}/files"
include_globs = ["**/*.md", "**/*.csv"]
"#,
        root = root.display(),
    );

    let config_path = config_dir.join("ctx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ctx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ctx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run ctx binary at {:?}: {}", binary, e));

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn init_creates_database() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_ctx(&config_path, &["init"]);
    assert!(success, "init failed: stdout={} stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    assert!(run_ctx(&config_path, &["init"]).2);
    assert!(run_ctx(&config_path, &["init"]).2, "second init should not fail");
}

#[test]
fn sync_indexes_every_recognized_file() {
    let (_tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);

    let (stdout, stderr, success) = run_ctx(&config_path, &["sync"]);
    assert!(success, "sync failed: stdout={} stderr={}", stdout, stderr);
    assert!(stdout.contains("processed: 3"), "stdout={}", stdout);
    // Embeddings are disabled in this fixture's config, so the vector leg of
    // every file fails and only the full-text write succeeds.
    assert!(stdout.contains("partial: 3"), "stdout={}", stdout);
    assert!(stdout.contains("full-text: 3 ok"), "stdout={}", stdout);
}

#[test]
fn sync_is_idempotent_on_an_unchanged_corpus() {
    let (_tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync"]);

    // Hash idempotence: the second run sees no new/modified files.
    let (stdout, _, success) = run_ctx(&config_path, &["sync"]);
    assert!(success);
    assert!(stdout.contains("processed: 0"), "stdout={}", stdout);
}

#[test]
fn sync_reprocesses_only_a_modified_file() {
    let (tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync"]);

    fs::write(
        tmp.path().join("files").join("alpha.md"),
        "# Alpha Document Updated\n\nThis file now says something else entirely.",
    )
    .unwrap();

    let (stdout, _, success) = run_ctx(&config_path, &["sync"]);
    assert!(success);
    assert!(stdout.contains("processed: 1"), "stdout={}", stdout);
}

#[test]
fn sync_dry_run_reports_counts_without_writing() {
    let (_tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);

    let (stdout, _, success) = run_ctx(&config_path, &["sync", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("processed: 3"), "stdout={}", stdout);

    // Nothing was written to the hash store, so a non-dry-run sync still
    // sees all three files as new.
    let (stdout, _, _) = run_ctx(&config_path, &["sync"]);
    assert!(stdout.contains("processed: 3"), "stdout={}", stdout);
}

#[test]
fn search_finds_indexed_content_by_keyword() {
    let (_tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync"]);

    let (stdout, stderr, success) = run_ctx(&config_path, &["search", "Rust programming"]);
    assert!(success, "search failed: stdout={} stderr={}", stdout, stderr);
    assert!(stdout.contains("\"search_method\""));
    assert!(stdout.to_lowercase().contains("alpha"), "stdout={}", stdout);
}

#[test]
fn search_is_deterministic_across_repeated_runs() {
    let (_tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync"]);

    let (stdout1, _, _) = run_ctx(&config_path, &["search", "document"]);
    let (stdout2, _, _) = run_ctx(&config_path, &["search", "document"]);
    assert_eq!(stdout1, stdout2, "fusion output must be bit-identical across runs");
}

#[test]
fn search_with_no_matching_terms_returns_an_empty_result_not_an_error() {
    let (_tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync"]);

    let (stdout, stderr, success) = run_ctx(&config_path, &["search", "xyznonexistentterm"]);
    assert!(success, "stdout={} stderr={}", stdout, stderr);
    assert!(stdout.contains("\"results\": []"), "stdout={}", stdout);
}

#[test]
fn stats_reports_a_count_per_source_kind() {
    let (_tmp, config_path) = setup_test_env();
    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync"]);

    let (stdout, _, success) = run_ctx(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("local: 3 indexed document(s)"), "stdout={}", stdout);
}
