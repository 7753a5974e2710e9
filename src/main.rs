//! `ctx` — command-line entry point for context-harness.
//!
//! Every subcommand here is a thin wrapper over a library module:
//! `sync`/`follow` drive [`run_controller`], `search` drives
//! [`search::SearchEngine`], `status`/`stop` talk to a running instance's
//! control socket via [`rpc::call`].

mod backends;
mod change_detector;
mod config;
mod connector_fs;
mod connector_git;
mod connector_s3;
mod db;
mod embedding;
mod errors;
mod fusion;
mod hash_store;
mod indexer;
mod ingest;
mod metadata;
mod migrate;
mod models;
mod query_preprocessor;
mod ratelimit;
mod rpc;
mod run_controller;
mod scanner;
mod search;
mod url_detector;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use config::Config;
use models::SourceKind;
use run_controller::RunController;

#[derive(Parser)]
#[command(
    name = "ctx",
    about = "Ingests documents into a hybrid BM25 + vector index and serves fused retrieval",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/ctx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Run one ingestion cycle: scan, detect changes, index, report
    Sync {
        /// Restrict to one connector instance name or source kind (local/repository/object-store)
        #[arg(long)]
        source: Option<String>,

        /// Compute changes and print counts without writing to either backend
        #[arg(long)]
        dry_run: bool,
    },

    /// Run ingestion on a fixed interval until interrupted (SIGINT/SIGTERM)
    Follow {
        #[arg(long)]
        source: Option<String>,
    },

    /// Run a hybrid search against the configured index
    Search {
        query: String,
        #[arg(long)]
        size: Option<i64>,
        #[arg(long)]
        k: Option<i64>,
        #[arg(long)]
        fusion_method: Option<String>,
    },

    /// Print hash-store counts per source kind
    Stats,

    /// Query a running instance's control-plane socket for its current state
    Status,

    /// Request that a running instance stop after its current file
    Stop {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("database initialized");
        }
        Commands::Sync { source, dry_run } => {
            run_sync(&cfg, source.as_deref(), dry_run).await?;
        }
        Commands::Follow { source } => {
            run_follow(&cfg, source.as_deref()).await?;
        }
        Commands::Search {
            query,
            size,
            k,
            fusion_method,
        } => {
            run_search(&cfg, query, size, k, fusion_method).await?;
        }
        Commands::Stats => {
            run_stats(&cfg).await?;
        }
        Commands::Status => {
            let socket_path = config::resolve_socket_path(&cfg);
            let result = rpc::call(&socket_path, "status.get", serde_json::json!({})).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Stop { force } => {
            let socket_path = config::resolve_socket_path(&cfg);
            let result = rpc::call(&socket_path, "control.stop", serde_json::json!({ "force": force })).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

async fn run_sync(cfg: &Config, source: Option<&str>, dry_run: bool) -> anyhow::Result<()> {
    let controller = RunController::new(cfg.clone());
    let result = controller.run_once(source, dry_run).await?;
    print_processing_result(&result);
    Ok(())
}

/// Installs a SIGINT/SIGTERM handler that cancels `cancel`, binds the
/// control-plane RPC server, acquires the single-instance lock, and drives
/// the follow-mode loop until a shutdown signal fires. Follow mode is
/// mutually exclusive with dry-run and index-clearing operations.
async fn run_follow(cfg: &Config, source: Option<&str>) -> anyhow::Result<()> {
    let socket_path = config::resolve_socket_path(cfg);
    let pid_path = config::resolve_pid_path(cfg);

    let _lock = match rpc::acquire_instance_lock(&pid_path, &socket_path) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("another_instance_running: {}", e);
            std::process::exit(1);
        }
    };

    let controller = Arc::new(RunController::new(cfg.clone()));
    let cancel = controller.cancel_token();
    spawn_signal_handler(cancel.clone());

    let rpc_cancel = cancel.clone();
    let rpc_controller = controller.clone();
    let rpc_task = tokio::spawn(async move {
        if let Err(e) = rpc::serve(&socket_path, rpc_controller, rpc_cancel).await {
            eprintln!("control-plane RPC server error: {}", e);
        }
    });

    let follow_result = controller.run_follow(source).await;
    cancel.cancel();
    let _ = rpc_task.await;
    follow_result
}

#[cfg(unix)]
fn spawn_signal_handler(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        cancel.cancel();
    });
}

#[cfg(not(unix))]
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel.cancel();
    });
}

async fn run_search(
    cfg: &Config,
    query: String,
    size: Option<i64>,
    k: Option<i64>,
    fusion_method: Option<String>,
) -> anyhow::Result<()> {
    use backends::fulltext::SqliteFullTextBackend;
    use backends::vector::SqliteVectorBackend;

    let pool = db::connect(cfg).await?;
    migrate::migrate_pool(&pool).await?;

    let fulltext = SqliteFullTextBackend::new(pool.clone());
    let vector = SqliteVectorBackend::new(pool.clone());
    let provider = embedding::create_provider(&cfg.embedding)?;

    let mut request = search::SearchRequest::from_config(query, &cfg.retrieval);
    if let Some(size) = size {
        request.size = size;
    }
    if let Some(k) = k {
        request.k = k;
    }
    if let Some(method) = fusion_method {
        request.fusion_method = method;
    }

    let engine = search::SearchEngine::new(&fulltext, &vector, provider.as_ref(), &cfg.embedding);
    let response = engine.search(&request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    pool.close().await;
    Ok(())
}

async fn run_stats(cfg: &Config) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::migrate_pool(&pool).await?;
    let store = hash_store::HashStore::new(pool.clone());

    for kind in [SourceKind::Local, SourceKind::ObjectStore, SourceKind::Repository] {
        let all = store.get_all(std::slice::from_ref(&kind)).await?;
        println!("{}: {} indexed document(s)", kind, all.len());
    }

    pool.close().await;
    Ok(())
}

fn print_processing_result(result: &models::ProcessingResult) {
    println!("processed: {}", result.total);
    println!(
        "  both backends: {}  partial: {}  both failed: {}",
        result.both_succeeded, result.partial_succeeded, result.both_failed
    );
    println!(
        "  full-text: {} ok / {} failed  vector: {} ok / {} failed",
        result.fulltext_succeeded, result.fulltext_failed, result.vector_succeeded, result.vector_failed
    );
    if !result.errors.is_empty() {
        println!("  errors (first {}):", result.errors.len().min(5));
        for e in result.errors.iter().take(5) {
            println!("    - {}", e);
        }
    }
}
