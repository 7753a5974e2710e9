//! Control Plane RPC: a Unix-domain-socket, newline-delimited
//! JSON-RPC 2.0 server exposing `status.get`, `progress.get`, and
//! `control.stop` to other processes on the host.
//!
//! Single-instance enforcement is an exclusive advisory lock on the PID file
//! ([`fs2`]), held for the process's lifetime; a second `ctx follow`
//! invocation fails fast with a `Busy`-classified error instead of racing
//! the first for the socket. A socket left behind by a crashed prior
//! instance is stale by definition once this instance holds the lock, so it
//! is removed unconditionally before binding.
//!
//! `control.stop`'s `force` flag is accepted for forward compatibility with
//! callers that distinguish graceful from immediate shutdown, but both
//! currently map to the same cooperative cancellation: the in-flight file
//! finishes, then the cycle returns.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::errors::{classify, jsonrpc_code, ErrorKind};
use crate::models::RunLifecycle;
use crate::run_controller::RunController;

const READ_DEADLINE: Duration = Duration::from_secs(30);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    #[serde(default)]
    jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcErrorBody>,
    id: Value,
}

#[derive(Debug, Serialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Holds the PID-file lock for the process's lifetime. Dropping it releases
/// the lock and removes the control socket, so a clean shutdown never leaves
/// a stale socket for the next instance to trip over.
pub struct InstanceLock {
    _file: File,
    socket_path: PathBuf,
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Acquires the single-instance lock, failing with a message [`crate::errors::classify`]
/// maps to [`ErrorKind::Busy`] if another process already holds it.
pub fn acquire_instance_lock(pid_path: &Path, socket_path: &Path) -> Result<InstanceLock> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(pid_path)
        .with_context(|| format!("failed to open pid file {}", pid_path.display()))?;

    if file.try_lock_exclusive().is_err() {
        anyhow::bail!("another_instance_running: {} is already locked", pid_path.display());
    }

    // This instance now holds the only lock; any socket on disk is stale.
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }

    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;

    Ok(InstanceLock {
        _file: file,
        socket_path: socket_path.to_path_buf(),
    })
}

/// Serves the control plane until `shutdown` fires. `controller` is shared
/// with the run-controller's own driver loop so RPC handlers can read live
/// progress and request a stop.
pub async fn serve(socket_path: &Path, controller: Arc<RunController>, shutdown: CancellationToken) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind control socket {}", socket_path.display()))?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let controller = controller.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &controller).await {
                        eprintln!("control connection error: {}", e);
                    }
                });
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

async fn handle_connection(stream: UnixStream, controller: &RunController) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut line = String::new();
        let n = match tokio::time::timeout(READ_DEADLINE, reader.read_line(&mut line)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(()), // idle past the read deadline; drop the connection
        };
        if n == 0 {
            return Ok(()); // peer closed
        }

        let response = dispatch(&line, controller);
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        tokio::time::timeout(WRITE_DEADLINE, write_half.write_all(&out)).await??;
    }
}

fn dispatch(line: &str, controller: &RunController) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(line.trim()) {
        Ok(r) => r,
        Err(e) => {
            return RpcResponse {
                jsonrpc: "2.0",
                result: None,
                error: Some(RpcErrorBody {
                    code: jsonrpc_code(ErrorKind::Validation),
                    message: format!("invalid request: {}", e),
                }),
                id: Value::Null,
            }
        }
    };

    let id = request.id.clone();
    match request.method.as_str() {
        "status.get" => {
            let snapshot = controller.state_handle().snapshot();
            ok_response(
                id,
                serde_json::json!({
                    "state": snapshot.state,
                    "started_at": if snapshot.started_at > 0 { Some(snapshot.started_at) } else { None },
                    "error": snapshot.errors.first(),
                    "pid": std::process::id(),
                    "version": env!("CARGO_PKG_VERSION"),
                    "dry_run": snapshot.dry_run,
                }),
            )
        }
        "progress.get" => {
            let snapshot = controller.state_handle().snapshot();
            let elapsed_s = if snapshot.started_at > 0 {
                Some((chrono::Utc::now().timestamp() - snapshot.started_at).max(0))
            } else {
                None
            };
            let percent = if snapshot.total > 0 {
                (snapshot.processed as f64 / snapshot.total as f64) * 100.0
            } else {
                0.0
            };
            let files_per_s = match elapsed_s {
                Some(e) if e > 0 => Some(snapshot.processed as f64 / e as f64),
                _ => None,
            };
            let eta_s = match (files_per_s, snapshot.total.checked_sub(snapshot.processed)) {
                (Some(rate), Some(remaining)) if rate > 0.0 => Some(remaining as f64 / rate),
                _ => None,
            };
            ok_response(
                id,
                serde_json::json!({
                    "total": snapshot.total,
                    "processed": snapshot.processed,
                    "succeeded": snapshot.succeeded,
                    "failed": snapshot.failed,
                    "current_file": snapshot.current_file,
                    "percent": percent,
                    "files_per_s": files_per_s,
                    "eta_s": eta_s,
                    "elapsed_s": elapsed_s,
                }),
            )
        }
        "control.stop" => {
            let force = request.params.get("force").and_then(Value::as_bool).unwrap_or(false);
            let already_stopping = controller.state_handle().snapshot().state == RunLifecycle::Stopping;
            if already_stopping {
                ok_response(
                    id,
                    serde_json::json!({ "acknowledged": false, "message": "already stopping" }),
                )
            } else {
                controller.request_stop();
                ok_response(
                    id,
                    serde_json::json!({ "acknowledged": true, "message": format!("stop requested (force={})", force) }),
                )
            }
        }
        other => {
            let err = anyhow::anyhow!("not found: unknown method '{}'", other);
            error_response(id, classify(&err), err.to_string())
        }
    }
}

/// Sends a single JSON-RPC request to a running instance's control socket
/// and returns its `result` (or an error for a JSON-RPC error response).
/// Used by the `ctx status` / `ctx stop` CLI commands.
pub async fn call(socket_path: &Path, method: &str, params: Value) -> Result<Value> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to control socket {}", socket_path.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let mut line = serde_json::to_vec(&request)?;
    line.push(b'\n');
    write_half.write_all(&line).await?;

    let mut response = String::new();
    reader.read_line(&mut response).await?;

    let parsed: Value = serde_json::from_str(response.trim())?;
    if let Some(error) = parsed.get("error") {
        anyhow::bail!("rpc error: {}", error);
    }
    Ok(parsed.get("result").cloned().unwrap_or(Value::Null))
}

fn ok_response(id: Value, result: Value) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        result: Some(result),
        error: None,
        id,
    }
}

fn error_response(id: Value, kind: ErrorKind, message: String) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        result: None,
        error: Some(RpcErrorBody {
            code: jsonrpc_code(kind),
            message,
        }),
        id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        toml::from_str(
            r#"
            [db]
            path = "/tmp/ctx-rpc-test.sqlite"
            [connectors.filesystem.docs]
            root = "/tmp"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn unknown_method_maps_to_not_found() {
        let controller = RunController::new(test_config());
        let line = r#"{"jsonrpc":"2.0","method":"bogus.call","id":1}"#;
        let response = dispatch(line, &controller);
        assert!(response.error.is_some());
        assert_eq!(response.error.unwrap().code, jsonrpc_code(ErrorKind::NotFound));
    }

    #[test]
    fn status_get_returns_idle_state_initially() {
        let controller = RunController::new(test_config());
        let line = r#"{"jsonrpc":"2.0","method":"status.get","id":1}"#;
        let response = dispatch(line, &controller);
        assert!(response.result.is_some());
        assert_eq!(response.result.unwrap()["state"], "idle");
    }

    #[test]
    fn control_stop_marks_state_stopping() {
        let controller = RunController::new(test_config());
        let line = r#"{"jsonrpc":"2.0","method":"control.stop","params":{"force":false},"id":1}"#;
        let response = dispatch(line, &controller);
        assert!(response.result.is_some());
        assert_eq!(controller.state_handle().snapshot().state, crate::models::RunLifecycle::Stopping);
    }

    #[test]
    fn malformed_request_is_a_validation_error() {
        let controller = RunController::new(test_config());
        let response = dispatch("not json", &controller);
        assert!(response.error.is_some());
        assert_eq!(response.error.unwrap().code, jsonrpc_code(ErrorKind::Validation));
    }

    #[test]
    fn acquire_instance_lock_rejects_a_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("ctx.pid");
        let socket_path = dir.path().join("ctx.sock");

        let first = acquire_instance_lock(&pid_path, &socket_path).unwrap();
        let second = acquire_instance_lock(&pid_path, &socket_path);
        assert!(second.is_err());
        drop(first);
    }
}
