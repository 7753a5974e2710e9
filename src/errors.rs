//! Error-kind classification shared by the retry policy and the control-plane RPC.
//!
//! Application code returns `anyhow::Result` throughout, matching the rest of
//! the crate; [`classify`] inspects an error after the fact to decide whether
//! it is retryable and, at the RPC boundary, which JSON-RPC code to surface.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: empty query, bad interval, missing index name. Terminal.
    Validation,
    /// Hash record missing (treated as empty, not an error) or backend index
    /// missing for a read (an error).
    NotFound,
    /// Connection reset, timeout, rate-limit, backend 5xx. Retryable.
    Transient,
    /// Mapping/schema mismatch, auth failure, non-retryable 4xx.
    Permanent,
    /// One of two search legs failed; the other's results are still usable.
    PartialResult,
    /// Control-plane socket exists but no process holds the lock.
    Stale,
    /// A second instance was detected at startup.
    Busy,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::PartialResult => "partial_result",
            ErrorKind::Stale => "stale",
            ErrorKind::Busy => "busy",
        };
        write!(f, "{}", s)
    }
}

/// Classifies an error by substring match over its rendered message.
///
/// This is deliberately a last-resort heuristic: backend clients in this
/// crate (reqwest, sqlx, git subprocess) don't expose structured retryable
/// flags, so the retry loop in [`crate::indexer`] and the RPC error mapping
/// in [`crate::rpc`] both fall back to matching well-known substrings. A
/// backend client with structured error kinds should be classified on those
/// instead, before falling back to this.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    let msg = err.to_string().to_lowercase();

    if msg.contains("another_instance_running") || msg.contains("already running") {
        return ErrorKind::Busy;
    }
    if msg.contains("not found") || msg.contains("no such") {
        return ErrorKind::NotFound;
    }
    if msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("connection reset")
        || msg.contains("connection refused")
        || msg.contains("rate limit")
        || msg.contains("429")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("504")
    {
        return ErrorKind::Transient;
    }
    if msg.contains("unauthorized")
        || msg.contains("forbidden")
        || msg.contains("authentication")
        || msg.contains("401")
        || msg.contains("403")
        || msg.contains("mapping")
        || msg.contains("schema")
    {
        return ErrorKind::Permanent;
    }
    if msg.is_empty() || msg.contains("invalid") || msg.contains("must not be empty") {
        return ErrorKind::Validation;
    }

    ErrorKind::Permanent
}

pub fn is_retryable(err: &anyhow::Error) -> bool {
    matches!(classify(err), ErrorKind::Transient)
}

/// JSON-RPC 2.0 error code for a given [`ErrorKind`], used by [`crate::rpc`].
pub fn jsonrpc_code(kind: ErrorKind) -> i64 {
    match kind {
        ErrorKind::Validation => -32602,
        ErrorKind::NotFound => -1001,
        ErrorKind::Busy => -1002,
        _ => -32603,
    }
}
