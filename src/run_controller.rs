//! Run Controller: owns [`RunState`] exclusively, drives a
//! single run or a follow-mode loop, and enforces the lifecycle
//! `idle -> running -> (error | idle)`, with `running -> stopping -> idle`
//! on a cooperative stop request.
//!
//! Follow mode skips a cycle rather than queuing one when the previous cycle
//! is still running (compare-and-swap on an `AtomicBool`, not a mutex, so a
//! busy check never blocks); the configured interval is already validated to
//! be at least [`crate::config::MIN_FOLLOW_INTERVAL_SECS`] before this runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::ingest;
use crate::models::{ProcessingResult, RunLifecycle, RunState};

/// Shared, mutex-protected [`RunState`], mutated only through these methods.
/// Cloned cheaply (an `Arc`) so the RPC server can read a live snapshot
/// while a run is in progress.
#[derive(Clone)]
pub struct RunStateHandle {
    inner: Arc<Mutex<RunState>>,
}

impl RunStateHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunState::idle(false))),
        }
    }

    pub fn snapshot(&self) -> RunState {
        self.inner.lock().unwrap().clone()
    }

    fn start(&self, dry_run: bool, total: u64) {
        let mut s = self.inner.lock().unwrap();
        *s = RunState {
            run_id: Uuid::new_v4().to_string(),
            started_at: chrono::Utc::now().timestamp(),
            ended_at: None,
            state: RunLifecycle::Running,
            total,
            processed: 0,
            succeeded: 0,
            failed: 0,
            current_file: None,
            errors: Vec::new(),
            dry_run,
        };
    }

    pub fn set_total(&self, total: u64) {
        self.inner.lock().unwrap().total = total;
    }

    pub fn set_current_file(&self, path: Option<String>) {
        self.inner.lock().unwrap().current_file = path;
    }

    pub fn record_file(&self, succeeded: bool) {
        let mut s = self.inner.lock().unwrap();
        s.processed += 1;
        if succeeded {
            s.succeeded += 1;
        } else {
            s.failed += 1;
        }
    }

    pub fn set_state(&self, state: RunLifecycle) {
        self.inner.lock().unwrap().state = state;
    }

    fn finish(&self, errors: Vec<String>, state: RunLifecycle) {
        let mut s = self.inner.lock().unwrap();
        s.ended_at = Some(chrono::Utc::now().timestamp());
        s.state = state;
        s.current_file = None;
        s.errors = errors;
    }
}

impl Default for RunStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the busy flag, the shared [`RunState`], and a cancellation token used
/// both to interrupt a stuck cycle and to unwind the follow-mode loop.
pub struct RunController {
    config: Config,
    state: RunStateHandle,
    busy: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl RunController {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: RunStateHandle::new(),
            busy: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state_handle(&self) -> RunStateHandle {
        self.state.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cooperative stop: flips state to `Stopping` and fires the shared
    /// cancellation token. The in-flight cycle finishes its current file,
    /// then returns instead of starting another.
    pub fn request_stop(&self) {
        self.state.set_state(RunLifecycle::Stopping);
        self.cancel.cancel();
    }

    /// Runs exactly one cycle: scan, detect, index, report. Returns an error
    /// (and marks state `Error`) if a connector or the database fails
    /// outright; per-document failures are captured in [`ProcessingResult`]
    /// instead of surfacing here.
    pub async fn run_once(&self, source_filter: Option<&str>, dry_run: bool) -> Result<ProcessingResult> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("a run is already in progress");
        }
        let _guard = BusyGuard(&self.busy);

        self.state.start(dry_run, 0);
        let outcome = ingest::run_pipeline(&self.config, source_filter, dry_run, &self.cancel, Some(&self.state)).await;

        match &outcome {
            Ok(result) => {
                let final_state = if self.cancel.is_cancelled() {
                    RunLifecycle::Idle
                } else if result.both_failed > 0 && result.both_succeeded == 0 && result.partial_succeeded == 0 {
                    RunLifecycle::Error
                } else {
                    RunLifecycle::Idle
                };
                self.state.finish(result.errors.clone(), final_state);
            }
            Err(e) => {
                self.state.finish(vec![e.to_string()], RunLifecycle::Error);
            }
        }

        outcome
    }

    /// Drives the periodic follow-mode loop: marks the state `Waiting`,
    /// sleeps `follow_interval_secs`, then runs a cycle (which moves the
    /// state through `Running` and back to `Idle`/`Error`) unless one is
    /// already in progress, until `cancel` fires (typically from a
    /// SIGINT/SIGTERM handler installed by the caller); `status.get` during
    /// the sleep observes `Waiting` rather than `Idle`. Mutually exclusive
    /// with `dry_run`, enforced by the caller before this is invoked.
    pub async fn run_follow(&self, source_filter: Option<&str>) -> Result<()> {
        let interval = Duration::from_secs(self.config.run.follow_interval_secs);
        loop {
            self.state.set_state(RunLifecycle::Waiting);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => return Ok(()),
            }
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if self.busy.load(Ordering::SeqCst) {
                // Previous cycle still running; skip rather than queue.
                continue;
            }
            if let Err(e) = self.run_once(source_filter, false).await {
                eprintln!("follow cycle failed: {}", e);
            }
        }
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_handle_starts_idle() {
        let handle = RunStateHandle::new();
        assert_eq!(handle.snapshot().state, RunLifecycle::Idle);
    }

    #[tokio::test]
    async fn follow_mode_reports_waiting_between_cycles() {
        use crate::config::{Config, DbConfig, RunConfig};

        let config = Config {
            db: DbConfig { path: std::path::PathBuf::from(":memory:") },
            retrieval: Default::default(),
            embedding: Default::default(),
            run: RunConfig {
                follow_interval_secs: 3600,
                ..Default::default()
            },
            control: Default::default(),
            connectors: Default::default(),
        };

        let controller = RunController::new(config);
        let state = controller.state_handle();
        let cancel = controller.cancel_token();

        let handle = tokio::spawn(async move { controller.run_follow(None).await });
        tokio::task::yield_now().await;

        assert_eq!(state.snapshot().state, RunLifecycle::Waiting);

        cancel.cancel();
        let _ = handle.await;
    }

    #[test]
    fn record_file_updates_counters() {
        let handle = RunStateHandle::new();
        handle.start(false, 2);
        handle.record_file(true);
        handle.record_file(false);
        let s = handle.snapshot();
        assert_eq!(s.processed, 2);
        assert_eq!(s.succeeded, 1);
        assert_eq!(s.failed, 1);
    }
}
