//! Supervision of one external trainer process.
//!
//! The supervisor owns the process lifecycle: spawn, stream stdout and
//! stderr line-by-line, feed every line through the metric parser, and
//! report through a [`TrainingObserver`]. All callbacks for a handle run on
//! the process's own spawned task, strictly in stream order; `on_finished`
//! fires exactly once, after which no further callbacks occur.

use crate::command::TrainCommand;
use crate::parser;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Callback surface for supervised process events.
///
/// Implementations must be cheap and non-blocking: they are invoked from the
/// process's reader task, and a slow callback stalls line processing. UI
/// consumers marshal to their own context.
pub trait TrainingObserver: Send + Sync {
    /// One raw output line, stdout and stderr combined, in arrival order.
    fn on_line(&self, line: &str);
    /// The merged metrics snapshot after a line yielded at least one metric.
    fn on_metrics(&self, metrics: &HashMap<String, f64>);
    /// Progress percentage plus a "Step X/Y" message; only emitted when a
    /// step metric arrived and a positive step target is known.
    fn on_progress(&self, percent: u8, message: &str);
    /// Terminal notification: success flag and a human-readable outcome.
    fn on_finished(&self, success: bool, message: &str);
}

/// Handle to one supervised process.
///
/// Owned by the experiment registry; exactly one handle exists per
/// experiment at a time.
#[derive(Debug)]
pub struct ProcessHandle {
    cancel: CancellationToken,
    metrics: Arc<Mutex<HashMap<String, f64>>>,
    finished: Arc<AtomicBool>,
}

impl ProcessHandle {
    /// Requests cooperative cancellation: the reader task kills the process
    /// and stops at the next line boundary. Does not block; completion is
    /// observed through `on_finished`. A no-op on an already-finished handle.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether `on_finished` has been delivered.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Latest merged metrics for this process.
    #[must_use]
    pub fn metrics_snapshot(&self) -> HashMap<String, f64> {
        self.metrics.lock().unwrap().clone()
    }
}

/// Launches and supervises external trainer processes.
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Starts `command` on a dedicated task and returns immediately.
    ///
    /// Launch failures are reported through `on_finished(false, …)` rather
    /// than returned; no `on_line` call precedes such a failure. Must be
    /// called from within a tokio runtime.
    pub fn start(
        command: TrainCommand,
        target_steps: Option<u64>,
        observer: Arc<dyn TrainingObserver>,
    ) -> ProcessHandle {
        let cancel = CancellationToken::new();
        let metrics = Arc::new(Mutex::new(HashMap::new()));
        let finished = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_process(
            command,
            target_steps,
            observer,
            cancel.clone(),
            Arc::clone(&metrics),
            Arc::clone(&finished),
        ));

        ProcessHandle { cancel, metrics, finished }
    }
}

async fn run_process(
    command: TrainCommand,
    target_steps: Option<u64>,
    observer: Arc<dyn TrainingObserver>,
    cancel: CancellationToken,
    metrics: Arc<Mutex<HashMap<String, f64>>>,
    finished: Arc<AtomicBool>,
) {
    debug!(program = %command.program, args = ?command.args, "launching trainer process");

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &command.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            finish(&finished, &*observer, false, &format!("Failed to launch '{}': {e}", command.program));
            return;
        }
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.start_kill();
        let _ = child.wait().await;
        finish(&finished, &*observer, false, "Failed to capture trainer output");
        return;
    };

    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;
    let mut cancelled = false;
    let mut read_error: Option<std::io::Error> = None;

    // One line is handled to completion (all callbacks delivered) before the
    // next is read; cancellation is honored at line boundaries.
    while !(out_done && err_done) {
        tokio::select! {
            () = cancel.cancelled() => {
                cancelled = true;
                let _ = child.start_kill();
                break;
            }
            line = out_lines.next_line(), if !out_done => match line {
                Ok(Some(line)) => handle_line(&line, target_steps, &metrics, &*observer),
                Ok(None) => out_done = true,
                Err(e) => {
                    read_error = Some(e);
                    let _ = child.start_kill();
                    break;
                }
            },
            line = err_lines.next_line(), if !err_done => match line {
                Ok(Some(line)) => handle_line(&line, target_steps, &metrics, &*observer),
                Ok(None) => err_done = true,
                Err(e) => {
                    read_error = Some(e);
                    let _ = child.start_kill();
                    break;
                }
            },
        }
    }

    let status = child.wait().await;

    let (success, message) = if cancelled {
        (false, "Stopped before completion".to_string())
    } else if let Some(e) = read_error {
        (false, format!("Error reading trainer output: {e}"))
    } else {
        match status {
            Ok(status) if status.success() => (true, "Completed successfully".to_string()),
            Ok(status) => match status.code() {
                Some(code) => (false, format!("Failed with code {code}")),
                None => (false, "Terminated by signal".to_string()),
            },
            Err(e) => (false, format!("Failed to reap trainer process: {e}")),
        }
    };
    finish(&finished, &*observer, success, &message);
}

fn handle_line(
    line: &str,
    target_steps: Option<u64>,
    metrics: &Mutex<HashMap<String, f64>>,
    observer: &dyn TrainingObserver,
) {
    observer.on_line(line);

    let extracted = parser::extract_metrics(line);
    if extracted.is_empty() {
        return;
    }

    let snapshot = {
        let mut merged = metrics.lock().unwrap();
        merged.extend(extracted.iter().map(|(name, value)| (name.clone(), *value)));
        merged.clone()
    };
    observer.on_metrics(&snapshot);

    if let (Some(step), Some(target)) = (extracted.get("step"), target_steps) {
        let step = *step as u64;
        if let Some(percent) = parser::progress_percent(step, target) {
            observer.on_progress(percent, &format!("Step {step}/{target}"));
        }
    }
}

fn finish(finished: &AtomicBool, observer: &dyn TrainingObserver, success: bool, message: &str) {
    finished.store(true, Ordering::SeqCst);
    debug!(success, message, "trainer process finished");
    observer.on_finished(success, message);
}
