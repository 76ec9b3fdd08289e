//! Per-instance monitor goroutine, spawned once per dispatched task.
//!
//! Ticks on an interval, treating the sentinel file as the sole
//! authoritative completion signal (§4.4/§9) and falling back to the
//! instance's last-observed status only when no sentinel is present —
//! and even then, a `completed` status is not trusted unless the
//! instance's tmux session has actually gone away, since a status read
//! can race the worker's own teardown. Mirrors the tick-and-report shape
//! of `src/swarm/executor.rs`'s per-agent watch loop, generalized from
//! polling a result channel to polling a worktree.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::collaborators::{RepositoryOperator, WorkerPool};
use crate::session::{InstanceStatus, TaskCompletionRecord, TaskId};
use crate::verifier::{TaskVerifier, VerifyOptions};

pub(super) struct MonitorInputs {
    pub worker_pool: Arc<dyn WorkerPool>,
    pub repo: Arc<dyn RepositoryOperator>,
    pub tx: mpsc::Sender<TaskCompletionRecord>,
    pub cancelled: Arc<AtomicBool>,
    pub tick: Duration,
    pub task_id: TaskId,
    pub instance_id: String,
    pub base_branch: String,
    pub no_code: bool,
}

/// Watches one worker instance until it reports completion (success,
/// failure, or a retry-eligible empty run), then sends exactly one
/// [`TaskCompletionRecord`] and returns. Never sends more than once.
pub(super) async fn watch_instance(inputs: MonitorInputs) {
    let MonitorInputs { worker_pool, repo, tx, cancelled, tick, task_id, instance_id, base_branch, no_code } = inputs;
    let verifier = TaskVerifier::new(repo);

    loop {
        if cancelled.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(tick).await;

        let view = match worker_pool.get_instance(&instance_id).await {
            Ok(view) => view,
            Err(_) => return,
        };

        if verifier.check_completion_file(&view.worktree_path) {
            report(&worker_pool, &verifier, &tx, task_id, instance_id, view.worktree_path, &base_branch, no_code)
                .await;
            return;
        }

        match view.status {
            InstanceStatus::Completed => {
                let tmux_alive = worker_pool.tmux_session_exists(&instance_id).await.unwrap_or(false);
                if tmux_alive {
                    // status flipped before the sentinel landed; keep polling
                    continue;
                }
                report(&worker_pool, &verifier, &tx, task_id, instance_id, view.worktree_path, &base_branch, no_code)
                    .await;
                return;
            }
            InstanceStatus::Error | InstanceStatus::Timeout | InstanceStatus::Stuck => {
                let _ = worker_pool.stop_instance(&instance_id).await;
                let record = TaskCompletionRecord {
                    task_id,
                    instance_id,
                    success: false,
                    error: Some(format!("instance reported {}", view.status.as_str())),
                    needs_retry: false,
                    commit_count: 0,
                };
                let _ = tx.send(record).await;
                return;
            }
            InstanceStatus::WaitingInput | InstanceStatus::Running => continue,
        }
    }
}

async fn report(
    worker_pool: &Arc<dyn WorkerPool>,
    verifier: &TaskVerifier,
    tx: &mpsc::Sender<TaskCompletionRecord>,
    task_id: TaskId,
    instance_id: String,
    worktree_path: PathBuf,
    base_branch: &str,
    no_code: bool,
) {
    let _ = worker_pool.stop_instance(&instance_id).await;
    let outcome = verifier
        .verify_task_work(&task_id, &worktree_path, base_branch, VerifyOptions { no_code })
        .await;

    let record = match outcome {
        Ok(outcome) => TaskCompletionRecord {
            task_id,
            instance_id,
            success: outcome.success,
            error: if outcome.success { None } else { Some("no commits produced".to_string()) },
            needs_retry: outcome.needs_retry,
            commit_count: outcome.commit_count,
        },
        Err(e) => TaskCompletionRecord {
            task_id,
            instance_id,
            success: false,
            error: Some(e.to_string()),
            needs_retry: false,
            commit_count: 0,
        },
    };
    let _ = tx.send(record).await;
}
