//! External collaborator interfaces (§6): the worker pool, the repository
//! operator, and the session saver. The core never creates tmux sessions,
//! shells out to git, or writes files itself — it calls these traits and
//! holds only the identifiers/results they return.
//!
//! Real implementation: a process-backed worker pool driving `claude`
//! sessions in git worktrees, and a `git`/`gh` subprocess repository
//! operator. Test double: the in-memory fakes in [`fakes`], used by every
//! unit and integration test in this crate.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::CollaboratorError;
use crate::session::{InstanceStatus, Session};

/// Abstraction over the system that creates, starts, and tears down worker
/// instances (sandboxed coding-assistant sessions running in their own
/// worktree). The core holds only instance IDs; instances themselves are
/// owned and destroyed by whatever implements this trait.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Register a new instance against `base_branch`, returning its ID.
    async fn add_instance(&self, prompt: &str, base_branch: &str) -> Result<String, CollaboratorError>;

    /// Register a new instance whose worktree is created from an existing
    /// branch (used when resuming or forking from a partial branch).
    async fn add_instance_from_branch(
        &self,
        prompt: &str,
        branch: &str,
    ) -> Result<String, CollaboratorError>;

    async fn start_instance(&self, instance_id: &str) -> Result<(), CollaboratorError>;

    async fn stop_instance(&self, instance_id: &str) -> Result<(), CollaboratorError>;

    async fn get_instance(&self, instance_id: &str) -> Result<WorkerInstanceView, CollaboratorError>;

    /// Whether the instance's backing tmux session still exists — used by
    /// the fallback poller to distinguish a genuinely completed instance
    /// from a status read racing the instance's teardown.
    async fn tmux_session_exists(&self, instance_id: &str) -> Result<bool, CollaboratorError>;

    fn branch_prefix(&self) -> &str;
}

/// A read-only view of a worker instance, as returned by `get_instance`.
#[derive(Debug, Clone)]
pub struct WorkerInstanceView {
    pub id: String,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub status: InstanceStatus,
}

/// Abstraction over version-control mutation. The core never shells out to
/// git directly for mutating operations — it calls this trait, so that
/// repository state can be faked in tests and so that a single seam exists
/// for auditing every mutation the orchestration makes to the repo.
#[async_trait]
pub trait RepositoryOperator: Send + Sync {
    async fn find_main_branch(&self) -> Result<String, CollaboratorError>;

    async fn create_branch_from(&self, name: &str, base: &str) -> Result<(), CollaboratorError>;

    async fn create_worktree_from_branch(
        &self,
        branch: &str,
    ) -> Result<PathBuf, CollaboratorError>;

    async fn remove_worktree(&self, path: &Path) -> Result<(), CollaboratorError>;

    /// Cherry-pick every commit unique to `task_branch` onto the worktree
    /// checked out at `target_worktree`. On conflict, the conflict is left
    /// in progress (not aborted) so the caller can decide whether to pause
    /// or abort; callers needing the "abort and restore" behavior call
    /// `abort_cherry_pick` explicitly.
    async fn cherry_pick_branch(
        &self,
        target_worktree: &Path,
        task_branch: &str,
    ) -> Result<CherryPickOutcome, CollaboratorError>;

    async fn abort_cherry_pick(&self, target_worktree: &Path) -> Result<(), CollaboratorError>;

    async fn continue_cherry_pick(&self, target_worktree: &Path) -> Result<(), CollaboratorError>;

    async fn is_cherry_pick_in_progress(&self, worktree: &Path) -> Result<bool, CollaboratorError>;

    async fn get_conflicting_files(&self, worktree: &Path) -> Result<Vec<String>, CollaboratorError>;

    async fn count_commits_between(
        &self,
        base: &str,
        head_worktree: &Path,
    ) -> Result<usize, CollaboratorError>;

    async fn push(&self, worktree: &Path, branch: &str) -> Result<(), CollaboratorError>;
}

/// Outcome of one cherry-pick attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CherryPickOutcome {
    Applied,
    Conflict { files: Vec<String> },
}

/// Abstraction over checkpoint persistence, so orchestrators don't need to
/// know where or how a session is stored.
#[async_trait]
pub trait SessionSaver: Send + Sync {
    async fn save_session(&self, session: &Session) -> Result<(), CollaboratorError>;
}

pub mod process {
    //! Real `WorkerPool`/`RepositoryOperator` implementations: a process-
    //! backed worker pool that drives a coding-assistant CLI inside a git
    //! worktree, and a `git`-CLI-backed repository operator, generalized
    //! from `src/factory/agent_executor.rs`'s `setup_worktree`/
    //! `cleanup_worktree`/`run_task`/`merge_branch` (merge becomes
    //! cherry-pick here, per this crate's consolidation model) plus
    //! `src/tracker/git.rs`'s git2 usage for read-only queries.
    //!
    //! `tmux_session_exists` is honestly implemented as a child-process
    //! liveness check, not a real tmux query: the core's own non-goals rule
    //! out managing terminal layout, so there is no pane to ask about here.

    use super::*;
    use std::collections::HashMap;
    use std::process::Stdio;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tokio::process::{Child, Command};

    struct ManagedInstance {
        child: Option<Child>,
        worktree_path: PathBuf,
        branch: String,
        prompt: String,
        last_status: InstanceStatus,
    }

    /// A worker pool backed by real `git worktree`s and a spawned
    /// coding-assistant process per instance. The command run is
    /// configurable via `agent_cmd` (falling back to the `CLAUDIO_AGENT_CMD`
    /// env var, then `"claude"`), matching `run_task`'s `CLAUDE_CMD` lookup.
    pub struct ProcessWorkerPool {
        project_dir: PathBuf,
        worktree_root: PathBuf,
        branch_prefix: String,
        agent_cmd: String,
        instances: Mutex<HashMap<String, ManagedInstance>>,
        counter: AtomicUsize,
    }

    impl ProcessWorkerPool {
        pub fn new(project_dir: impl Into<PathBuf>, branch_prefix: impl Into<String>) -> Self {
            let project_dir = project_dir.into();
            let agent_cmd = std::env::var("CLAUDIO_AGENT_CMD").unwrap_or_else(|_| "claude".to_string());
            Self {
                worktree_root: project_dir.join(".claudio-worktrees"),
                project_dir,
                branch_prefix: branch_prefix.into(),
                agent_cmd,
                instances: Mutex::new(HashMap::new()),
                counter: AtomicUsize::new(0),
            }
        }

        fn next_id(&self) -> String {
            format!("instance-{}", self.counter.fetch_add(1, Ordering::SeqCst))
        }

        async fn create_worktree(&self, branch: &str, base: &str, fresh_branch: bool) -> Result<PathBuf, CollaboratorError> {
            let worktree_path = self.worktree_root.join(sanitize(branch));
            if let Some(parent) = worktree_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CollaboratorError::Other(anyhow::anyhow!(e)))?;
            }

            let mut args = vec!["worktree", "add"];
            if fresh_branch {
                args.push("-b");
                args.push(branch);
            }
            let worktree_str = worktree_path.to_string_lossy().to_string();
            args.push(&worktree_str);
            if fresh_branch {
                args.push(base);
            } else {
                args.push(branch);
            }

            let output = Command::new("git")
                .args(&args)
                .current_dir(&self.project_dir)
                .output()
                .await
                .map_err(|e| CollaboratorError::Other(anyhow::anyhow!(e)))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                return Err(CollaboratorError::Other(anyhow::anyhow!("git worktree add failed: {stderr}")));
            }
            Ok(worktree_path)
        }

        fn spawn_agent(&self, prompt: &str, worktree_path: &Path) -> Result<Child, CollaboratorError> {
            Command::new(&self.agent_cmd)
                .args(["--print", "--dangerously-skip-permissions", "-p", prompt])
                .current_dir(worktree_path)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| CollaboratorError::StartFailed(e.to_string()))
        }

        /// Polls the child's exit status without blocking, updating and
        /// returning this instance's last-observed status.
        fn refresh_status(instance: &mut ManagedInstance) -> InstanceStatus {
            if let Some(child) = instance.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        instance.last_status =
                            if status.success() { InstanceStatus::Completed } else { InstanceStatus::Error };
                    }
                    Ok(None) => instance.last_status = InstanceStatus::Running,
                    Err(_) => instance.last_status = InstanceStatus::Error,
                }
            }
            instance.last_status
        }
    }

    fn sanitize(branch: &str) -> String {
        branch.chars().map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' }).collect()
    }

    #[async_trait]
    impl WorkerPool for ProcessWorkerPool {
        async fn add_instance(&self, prompt: &str, base_branch: &str) -> Result<String, CollaboratorError> {
            let id = self.next_id();
            let branch = format!("{}/{}", self.branch_prefix, id);
            let worktree_path = self.create_worktree(&branch, base_branch, true).await?;
            self.instances.lock().unwrap().insert(
                id.clone(),
                ManagedInstance {
                    child: None,
                    worktree_path,
                    branch,
                    prompt: prompt.to_string(),
                    last_status: InstanceStatus::Running,
                },
            );
            Ok(id)
        }

        async fn add_instance_from_branch(&self, prompt: &str, branch: &str) -> Result<String, CollaboratorError> {
            let id = self.next_id();
            let worktree_path = self.create_worktree(branch, branch, false).await?;
            self.instances.lock().unwrap().insert(
                id.clone(),
                ManagedInstance {
                    child: None,
                    worktree_path,
                    branch: branch.to_string(),
                    prompt: prompt.to_string(),
                    last_status: InstanceStatus::Running,
                },
            );
            Ok(id)
        }

        async fn start_instance(&self, instance_id: &str) -> Result<(), CollaboratorError> {
            let (prompt, worktree_path) = {
                let instances = self.instances.lock().unwrap();
                let instance = instances
                    .get(instance_id)
                    .ok_or_else(|| CollaboratorError::InstanceNotFound(instance_id.to_string()))?;
                (instance.prompt.clone(), instance.worktree_path.clone())
            };
            let child = self.spawn_agent(&prompt, &worktree_path)?;
            let mut instances = self.instances.lock().unwrap();
            let instance = instances
                .get_mut(instance_id)
                .ok_or_else(|| CollaboratorError::InstanceNotFound(instance_id.to_string()))?;
            instance.child = Some(child);
            Ok(())
        }

        async fn stop_instance(&self, instance_id: &str) -> Result<(), CollaboratorError> {
            let mut instances = self.instances.lock().unwrap();
            let instance = instances
                .get_mut(instance_id)
                .ok_or_else(|| CollaboratorError::InstanceNotFound(instance_id.to_string()))?;
            if let Some(child) = instance.child.as_mut() {
                let _ = child.start_kill();
            }
            Ok(())
        }

        async fn get_instance(&self, instance_id: &str) -> Result<WorkerInstanceView, CollaboratorError> {
            let mut instances = self.instances.lock().unwrap();
            let instance = instances
                .get_mut(instance_id)
                .ok_or_else(|| CollaboratorError::InstanceNotFound(instance_id.to_string()))?;
            let status = Self::refresh_status(instance);
            Ok(WorkerInstanceView {
                id: instance_id.to_string(),
                worktree_path: instance.worktree_path.clone(),
                branch: instance.branch.clone(),
                status,
            })
        }

        async fn tmux_session_exists(&self, instance_id: &str) -> Result<bool, CollaboratorError> {
            let mut instances = self.instances.lock().unwrap();
            let instance = instances
                .get_mut(instance_id)
                .ok_or_else(|| CollaboratorError::InstanceNotFound(instance_id.to_string()))?;
            Ok(Self::refresh_status(instance) == InstanceStatus::Running)
        }

        fn branch_prefix(&self) -> &str {
            &self.branch_prefix
        }
    }

    /// A `RepositoryOperator` that reads repo state through `git2` and
    /// performs every mutation by shelling out to the `git` CLI, mirroring
    /// the split `src/tracker/git.rs` (git2) and `setup_worktree`/
    /// `cleanup_worktree`/`merge_branch` (CLI subprocess) already use.
    pub struct GitCliRepositoryOperator {
        project_dir: PathBuf,
    }

    impl GitCliRepositoryOperator {
        pub fn new(project_dir: impl Into<PathBuf>) -> Self {
            Self { project_dir: project_dir.into() }
        }

        async fn run(&self, cwd: &Path, args: &[&str]) -> Result<std::process::Output, CollaboratorError> {
            Command::new("git")
                .args(args)
                .current_dir(cwd)
                .output()
                .await
                .map_err(|e| CollaboratorError::Other(anyhow::anyhow!(e)))
        }

        fn ensure_success(output: &std::process::Output, context: &str) -> Result<(), CollaboratorError> {
            if output.status.success() {
                return Ok(());
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(CollaboratorError::Other(anyhow::anyhow!("{context}: {}", stderr.trim())))
        }
    }

    #[async_trait]
    impl RepositoryOperator for GitCliRepositoryOperator {
        async fn find_main_branch(&self) -> Result<String, CollaboratorError> {
            let repo = git2::Repository::open(&self.project_dir)
                .map_err(|e| CollaboratorError::Other(anyhow::anyhow!(e)))?;
            for candidate in ["main", "master"] {
                if repo.find_branch(candidate, git2::BranchType::Local).is_ok() {
                    return Ok(candidate.to_string());
                }
            }
            Err(CollaboratorError::Other(anyhow::anyhow!("no main or master branch found")))
        }

        async fn create_branch_from(&self, name: &str, base: &str) -> Result<(), CollaboratorError> {
            let output = self.run(&self.project_dir, &["branch", name, base]).await?;
            Self::ensure_success(&output, "git branch")
        }

        async fn create_worktree_from_branch(&self, branch: &str) -> Result<PathBuf, CollaboratorError> {
            let worktree_path = self.project_dir.join(".claudio-consolidate").join(sanitize(branch));
            if let Some(parent) = worktree_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CollaboratorError::Other(anyhow::anyhow!(e)))?;
            }
            let worktree_str = worktree_path.to_string_lossy().to_string();
            let output = self.run(&self.project_dir, &["worktree", "add", &worktree_str, branch]).await?;
            Self::ensure_success(&output, "git worktree add")?;
            Ok(worktree_path)
        }

        async fn remove_worktree(&self, path: &Path) -> Result<(), CollaboratorError> {
            let path_str = path.to_string_lossy().to_string();
            let output = self.run(&self.project_dir, &["worktree", "remove", "--force", &path_str]).await?;
            Self::ensure_success(&output, "git worktree remove")
        }

        async fn cherry_pick_branch(
            &self,
            target_worktree: &Path,
            task_branch: &str,
        ) -> Result<CherryPickOutcome, CollaboratorError> {
            let merge_base = self.run(target_worktree, &["merge-base", "HEAD", task_branch]).await?;
            Self::ensure_success(&merge_base, "git merge-base")?;
            let base_sha = String::from_utf8_lossy(&merge_base.stdout).trim().to_string();

            let range = format!("{base_sha}..{task_branch}");
            let rev_list = self.run(target_worktree, &["rev-list", "--reverse", &range]).await?;
            Self::ensure_success(&rev_list, "git rev-list")?;
            let commits: Vec<String> =
                String::from_utf8_lossy(&rev_list.stdout).lines().map(|l| l.to_string()).collect();

            for sha in commits {
                let output = self.run(target_worktree, &["cherry-pick", "--allow-empty", &sha]).await?;
                if !output.status.success() {
                    let files = self.get_conflicting_files(target_worktree).await?;
                    return Ok(CherryPickOutcome::Conflict { files });
                }
            }
            Ok(CherryPickOutcome::Applied)
        }

        async fn abort_cherry_pick(&self, target_worktree: &Path) -> Result<(), CollaboratorError> {
            let output = self.run(target_worktree, &["cherry-pick", "--abort"]).await?;
            Self::ensure_success(&output, "git cherry-pick --abort")
        }

        async fn continue_cherry_pick(&self, target_worktree: &Path) -> Result<(), CollaboratorError> {
            let add = self.run(target_worktree, &["add", "-A"]).await?;
            Self::ensure_success(&add, "git add")?;
            let output = self.run(target_worktree, &["cherry-pick", "--continue", "--no-edit"]).await?;
            Self::ensure_success(&output, "git cherry-pick --continue")
        }

        async fn is_cherry_pick_in_progress(&self, worktree: &Path) -> Result<bool, CollaboratorError> {
            let output = self.run(worktree, &["rev-parse", "--git-path", "CHERRY_PICK_HEAD"]).await?;
            Self::ensure_success(&output, "git rev-parse --git-path")?;
            let rel = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(worktree.join(rel).is_file())
        }

        async fn get_conflicting_files(&self, worktree: &Path) -> Result<Vec<String>, CollaboratorError> {
            let output = self.run(worktree, &["diff", "--name-only", "--diff-filter=U"]).await?;
            Self::ensure_success(&output, "git diff --diff-filter=U")?;
            Ok(String::from_utf8_lossy(&output.stdout).lines().map(|l| l.to_string()).collect())
        }

        async fn count_commits_between(&self, base: &str, head_worktree: &Path) -> Result<usize, CollaboratorError> {
            let range = format!("{base}..HEAD");
            let output = self.run(head_worktree, &["rev-list", "--count", &range]).await?;
            Self::ensure_success(&output, "git rev-list --count")?;
            String::from_utf8_lossy(&output.stdout)
                .trim()
                .parse::<usize>()
                .map_err(|e| CollaboratorError::Other(anyhow::anyhow!(e)))
        }

        async fn push(&self, worktree: &Path, branch: &str) -> Result<(), CollaboratorError> {
            let output = self.run(worktree, &["push", "-u", "origin", branch]).await?;
            Self::ensure_success(&output, "git push")
        }
    }
}

/// A `SessionSaver` backed by [`crate::checkpoint::CheckpointStore`],
/// fulfilling the collaborator trait with the same atomic snapshot write
/// `CheckpointStore::save` already provides.
pub struct CheckpointSessionSaver {
    store: crate::checkpoint::CheckpointStore,
}

impl CheckpointSessionSaver {
    pub fn new(store: crate::checkpoint::CheckpointStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SessionSaver for CheckpointSessionSaver {
    async fn save_session(&self, session: &Session) -> Result<(), CollaboratorError> {
        self.store.save(session).map_err(CollaboratorError::Other)
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fakes {
    //! In-memory fakes for [`WorkerPool`], [`RepositoryOperator`], and
    //! [`SessionSaver`], used throughout this crate's unit and integration
    //! tests in place of a real tmux/git backend.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub struct FakeInstance {
        pub worktree_path: PathBuf,
        pub branch: String,
        pub status: InstanceStatus,
        pub started: bool,
        pub tmux_alive: bool,
    }

    /// A scriptable in-memory worker pool: tests seed `instances` and
    /// flip `status`/`tmux_alive` to simulate monitor/fallback races.
    pub struct FakeWorkerPool {
        pub instances: Mutex<HashMap<String, FakeInstance>>,
        counter: AtomicUsize,
        pub branch_prefix: String,
    }

    impl FakeWorkerPool {
        pub fn new() -> Self {
            Self {
                instances: Mutex::new(HashMap::new()),
                counter: AtomicUsize::new(0),
                branch_prefix: "claudio".to_string(),
            }
        }

        pub fn next_id(&self) -> String {
            format!("instance-{}", self.counter.fetch_add(1, Ordering::SeqCst))
        }

        pub fn set_status(&self, instance_id: &str, status: InstanceStatus) {
            if let Some(instance) = self.instances.lock().unwrap().get_mut(instance_id) {
                instance.status = status;
            }
        }
    }

    impl Default for FakeWorkerPool {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl WorkerPool for FakeWorkerPool {
        async fn add_instance(&self, _prompt: &str, base_branch: &str) -> Result<String, CollaboratorError> {
            let id = self.next_id();
            self.instances.lock().unwrap().insert(
                id.clone(),
                FakeInstance {
                    worktree_path: PathBuf::from(format!("/tmp/claudio/{id}")),
                    branch: format!("{}/{}", self.branch_prefix, base_branch),
                    status: InstanceStatus::Running,
                    started: false,
                    tmux_alive: true,
                },
            );
            Ok(id)
        }

        async fn add_instance_from_branch(&self, prompt: &str, branch: &str) -> Result<String, CollaboratorError> {
            self.add_instance(prompt, branch).await
        }

        async fn start_instance(&self, instance_id: &str) -> Result<(), CollaboratorError> {
            let mut instances = self.instances.lock().unwrap();
            let instance = instances
                .get_mut(instance_id)
                .ok_or_else(|| CollaboratorError::InstanceNotFound(instance_id.to_string()))?;
            instance.started = true;
            Ok(())
        }

        async fn stop_instance(&self, instance_id: &str) -> Result<(), CollaboratorError> {
            let mut instances = self.instances.lock().unwrap();
            let instance = instances
                .get_mut(instance_id)
                .ok_or_else(|| CollaboratorError::InstanceNotFound(instance_id.to_string()))?;
            instance.tmux_alive = false;
            Ok(())
        }

        async fn get_instance(&self, instance_id: &str) -> Result<WorkerInstanceView, CollaboratorError> {
            let instances = self.instances.lock().unwrap();
            let instance = instances
                .get(instance_id)
                .ok_or_else(|| CollaboratorError::InstanceNotFound(instance_id.to_string()))?;
            Ok(WorkerInstanceView {
                id: instance_id.to_string(),
                worktree_path: instance.worktree_path.clone(),
                branch: instance.branch.clone(),
                status: instance.status,
            })
        }

        async fn tmux_session_exists(&self, instance_id: &str) -> Result<bool, CollaboratorError> {
            let instances = self.instances.lock().unwrap();
            Ok(instances.get(instance_id).map(|i| i.tmux_alive).unwrap_or(false))
        }

        fn branch_prefix(&self) -> &str {
            &self.branch_prefix
        }
    }

    /// A scriptable in-memory repository operator: tests seed
    /// `commit_counts` and `conflicts` to control verification and
    /// cherry-pick outcomes without touching a real git repo.
    pub struct FakeRepositoryOperator {
        pub main_branch: String,
        pub commit_counts: Mutex<HashMap<String, usize>>,
        pub conflicts: Mutex<HashMap<String, Vec<String>>>,
        pub cherry_pick_in_progress: Mutex<HashMap<PathBuf, bool>>,
        pub pushed_branches: Mutex<Vec<String>>,
        pub push_should_fail: bool,
    }

    impl FakeRepositoryOperator {
        pub fn new() -> Self {
            Self {
                main_branch: "main".to_string(),
                commit_counts: Mutex::new(HashMap::new()),
                conflicts: Mutex::new(HashMap::new()),
                cherry_pick_in_progress: Mutex::new(HashMap::new()),
                pushed_branches: Mutex::new(Vec::new()),
                push_should_fail: false,
            }
        }

        pub fn seed_commit_count(&self, branch: &str, count: usize) {
            self.commit_counts.lock().unwrap().insert(branch.to_string(), count);
        }

        pub fn seed_conflict(&self, task_branch: &str, files: Vec<String>) {
            self.conflicts.lock().unwrap().insert(task_branch.to_string(), files);
        }
    }

    impl Default for FakeRepositoryOperator {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl RepositoryOperator for FakeRepositoryOperator {
        async fn find_main_branch(&self) -> Result<String, CollaboratorError> {
            Ok(self.main_branch.clone())
        }

        async fn create_branch_from(&self, _name: &str, _base: &str) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn create_worktree_from_branch(&self, branch: &str) -> Result<PathBuf, CollaboratorError> {
            Ok(PathBuf::from(format!("/tmp/claudio-consolidate/{branch}")))
        }

        async fn remove_worktree(&self, _path: &Path) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn cherry_pick_branch(
            &self,
            target_worktree: &Path,
            task_branch: &str,
        ) -> Result<CherryPickOutcome, CollaboratorError> {
            if let Some(files) = self.conflicts.lock().unwrap().get(task_branch).cloned() {
                self.cherry_pick_in_progress
                    .lock()
                    .unwrap()
                    .insert(target_worktree.to_path_buf(), true);
                return Ok(CherryPickOutcome::Conflict { files });
            }
            Ok(CherryPickOutcome::Applied)
        }

        async fn abort_cherry_pick(&self, target_worktree: &Path) -> Result<(), CollaboratorError> {
            self.cherry_pick_in_progress
                .lock()
                .unwrap()
                .insert(target_worktree.to_path_buf(), false);
            Ok(())
        }

        async fn continue_cherry_pick(&self, target_worktree: &Path) -> Result<(), CollaboratorError> {
            self.cherry_pick_in_progress
                .lock()
                .unwrap()
                .insert(target_worktree.to_path_buf(), false);
            Ok(())
        }

        async fn is_cherry_pick_in_progress(&self, worktree: &Path) -> Result<bool, CollaboratorError> {
            Ok(self
                .cherry_pick_in_progress
                .lock()
                .unwrap()
                .get(worktree)
                .copied()
                .unwrap_or(false))
        }

        async fn get_conflicting_files(&self, worktree: &Path) -> Result<Vec<String>, CollaboratorError> {
            let in_progress = self
                .cherry_pick_in_progress
                .lock()
                .unwrap()
                .get(worktree)
                .copied()
                .unwrap_or(false);
            if !in_progress {
                return Ok(Vec::new());
            }
            Ok(self
                .conflicts
                .lock()
                .unwrap()
                .values()
                .next()
                .cloned()
                .unwrap_or_default())
        }

        async fn count_commits_between(&self, base: &str, head_worktree: &Path) -> Result<usize, CollaboratorError> {
            let key = head_worktree.to_string_lossy().to_string();
            let counts = self.commit_counts.lock().unwrap();
            Ok(counts
                .get(&key)
                .copied()
                .or_else(|| counts.get(base).copied())
                .unwrap_or(0))
        }

        async fn push(&self, _worktree: &Path, branch: &str) -> Result<(), CollaboratorError> {
            if self.push_should_fail {
                return Err(CollaboratorError::Other(anyhow::anyhow!("simulated push failure")));
            }
            self.pushed_branches.lock().unwrap().push(branch.to_string());
            Ok(())
        }
    }

    pub struct FakeSessionSaver {
        pub saved: Mutex<Vec<Session>>,
    }

    impl FakeSessionSaver {
        pub fn new() -> Self {
            Self { saved: Mutex::new(Vec::new()) }
        }

        pub fn save_count(&self) -> usize {
            self.saved.lock().unwrap().len()
        }
    }

    impl Default for FakeSessionSaver {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl SessionSaver for FakeSessionSaver {
        async fn save_session(&self, session: &Session) -> Result<(), CollaboratorError> {
            self.saved.lock().unwrap().push(session.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;

    #[tokio::test]
    async fn fake_worker_pool_add_then_start_round_trips() {
        let pool = FakeWorkerPool::new();
        let id = pool.add_instance("prompt", "main").await.unwrap();
        pool.start_instance(&id).await.unwrap();
        let view = pool.get_instance(&id).await.unwrap();
        assert_eq!(view.status, InstanceStatus::Running);
        assert!(pool.tmux_session_exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn stop_instance_clears_tmux_liveness() {
        let pool = FakeWorkerPool::new();
        let id = pool.add_instance("prompt", "main").await.unwrap();
        pool.stop_instance(&id).await.unwrap();
        assert!(!pool.tmux_session_exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn get_instance_missing_id_errors() {
        let pool = FakeWorkerPool::new();
        let err = pool.get_instance("nope").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::InstanceNotFound(_)));
    }

    #[tokio::test]
    async fn seeded_conflict_surfaces_as_conflict_outcome() {
        let repo = FakeRepositoryOperator::new();
        repo.seed_conflict("task-branch", vec!["src/lib.rs".to_string()]);
        let outcome = repo
            .cherry_pick_branch(Path::new("/tmp/wt"), "task-branch")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CherryPickOutcome::Conflict { files: vec!["src/lib.rs".to_string()] }
        );
        assert!(repo.is_cherry_pick_in_progress(Path::new("/tmp/wt")).await.unwrap());
    }

    #[tokio::test]
    async fn abort_cherry_pick_clears_in_progress_flag() {
        let repo = FakeRepositoryOperator::new();
        repo.seed_conflict("task-branch", vec!["f.rs".to_string()]);
        repo.cherry_pick_branch(Path::new("/tmp/wt"), "task-branch").await.unwrap();
        repo.abort_cherry_pick(Path::new("/tmp/wt")).await.unwrap();
        assert!(!repo.is_cherry_pick_in_progress(Path::new("/tmp/wt")).await.unwrap());
    }

    #[tokio::test]
    async fn session_saver_records_every_save() {
        let saver = FakeSessionSaver::new();
        let session = Session::new("objective", "claudio");
        saver.save_session(&session).await.unwrap();
        saver.save_session(&session).await.unwrap();
        assert_eq!(saver.save_count(), 2);
    }
}
