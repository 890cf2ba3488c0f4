//! Worktree provisioner: branch + linked working tree per run.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Repository not found: {0}")]
    RepoNotFound(String),

    #[error("Worktree path already exists: {0}")]
    PathExists(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid name: {0}")]
    InvalidName(String),
}

/// A freshly provisioned worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedWorktree {
    pub branch_name: String,
    pub path: PathBuf,
    /// Commit the branch was created at; `None` if it could not be resolved.
    pub head_sha: Option<String>,
}

/// Validate a branch or directory name: alphanumerics plus `-_./`.
/// Rejects `..`, a leading dash, and anything else.
fn validate_name(name: &str) -> Result<(), WorktreeError> {
    if name.is_empty() {
        return Err(WorktreeError::InvalidName("name cannot be empty".into()));
    }
    if name.starts_with('-') {
        return Err(WorktreeError::InvalidName(format!(
            "name cannot start with a dash: {name}"
        )));
    }
    if name.contains("..") {
        return Err(WorktreeError::InvalidName(format!(
            "name cannot contain '..': {name}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(WorktreeError::InvalidName(format!(
            "name contains invalid characters: {name}"
        )));
    }
    Ok(())
}

/// First eight branch-safe characters of an identifier.
fn short_id(id: &str) -> String {
    let short: String = id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect();
    if short.is_empty() { "x".to_string() } else { short }
}

/// Creates and removes per-run worktrees under a scratch root.
///
/// Provisioning against the same repository is serialised; different
/// repositories proceed independently.
pub struct WorktreeProvisioner {
    root: PathBuf,
    repo_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl WorktreeProvisioner {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            repo_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Branch name for a run: `agentry/<task>-<run>-<utc micros>`.
    pub fn branch_name(task_id: &str, run_id: &str) -> String {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%6f");
        format!("agentry/{}-{}-{stamp}", short_id(task_id), short_id(run_id))
    }

    async fn repo_lock(&self, repo_path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().await;
        Arc::clone(locks.entry(repo_path.to_path_buf()).or_default())
    }

    async fn release_repo_lock(&self, repo_path: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.repo_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(repo_path);
        }
    }

    /// Create a branch at the repository's HEAD and a linked worktree for it.
    ///
    /// On git failure nothing is left behind: the directory, the worktree
    /// registration and the branch are all cleaned up before returning.
    pub async fn provision(
        &self,
        repo_path: &Path,
        task_id: &str,
        run_id: &str,
    ) -> Result<ProvisionedWorktree, WorktreeError> {
        if !repo_path.is_dir() {
            return Err(WorktreeError::RepoNotFound(repo_path.display().to_string()));
        }

        let branch_name = Self::branch_name(task_id, run_id);
        validate_name(&branch_name)?;

        let repo_name = repo_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("repo");
        let slug = branch_name.trim_start_matches("agentry/").to_string();
        validate_name(&slug)?;
        let parent = self.root.join(repo_name);
        let path = parent.join(&slug);

        let lock = self.repo_lock(repo_path).await;
        let provisioned = {
            let _guard = lock.lock().await;
            add_worktree(repo_path, &parent, path, branch_name).await
        };
        self.release_repo_lock(repo_path, lock).await;
        provisioned
    }

    /// Remove a worktree and its branch. Best-effort; failures are logged.
    pub async fn remove(&self, repo_path: &Path, worktree: &ProvisionedWorktree) {
        let lock = self.repo_lock(repo_path).await;
        {
            let _guard = lock.lock().await;
            discard(repo_path, &worktree.path, &worktree.branch_name).await;
        }
        self.release_repo_lock(repo_path, lock).await;
        info!(branch = %worktree.branch_name, "Removed worktree");
    }

    #[cfg(test)]
    async fn repo_lock_count(&self) -> usize {
        self.repo_locks.lock().await.len()
    }
}

async fn add_worktree(
    repo_path: &Path,
    parent: &Path,
    path: PathBuf,
    branch_name: String,
) -> Result<ProvisionedWorktree, WorktreeError> {
    if path.exists() {
        return Err(WorktreeError::PathExists(path.display().to_string()));
    }
    tokio::fs::create_dir_all(parent).await?;

    let start = std::time::Instant::now();
    let added = git(
        repo_path,
        [
            OsStr::new("worktree"),
            OsStr::new("add"),
            OsStr::new("-b"),
            OsStr::new(&branch_name),
            path.as_os_str(),
            OsStr::new("HEAD"),
        ],
    )
    .await;

    if let Err(e) = added {
        debug!(
            elapsed_ms = start.elapsed().as_millis(),
            branch = %branch_name,
            error = %e,
            "git worktree add failed, cleaning up"
        );
        discard(repo_path, &path, &branch_name).await;
        return Err(e);
    }

    let head_sha = match git(&path, ["rev-parse", "HEAD"]).await {
        Ok(sha) => Some(sha.trim().to_string()).filter(|s| !s.is_empty()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not resolve worktree HEAD");
            None
        }
    };

    info!(
        branch = %branch_name,
        path = %path.display(),
        elapsed_ms = start.elapsed().as_millis(),
        "Provisioned worktree"
    );

    Ok(ProvisionedWorktree {
        branch_name,
        path,
        head_sha,
    })
}

async fn discard(repo_path: &Path, path: &Path, branch: &str) {
    if path.exists() {
        if let Err(e) = git(
            repo_path,
            [
                OsStr::new("worktree"),
                OsStr::new("remove"),
                OsStr::new("--force"),
                path.as_os_str(),
            ],
        )
        .await
        {
            debug!(error = %e, "git worktree remove failed, deleting directory");
        }
        if path.exists()
            && let Err(e) = tokio::fs::remove_dir_all(path).await
        {
            warn!(path = %path.display(), error = %e, "Failed to delete worktree directory");
        }
    }
    let _ = git(repo_path, ["worktree", "prune"]).await;
    let _ = git(repo_path, ["branch", "-D", branch]).await;
}

/// Paths changed in `worktree` relative to `base` (default `HEAD`),
/// including untracked files. Sorted and de-duplicated.
pub async fn changed_paths(worktree: &Path, base: Option<&str>) -> Result<Vec<String>, WorktreeError> {
    let base = base.unwrap_or("HEAD");
    let diff = git(worktree, ["diff", "--name-only", base]).await?;
    let untracked = git(worktree, ["ls-files", "--others", "--exclude-standard"]).await?;

    let mut paths: Vec<String> = diff
        .lines()
        .chain(untracked.lines())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .collect();
    paths.sort();
    paths.dedup();
    Ok(paths)
}

async fn git<I, S>(dir: &Path, args: I) -> Result<String, WorktreeError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorktreeError::Git(stderr.trim().to_string()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .expect("git");
            assert!(status.status.success(), "git {args:?} failed");
        };
        run(&["init", "-q"]);
        run(&[
            "-c",
            "user.name=t",
            "-c",
            "user.email=t@t",
            "commit",
            "-q",
            "--allow-empty",
            "-m",
            "init",
        ]);
    }

    fn branches(repo: &Path) -> String {
        let out = std::process::Command::new("git")
            .args(["branch", "--list", "agentry/*"])
            .current_dir(repo)
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).into_owned()
    }

    #[test]
    fn validate_name_rules() {
        assert!(validate_name("agentry/abc-123").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-x").is_err());
        assert!(validate_name("a/../b").is_err());
        assert!(validate_name("a b").is_err());
    }

    #[test]
    fn branch_name_is_legible() {
        let name = WorktreeProvisioner::branch_name("task-1234567890", "run/abcdefgh99");
        assert!(name.starts_with("agentry/task1234-runabcde-"), "{name}");
        assert!(validate_name(&name).is_ok());
    }

    #[tokio::test]
    async fn provision_creates_branch_and_tree() {
        let repo = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        let provisioner = WorktreeProvisioner::new(root.path().join("scratch"));
        let wt = provisioner.provision(repo.path(), "t1", "r1").await.unwrap();

        assert!(wt.path.is_dir());
        assert!(wt.path.starts_with(root.path().join("scratch")));
        assert_eq!(wt.head_sha.as_deref().map(str::len), Some(40));
        assert!(branches(repo.path()).contains(&wt.branch_name));
    }

    #[tokio::test]
    async fn consecutive_provisions_do_not_collide() {
        let repo = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        let provisioner = WorktreeProvisioner::new(root.path().to_path_buf());
        let a = provisioner.provision(repo.path(), "t1", "r1").await.unwrap();
        let b = provisioner.provision(repo.path(), "t1", "r1").await.unwrap();
        assert_ne!(a.branch_name, b.branch_name);
        assert_ne!(a.path, b.path);
    }

    #[tokio::test]
    async fn failure_leaves_nothing_behind() {
        let not_a_repo = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();

        let provisioner = WorktreeProvisioner::new(root.path().to_path_buf());
        let err = provisioner
            .provision(not_a_repo.path(), "t1", "r1")
            .await
            .unwrap_err();
        assert!(matches!(err, WorktreeError::Git(_)), "got {err:?}");

        let repo_name = not_a_repo.path().file_name().unwrap();
        let leftovers = std::fs::read_dir(root.path().join(repo_name))
            .map(Iterator::count)
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn missing_repo_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let provisioner = WorktreeProvisioner::new(root.path().to_path_buf());
        let err = provisioner
            .provision(&root.path().join("missing"), "t1", "r1")
            .await
            .unwrap_err();
        assert!(matches!(err, WorktreeError::RepoNotFound(_)));
    }

    #[tokio::test]
    async fn remove_deletes_tree_and_branch() {
        let repo = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        let provisioner = WorktreeProvisioner::new(root.path().to_path_buf());
        let wt = provisioner.provision(repo.path(), "t1", "r1").await.unwrap();
        provisioner.remove(repo.path(), &wt).await;

        assert!(!wt.path.exists());
        assert!(!branches(repo.path()).contains(&wt.branch_name));
    }

    #[tokio::test]
    async fn repo_locks_are_released_after_use() {
        let repo = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        let provisioner = WorktreeProvisioner::new(root.path().to_path_buf());
        let wt = provisioner.provision(repo.path(), "t1", "r1").await.unwrap();
        assert_eq!(provisioner.repo_lock_count().await, 0);

        provisioner.remove(repo.path(), &wt).await;
        assert_eq!(provisioner.repo_lock_count().await, 0);

        let _ = provisioner.provision(&root.path().join("missing"), "t1", "r2").await;
        assert_eq!(provisioner.repo_lock_count().await, 0);
    }

    #[tokio::test]
    async fn changed_paths_include_untracked() {
        let repo = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        let provisioner = WorktreeProvisioner::new(root.path().to_path_buf());
        let wt = provisioner.provision(repo.path(), "t1", "r1").await.unwrap();
        std::fs::create_dir_all(wt.path.join("src")).unwrap();
        std::fs::write(wt.path.join("src/lib.rs"), "fn main() {}\n").unwrap();
        std::fs::write(wt.path.join("README.md"), "hi\n").unwrap();

        let paths = changed_paths(&wt.path, wt.head_sha.as_deref()).await.unwrap();
        assert_eq!(paths, vec!["README.md".to_string(), "src/lib.rs".to_string()]);
    }
}
