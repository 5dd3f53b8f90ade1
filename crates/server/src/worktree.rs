//! Git worktree provisioning for orchestration workers.
//!
//! All git access goes through the `git` binary with bounded timeouts.
//! Worktrees are created locked under `<project>/.worktrees/<slug>` on
//! branch `orch/<id>/<slug>` so a crashed server never leaves a prunable
//! tree behind, and removal force-unlocks first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::exec;

const WORKTREE_ADD_TIMEOUT: Duration = Duration::from_secs(12);
const WORKTREE_REMOVE_TIMEOUT: Duration = Duration::from_secs(10);
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorktreeError {
    #[error("not_a_git_repo")]
    NotGitRepo,

    #[error("bad_git_dir")]
    BadGitDir,

    #[error("branch_checked_out")]
    BranchCheckedOut,

    #[error("path_exists")]
    PathExists,

    #[error("create_failed:{0}")]
    CreateFailed(String),

    #[error("worktree_list_failed")]
    ListFailed,
}

#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    pub workspace_root: String,
    pub git_dir: String,
    pub workspace_key: String,
}

/// Resolve the workspace root and git dir for a project path via
/// `git -C <path> rev-parse --show-toplevel --absolute-git-dir`.
pub async fn resolve_workspace(project_path: &str) -> Result<WorkspaceInfo, WorktreeError> {
    let result = exec::capture(
        "git",
        &[
            "-C",
            project_path,
            "rev-parse",
            "--show-toplevel",
            "--absolute-git-dir",
        ],
        Path::new(project_path),
        RESOLVE_TIMEOUT,
    )
    .await;

    if !result.success() {
        if result.stderr.contains("not a git repository") {
            return Err(WorktreeError::NotGitRepo);
        }
        return Err(WorktreeError::BadGitDir);
    }

    let mut lines = result.stdout.lines();
    let root = lines.next().unwrap_or("").trim().to_string();
    let git_dir = lines.next().unwrap_or("").trim().to_string();
    if root.is_empty() || git_dir.is_empty() {
        return Err(WorktreeError::BadGitDir);
    }

    Ok(WorkspaceInfo {
        workspace_key: workspace_key(&root),
        workspace_root: root,
        git_dir,
    })
}

/// Stable key for a workspace root.
pub fn workspace_key(root: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, root.as_bytes());
    digest
        .as_ref()
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Debug, Clone)]
pub struct CreatedWorktree {
    pub branch: String,
    pub path: String,
}

/// Create a locked worktree for one worker, branched from HEAD.
pub async fn create_worktree(
    workspace_root: &str,
    orchestration_id: &str,
    worker_name: &str,
) -> Result<CreatedWorktree, WorktreeError> {
    let slug = slug(worker_name);
    let branch = format!("orch/{orchestration_id}/{slug}");
    let path = PathBuf::from(workspace_root).join(".worktrees").join(&slug);
    let path_str = path.to_string_lossy().into_owned();

    if path.exists() {
        return Err(WorktreeError::PathExists);
    }

    let result = exec::capture(
        "git",
        &[
            "-C",
            workspace_root,
            "worktree",
            "add",
            "--lock",
            "-b",
            &branch,
            &path_str,
            "HEAD",
        ],
        Path::new(workspace_root),
        WORKTREE_ADD_TIMEOUT,
    )
    .await;

    if result.success() {
        debug!(
            component = "worktree",
            event = "worktree.created",
            branch = %branch,
            path = %path_str,
            "Worktree created"
        );
        return Ok(CreatedWorktree {
            branch,
            path: path_str,
        });
    }

    let stderr = result.stderr.to_ascii_lowercase();
    if stderr.contains("already checked out") || stderr.contains("already used by worktree") {
        Err(WorktreeError::BranchCheckedOut)
    } else if stderr.contains("already exists") {
        Err(WorktreeError::PathExists)
    } else if stderr.contains("not a git repository") {
        Err(WorktreeError::NotGitRepo)
    } else {
        Err(WorktreeError::CreateFailed(
            result.stderr.trim().chars().take(300).collect(),
        ))
    }
}

/// Remove a worktree: best-effort unlock first, then `remove --force`.
/// Returns `true` when the tree is gone.
pub async fn remove_worktree(workspace_root: &str, worktree_path: &str) -> bool {
    let unlock = exec::capture(
        "git",
        &["-C", workspace_root, "worktree", "unlock", worktree_path],
        Path::new(workspace_root),
        WORKTREE_REMOVE_TIMEOUT,
    )
    .await;
    if !unlock.success() {
        debug!(
            component = "worktree",
            event = "worktree.unlock_skipped",
            path = %worktree_path,
            stderr = %unlock.stderr.trim(),
            "Unlock failed or not needed"
        );
    }

    let remove = exec::capture(
        "git",
        &[
            "-C",
            workspace_root,
            "worktree",
            "remove",
            "--force",
            worktree_path,
        ],
        Path::new(workspace_root),
        WORKTREE_REMOVE_TIMEOUT,
    )
    .await;

    if remove.success() {
        true
    } else {
        warn!(
            component = "worktree",
            event = "worktree.remove_failed",
            path = %worktree_path,
            stderr = %remove.stderr.trim(),
            "Worktree removal failed"
        );
        false
    }
}

/// Current branch of a working directory, if any.
pub async fn resolve_branch(path: &str) -> Option<String> {
    let result = exec::capture(
        "git",
        &["-C", path, "rev-parse", "--abbrev-ref", "HEAD"],
        Path::new(path),
        RESOLVE_TIMEOUT,
    )
    .await;
    if !result.success() {
        return None;
    }
    let branch = result.stdout.trim();
    if branch.is_empty() {
        None
    } else {
        Some(branch.to_string())
    }
}

/// Lowercase alnum-and-dash slug for branch and directory names.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "worker".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_normalizes_names() {
        assert_eq!(slug("Worker A"), "worker-a");
        assert_eq!(slug("api/refactor #2"), "api-refactor-2");
        assert_eq!(slug("---"), "worker");
        assert_eq!(slug("CamelCase"), "camelcase");
    }

    #[test]
    fn workspace_key_is_stable_and_short() {
        let a = workspace_key("/home/user/project");
        let b = workspace_key("/home/user/project");
        let c = workspace_key("/home/user/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "t@t"],
            vec!["config", "user.name", "t"],
            vec!["commit", "--allow-empty", "-q", "-m", "init"],
        ] {
            let result = exec::capture("git", &args, dir, Duration::from_secs(10)).await;
            assert!(result.success(), "git {args:?}: {}", result.stderr);
        }
    }

    #[tokio::test]
    async fn resolve_workspace_on_real_repo() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;

        let info = resolve_workspace(dir.path().to_str().unwrap()).await.unwrap();
        assert!(info.git_dir.ends_with(".git"));
        assert_eq!(info.workspace_key.len(), 16);

        let plain = tempfile::tempdir().unwrap();
        let err = resolve_workspace(plain.path().to_str().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, WorktreeError::NotGitRepo);
    }

    #[tokio::test]
    async fn worktree_create_and_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let root = dir.path().to_str().unwrap();

        let created = create_worktree(root, "orch-1", "Worker A").await.unwrap();
        assert_eq!(created.branch, "orch/orch-1/worker-a");
        assert!(Path::new(&created.path).exists());

        // Same worker again: path already exists
        let err = create_worktree(root, "orch-1", "Worker A").await.unwrap_err();
        assert_eq!(err, WorktreeError::PathExists);

        assert!(remove_worktree(root, &created.path).await);
        assert!(!Path::new(&created.path).exists());
    }
}
