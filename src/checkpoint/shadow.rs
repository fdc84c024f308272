//! The shadow repository: a git repo whose worktree is the real workspace
//! but whose object/ref database lives under task storage.
//!
//! Repositories are always opened by explicit path with search disabled,
//! so inherited git-location overrides can never redirect a checkpoint
//! into an unrelated repository. Initialization is idempotent and
//! self-healing: a stale or corrupt shadow repo is deleted and recreated
//! rather than surfaced as a hard failure.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use git2::build::CheckoutBuilder;
use git2::{
    BranchType, DiffOptions, IndexAddOption, Oid, Repository, RepositoryOpenFlags, ResetType,
    Signature,
};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::checkpoint::excludes;
use crate::errors::CheckpointError;
use crate::events::CheckpointEvent;

const COMMIT_AUTHOR: &str = "Checkpoints";
const COMMIT_EMAIL: &str = "checkpoints@localhost";
const BRANCH_SWITCH_POLL: Duration = Duration::from_millis(500);
const BRANCH_SWITCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-file content pair produced by `get_diff`. A side absent from the
/// tree (added or deleted file) reads as the empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointDiffEntry {
    pub path: String,
    pub before: String,
    pub after: String,
}

pub struct ShadowCheckpointService {
    task_id: String,
    /// Directory containing the shadow repo's `.git`.
    checkpoints_dir: PathBuf,
    workspace_dir: PathBuf,
    base_hash: Mutex<Option<String>>,
    checkpoints: Mutex<Vec<String>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CheckpointEvent>>>,
}

impl ShadowCheckpointService {
    /// Refuses protected directories outright: checkpointing the user's
    /// home tree would stage far more than a workspace.
    pub fn new(
        task_id: impl Into<String>,
        checkpoints_dir: impl Into<PathBuf>,
        workspace_dir: impl Into<PathBuf>,
    ) -> Result<Self, CheckpointError> {
        let workspace_dir = workspace_dir.into();
        let home = std::env::var_os("HOME").map(PathBuf::from);
        if is_protected_workspace(&workspace_dir, home.as_deref()) {
            return Err(CheckpointError::ProtectedWorkspace {
                path: workspace_dir,
            });
        }
        Ok(Self {
            task_id: task_id.into(),
            checkpoints_dir: checkpoints_dir.into(),
            workspace_dir,
            base_hash: Mutex::new(None),
            checkpoints: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn base_hash(&self) -> Option<String> {
        self.base_hash.lock().expect("base hash poisoned").clone()
    }

    pub fn checkpoints(&self) -> Vec<String> {
        self.checkpoints.lock().expect("checkpoints poisoned").clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.base_hash().is_some()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CheckpointEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscribers poisoned")
            .push(tx);
        rx
    }

    fn emit(&self, event: CheckpointEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscribers poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn branch_name(&self) -> String {
        format!("task-{}", self.task_id)
    }

    // ─── Storage layout ────────────────────────────────────────────

    /// First 8 hex chars of the workspace path digest; stable key for
    /// workspace-scoped repos.
    pub fn hash_workspace_dir(workspace_dir: &Path) -> String {
        let digest = Sha256::digest(workspace_dir.to_string_lossy().as_bytes());
        digest
            .iter()
            .take(4)
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    pub fn task_repo_dir(storage_root: &Path, task_id: &str) -> PathBuf {
        storage_root.join("tasks").join(task_id).join("checkpoints")
    }

    pub fn workspace_repo_dir(storage_root: &Path, workspace_dir: &Path) -> PathBuf {
        storage_root
            .join("checkpoints")
            .join(Self::hash_workspace_dir(workspace_dir))
    }

    // ─── Initialization ────────────────────────────────────────────

    /// Idempotent, self-healing init. Refuses nested repositories before
    /// touching disk; reuses a valid existing shadow repo; deletes and
    /// recreates a stale or corrupt one.
    pub fn init(&self) -> Result<(), CheckpointError> {
        if self.is_initialized() {
            debug!(task_id = %self.task_id, "shadow repo already initialized");
            return Ok(());
        }
        let start = Instant::now();

        if let Some(path) = find_nested_git_repo(&self.workspace_dir) {
            error!(task_id = %self.task_id, path = %path.display(), "nested git repo in workspace");
            return Err(CheckpointError::NestedGitRepo { path });
        }

        let git_dir = self.checkpoints_dir.join(".git");
        let mut created = false;

        let base_hash = if git_dir.exists() {
            match self.try_reuse_existing() {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(
                        task_id = %self.task_id,
                        "shadow repo unusable ({e}), recreating"
                    );
                    std::fs::remove_dir_all(&self.checkpoints_dir).map_err(|io| {
                        CheckpointError::Storage {
                            path: self.checkpoints_dir.clone(),
                            message: io.to_string(),
                        }
                    })?;
                    created = true;
                    self.create_repo()?
                }
            }
        } else {
            created = true;
            self.create_repo()?
        };

        excludes::write_exclude_file(&git_dir)?;
        *self.base_hash.lock().expect("base hash poisoned") = Some(base_hash.clone());

        info!(
            task_id = %self.task_id,
            base_hash = %base_hash,
            created,
            "shadow repo initialized in {:?}",
            start.elapsed()
        );
        self.emit(CheckpointEvent::Initialize {
            workspace_dir: self.workspace_dir.clone(),
            base_hash,
            created,
            duration: start.elapsed(),
        });
        Ok(())
    }

    /// Validate an existing repo and return its head as the base hash.
    fn try_reuse_existing(&self) -> Result<String, CheckpointError> {
        let repo = self.open_repo()?;
        let head_oid = repo
            .head()
            .ok()
            .and_then(|h| h.target())
            .ok_or(CheckpointError::BaseHashMissing)?;
        debug!(task_id = %self.task_id, "reusing existing shadow repo");
        Ok(head_oid.to_string())
    }

    /// Create a fresh shadow repo: configs, alternates against the
    /// workspace's own object store when one exists, and a base commit.
    fn create_repo(&self) -> Result<String, CheckpointError> {
        std::fs::create_dir_all(&self.checkpoints_dir).map_err(|e| CheckpointError::Storage {
            path: self.checkpoints_dir.clone(),
            message: e.to_string(),
        })?;
        let repo = Repository::init(&self.checkpoints_dir)?;

        let mut config = repo.config()?;
        config.set_str("core.worktree", &self.workspace_dir.to_string_lossy())?;
        config.set_bool("commit.gpgsign", false)?;
        config.set_str("user.name", COMMIT_AUTHOR)?;
        config.set_str("user.email", COMMIT_EMAIL)?;
        config.set_str("gc.auto", "0")?;

        // Share blob storage with the workspace's own repo instead of
        // duplicating it.
        let workspace_base = match workspace_objects_dir(&self.workspace_dir) {
            Some(objects_dir) => {
                let info_dir = self.checkpoints_dir.join(".git/objects/info");
                std::fs::create_dir_all(&info_dir).map_err(|e| CheckpointError::Storage {
                    path: info_dir.clone(),
                    message: e.to_string(),
                })?;
                std::fs::write(
                    info_dir.join("alternates"),
                    format!("{}\n", objects_dir.display()),
                )
                .map_err(|e| CheckpointError::Storage {
                    path: info_dir.join("alternates"),
                    message: e.to_string(),
                })?;
                self.workspace_head()
            }
            None => None,
        };

        // Reopen so the alternates file takes effect for object lookups.
        drop(repo);
        let repo = self.open_repo()?;
        let branch_ref = format!("refs/heads/{}", self.branch_name());

        let base_oid = match workspace_base {
            Some(oid) => {
                repo.reference(&branch_ref, oid, true, "seed from workspace head")?;
                oid
            }
            None => {
                let tree_oid = repo.index()?.write_tree()?;
                let tree = repo.find_tree(tree_oid)?;
                let sig = Signature::now(COMMIT_AUTHOR, COMMIT_EMAIL)?;
                repo.commit(Some(&branch_ref), &sig, &sig, "initial commit", &tree, &[])?
            }
        };
        repo.set_head(&branch_ref)?;
        Ok(base_oid.to_string())
    }

    fn workspace_head(&self) -> Option<Oid> {
        let repo = Repository::open_ext(
            &self.workspace_dir,
            RepositoryOpenFlags::NO_SEARCH,
            std::iter::empty::<&std::ffi::OsStr>(),
        )
        .ok()?;
        let head = repo.head().ok()?;
        head.target()
    }

    /// Open the shadow repo path-pinned: no directory search, no
    /// environment lookups, and the recorded worktree must match.
    fn open_repo(&self) -> Result<Repository, CheckpointError> {
        let repo = Repository::open_ext(
            &self.checkpoints_dir,
            RepositoryOpenFlags::NO_SEARCH,
            std::iter::empty::<&std::ffi::OsStr>(),
        )?;
        let worktree = repo.config()?.get_path("core.worktree")?;
        if worktree != self.workspace_dir {
            return Err(CheckpointError::WorktreeMismatch {
                expected: self.workspace_dir.clone(),
                actual: worktree,
            });
        }
        Ok(repo)
    }

    // ─── Runtime operations ────────────────────────────────────────

    /// Stage everything (adds and deletions, behind the exclude list)
    /// and commit, chained from the previous checkpoint or base. Returns
    /// `None` when nothing changed and `allow_empty` is false.
    pub fn save_checkpoint(
        &self,
        message: &str,
        allow_empty: bool,
        suppress_message: bool,
    ) -> Result<Option<String>, CheckpointError> {
        let start = Instant::now();
        let result = self.save_checkpoint_inner(message, allow_empty);
        match &result {
            Ok(Some(hash)) => {
                let from = {
                    let checkpoints = self.checkpoints.lock().expect("checkpoints poisoned");
                    checkpoints
                        .iter()
                        .rev()
                        .nth(1)
                        .cloned()
                        .or_else(|| self.base_hash())
                        .unwrap_or_default()
                };
                info!(
                    task_id = %self.task_id,
                    hash = %hash,
                    "checkpoint saved in {:?}",
                    start.elapsed()
                );
                self.emit(CheckpointEvent::Checkpoint {
                    from_hash: from,
                    to_hash: hash.clone(),
                    duration: start.elapsed(),
                    suppress_message,
                });
            }
            Ok(None) => {
                debug!(task_id = %self.task_id, "workspace clean, no checkpoint taken");
            }
            Err(e) => {
                error!(task_id = %self.task_id, "save checkpoint failed: {e}");
                self.emit(CheckpointEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    fn save_checkpoint_inner(
        &self,
        message: &str,
        allow_empty: bool,
    ) -> Result<Option<String>, CheckpointError> {
        if !self.is_initialized() {
            return Err(CheckpointError::NotInitialized);
        }
        let repo = self.open_repo()?;

        let mut index = repo.index()?;
        index.add_all(["."], IndexAddOption::DEFAULT, None)?;
        index.update_all(["."], None)?;
        index.write()?;
        let tree_oid = index.write_tree()?;

        let parent_oid = repo
            .head()
            .ok()
            .and_then(|h| h.target())
            .ok_or(CheckpointError::BaseHashMissing)?;
        let parent = repo.find_commit(parent_oid)?;

        if !allow_empty && tree_oid == parent.tree_id() {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_oid)?;
        let sig = Signature::now(COMMIT_AUTHOR, COMMIT_EMAIL)?;
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;

        let hash = oid.to_string();
        self.checkpoints
            .lock()
            .expect("checkpoints poisoned")
            .push(hash.clone());
        Ok(Some(hash))
    }

    /// Hard-reset the worktree to `commit_hash`, cleaning untracked
    /// files, and truncate the checkpoint list after the restored point.
    /// History is linear and truncating: there is no redo past a restore.
    pub fn restore_checkpoint(&self, commit_hash: &str) -> Result<(), CheckpointError> {
        let start = Instant::now();
        let result = self.restore_checkpoint_inner(commit_hash);
        match &result {
            Ok(()) => {
                info!(
                    task_id = %self.task_id,
                    hash = %commit_hash,
                    "checkpoint restored in {:?}",
                    start.elapsed()
                );
                self.emit(CheckpointEvent::Restore {
                    commit_hash: commit_hash.to_string(),
                    duration: start.elapsed(),
                });
            }
            Err(e) => {
                error!(task_id = %self.task_id, "restore checkpoint failed: {e}");
                self.emit(CheckpointEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    fn restore_checkpoint_inner(&self, commit_hash: &str) -> Result<(), CheckpointError> {
        if !self.is_initialized() {
            return Err(CheckpointError::NotInitialized);
        }
        let repo = self.open_repo()?;
        let oid = Oid::from_str(commit_hash)?;
        let commit = repo.find_commit(oid)?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        repo.reset(commit.as_object(), ResetType::Hard, Some(&mut checkout))?;

        let mut checkpoints = self.checkpoints.lock().expect("checkpoints poisoned");
        if let Some(pos) = checkpoints.iter().position(|h| h == commit_hash) {
            checkpoints.truncate(pos + 1);
        }
        Ok(())
    }

    /// Per-file before/after contents between two commits, or between a
    /// commit and the live worktree when `to` is `None`.
    pub fn get_diff(
        &self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<CheckpointDiffEntry>, CheckpointError> {
        let repo = self.open_repo()?;
        let from = match from {
            Some(hash) => hash.to_string(),
            None => self.base_hash().ok_or(CheckpointError::BaseHashMissing)?,
        };
        let from_tree = repo.find_commit(Oid::from_str(&from)?)?.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true);
        let diff = match to {
            Some(to) => {
                let to_tree = repo.find_commit(Oid::from_str(to)?)?.tree()?;
                repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), Some(&mut opts))?
            }
            None => repo.diff_tree_to_workdir_with_index(Some(&from_tree), Some(&mut opts))?,
        };

        let mut entries = Vec::new();
        for delta in diff.deltas() {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();

            let before = read_blob(&repo, delta.old_file().id());
            let after = match to {
                Some(_) => read_blob(&repo, delta.new_file().id()),
                None => std::fs::read_to_string(self.workspace_dir.join(&path))
                    .unwrap_or_default(),
            };
            entries.push(CheckpointDiffEntry { path, before, after });
        }
        Ok(entries)
    }

    // ─── Task deletion ─────────────────────────────────────────────

    /// Remove the task's branch from its workspace-scoped repo. When the
    /// branch is checked out, the worktree binding is detached first so
    /// the branch switch cannot touch the real workspace; the binding is
    /// restored even on failure.
    pub fn delete_task_branch(
        storage_root: &Path,
        task_id: &str,
        workspace_dir: &Path,
    ) -> Result<(), CheckpointError> {
        let repo_dir = Self::workspace_repo_dir(storage_root, workspace_dir);
        let branch_name = format!("task-{task_id}");
        let open = || -> Result<Repository, CheckpointError> {
            Ok(Repository::open_ext(
                &repo_dir,
                RepositoryOpenFlags::NO_SEARCH,
                std::iter::empty::<&std::ffi::OsStr>(),
            )?)
        };

        let repo = open()?;
        if repo.find_branch(&branch_name, BranchType::Local).is_err() {
            return Err(CheckpointError::BranchNotFound {
                branch: branch_name,
            });
        }
        let on_branch = repo
            .head()
            .ok()
            .and_then(|h| h.shorthand().map(String::from))
            .as_deref()
            == Some(branch_name.as_str());

        if !on_branch {
            let mut branch = repo.find_branch(&branch_name, BranchType::Local)?;
            branch.delete()?;
            info!(task_id, "deleted checkpoint branch");
            return Ok(());
        }

        // The branch is checked out: detach the worktree binding so the
        // switch happens entirely inside the repo dir.
        let saved_worktree = repo.config()?.get_string("core.worktree").ok();
        let mut config = repo.config()?;
        let _ = config.remove("core.worktree");
        drop(config);
        drop(repo);

        let result = Self::switch_away_and_delete(&open, &branch_name);

        if let Some(worktree) = saved_worktree {
            match open().and_then(|repo| {
                repo.config()?.set_str("core.worktree", &worktree)?;
                Ok(())
            }) {
                Ok(()) => {}
                Err(e) => error!(task_id, "failed to restore core.worktree: {e}"),
            }
        }
        result
    }

    fn switch_away_and_delete(
        open: &dyn Fn() -> Result<Repository, CheckpointError>,
        branch_name: &str,
    ) -> Result<(), CheckpointError> {
        let repo = open()?;
        let default = ["main", "master"]
            .into_iter()
            .find(|b| repo.find_branch(b, BranchType::Local).is_ok())
            .ok_or_else(|| CheckpointError::BranchNotFound {
                branch: "main".to_string(),
            })?;

        repo.set_head(&format!("refs/heads/{default}"))?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        repo.checkout_head(Some(&mut checkout))?;

        // Bounded poll for the switch to land before deleting.
        let deadline = Instant::now() + BRANCH_SWITCH_TIMEOUT;
        loop {
            let landed = repo
                .head()
                .ok()
                .and_then(|h| h.shorthand().map(String::from))
                .as_deref()
                == Some(default);
            if landed {
                break;
            }
            if Instant::now() >= deadline {
                return Err(CheckpointError::BranchSwitchTimeout {
                    branch: default.to_string(),
                });
            }
            std::thread::sleep(BRANCH_SWITCH_POLL);
        }

        let mut branch = repo.find_branch(branch_name, BranchType::Local)?;
        branch.delete()?;
        Ok(())
    }
}

fn read_blob(repo: &Repository, oid: Oid) -> String {
    if oid.is_zero() {
        return String::new();
    }
    repo.find_blob(oid)
        .map(|blob| String::from_utf8_lossy(blob.content()).into_owned())
        .unwrap_or_default()
}

/// Scan for a `.git/HEAD` anywhere below the workspace root. Nested
/// repositories make diff and commit scoping unreliable, so init refuses
/// them before creating anything.
fn find_nested_git_repo(workspace_dir: &Path) -> Option<PathBuf> {
    WalkDir::new(workspace_dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            // The workspace's own repo is fine; heavy dependency trees
            // are skipped the same way the exclude list skips them.
            !(e.depth() == 1 && name == ".git") && name != "node_modules" && name != "target"
        })
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_type().is_dir()
                && e.file_name() == ".git"
                && e.path().join("HEAD").is_file()
        })
        .and_then(|e| e.path().parent().map(Path::to_path_buf))
}

/// Resolve the workspace's own git objects directory, following the
/// gitfile indirection (`.git` as a file holding `gitdir: <path>`).
fn workspace_objects_dir(workspace_dir: &Path) -> Option<PathBuf> {
    let dot_git = workspace_dir.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git.join("objects"));
    }
    if dot_git.is_file() {
        let contents = std::fs::read_to_string(&dot_git).ok()?;
        let target = contents.strip_prefix("gitdir:")?.trim();
        let git_dir = if Path::new(target).is_absolute() {
            PathBuf::from(target)
        } else {
            workspace_dir.join(target)
        };
        return Some(git_dir.join("objects"));
    }
    None
}

/// Home itself and its well-known user folders are never checkpointed.
fn is_protected_workspace(workspace_dir: &Path, home: Option<&Path>) -> bool {
    let Some(home) = home else { return false };
    workspace_dir == home
        || workspace_dir == home.join("Desktop")
        || workspace_dir == home.join("Documents")
        || workspace_dir == home.join("Downloads")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> ShadowCheckpointService {
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        ShadowCheckpointService::new(
            "task-1",
            dir.path().join("storage/checkpoints"),
            workspace,
        )
        .unwrap()
    }

    fn write(workspace: &Path, name: &str, contents: &str) {
        std::fs::write(workspace.join(name), contents).unwrap();
    }

    #[test]
    fn test_protected_workspace_detection() {
        let home = Path::new("/home/someone");
        assert!(is_protected_workspace(home, Some(home)));
        assert!(is_protected_workspace(&home.join("Desktop"), Some(home)));
        assert!(is_protected_workspace(&home.join("Documents"), Some(home)));
        assert!(is_protected_workspace(&home.join("Downloads"), Some(home)));
        assert!(!is_protected_workspace(&home.join("projects/app"), Some(home)));
        assert!(!is_protected_workspace(home, None));
    }

    #[test]
    fn test_nested_git_repo_refused_before_creating_anything() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let nested = svc.workspace_dir().join("vendor/dep/.git");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("HEAD"), "ref: refs/heads/main\n").unwrap();

        let err = svc.init().unwrap_err();
        assert!(matches!(err, CheckpointError::NestedGitRepo { .. }));
        assert!(!dir.path().join("storage/checkpoints").exists());
    }

    #[test]
    fn test_workspace_own_git_is_not_nested() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        Repository::init(svc.workspace_dir()).unwrap();

        assert!(find_nested_git_repo(svc.workspace_dir()).is_none());
    }

    #[test]
    fn test_init_seeds_base_from_workspace_head() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let workspace = svc.workspace_dir().to_path_buf();

        let ws_repo = Repository::init(&workspace).unwrap();
        write(&workspace, "a.txt", "tracked");
        let mut index = ws_repo.index().unwrap();
        index.add_path(Path::new("a.txt")).unwrap();
        index.write().unwrap();
        let tree_oid = index.write_tree().unwrap();
        let tree = ws_repo.find_tree(tree_oid).unwrap();
        let sig = Signature::now("dev", "dev@localhost").unwrap();
        let head_oid = ws_repo
            .commit(Some("HEAD"), &sig, &sig, "seed", &tree, &[])
            .unwrap();

        svc.init().unwrap();
        assert_eq!(svc.base_hash(), Some(head_oid.to_string()));
    }

    #[test]
    fn test_save_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let workspace = svc.workspace_dir().to_path_buf();
        let mut events = svc.subscribe();

        write(&workspace, "a.txt", "one");
        svc.init().unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(CheckpointEvent::Initialize { created: true, .. })
        ));

        let cp1 = svc.save_checkpoint("first", false, false).unwrap().unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(CheckpointEvent::Checkpoint { .. })
        ));

        write(&workspace, "a.txt", "two");
        write(&workspace, "b.txt", "new file");
        let cp2 = svc.save_checkpoint("second", false, false).unwrap().unwrap();
        assert_eq!(svc.checkpoints(), vec![cp1.clone(), cp2]);

        svc.restore_checkpoint(&cp1).unwrap();
        assert_eq!(std::fs::read_to_string(workspace.join("a.txt")).unwrap(), "one");
        assert!(!workspace.join("b.txt").exists());
        // Linear truncating history: cp2 is gone.
        assert_eq!(svc.checkpoints(), vec![cp1]);
    }

    #[test]
    fn test_clean_workspace_skips_checkpoint_unless_allow_empty() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        write(svc.workspace_dir(), "a.txt", "content");
        svc.init().unwrap();
        svc.save_checkpoint("first", false, false).unwrap().unwrap();

        assert!(svc.save_checkpoint("noop", false, false).unwrap().is_none());
        assert!(svc.save_checkpoint("forced", true, false).unwrap().is_some());
    }

    #[test]
    fn test_init_reuses_valid_repo() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        write(svc.workspace_dir(), "a.txt", "x");
        svc.init().unwrap();
        let cp = svc.save_checkpoint("cp", false, false).unwrap().unwrap();

        // Second service over the same storage reuses the repo; its base
        // is the existing head.
        let svc2 = ShadowCheckpointService::new(
            "task-1",
            dir.path().join("storage/checkpoints"),
            svc.workspace_dir(),
        )
        .unwrap();
        let mut events = svc2.subscribe();
        svc2.init().unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(CheckpointEvent::Initialize { created: false, .. })
        ));
        assert_eq!(svc2.base_hash().unwrap(), cp);
    }

    #[test]
    fn test_stale_repo_for_other_workspace_is_recreated() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        write(svc.workspace_dir(), "a.txt", "x");
        svc.init().unwrap();

        let other_workspace = dir.path().join("other");
        std::fs::create_dir_all(&other_workspace).unwrap();
        let svc2 = ShadowCheckpointService::new(
            "task-2",
            dir.path().join("storage/checkpoints"),
            &other_workspace,
        )
        .unwrap();
        let mut events = svc2.subscribe();
        svc2.init().unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(CheckpointEvent::Initialize { created: true, .. })
        ));
    }

    #[test]
    fn test_diff_against_worktree_and_between_commits() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let workspace = svc.workspace_dir().to_path_buf();
        write(&workspace, "a.txt", "before");
        svc.init().unwrap();
        let cp1 = svc.save_checkpoint("first", false, false).unwrap().unwrap();

        write(&workspace, "a.txt", "after");
        let live = svc.get_diff(Some(&cp1), None).unwrap();
        let entry = live.iter().find(|e| e.path == "a.txt").unwrap();
        assert_eq!(entry.before, "before");
        assert_eq!(entry.after, "after");

        let cp2 = svc.save_checkpoint("second", false, false).unwrap().unwrap();
        let between = svc.get_diff(Some(&cp1), Some(&cp2)).unwrap();
        let entry = between.iter().find(|e| e.path == "a.txt").unwrap();
        assert_eq!(entry.before, "before");
        assert_eq!(entry.after, "after");
    }

    #[test]
    fn test_save_before_init_fails() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let err = svc.save_checkpoint("early", false, false).unwrap_err();
        assert!(matches!(err, CheckpointError::NotInitialized));
    }

    #[test]
    fn test_hash_workspace_dir_is_short_and_stable() {
        let a = ShadowCheckpointService::hash_workspace_dir(Path::new("/w/one"));
        let b = ShadowCheckpointService::hash_workspace_dir(Path::new("/w/one"));
        let c = ShadowCheckpointService::hash_workspace_dir(Path::new("/w/two"));
        assert_eq!(a.len(), 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_gitfile_indirection_resolves_objects_dir() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path().join("workspace");
        let real_git = dir.path().join("elsewhere/git");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::create_dir_all(&real_git).unwrap();
        std::fs::write(
            workspace.join(".git"),
            format!("gitdir: {}\n", real_git.display()),
        )
        .unwrap();

        let objects = workspace_objects_dir(&workspace).unwrap();
        assert_eq!(objects, real_git.join("objects"));
    }

    #[test]
    fn test_delete_task_branch() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        let storage = dir.path().join("storage");
        let repo_dir =
            ShadowCheckpointService::workspace_repo_dir(&storage, &workspace);
        std::fs::create_dir_all(&repo_dir).unwrap();

        // Seed a workspace-scoped repo with a main branch and a task
        // branch, task branch checked out.
        let repo = Repository::init(&repo_dir).unwrap();
        let sig = Signature::now("t", "t@localhost").unwrap();
        let tree_oid = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_oid).unwrap();
        let base = repo
            .commit(Some("refs/heads/main"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        let base_commit = repo.find_commit(base).unwrap();
        repo.branch("task-t9", &base_commit, false).unwrap();
        repo.set_head("refs/heads/task-t9").unwrap();
        drop(tree);
        drop(base_commit);
        drop(repo);

        ShadowCheckpointService::delete_task_branch(&storage, "t9", &workspace).unwrap();

        let repo = Repository::open(&repo_dir).unwrap();
        assert!(repo.find_branch("task-t9", BranchType::Local).is_err());
        assert_eq!(repo.head().unwrap().shorthand(), Some("main"));
    }

    #[test]
    fn test_delete_missing_branch_errors() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        let storage = dir.path().join("storage");
        let repo_dir =
            ShadowCheckpointService::workspace_repo_dir(&storage, &workspace);
        std::fs::create_dir_all(&repo_dir).unwrap();
        Repository::init(&repo_dir).unwrap();

        let err = ShadowCheckpointService::delete_task_branch(&storage, "nope", &workspace)
            .unwrap_err();
        assert!(matches!(err, CheckpointError::BranchNotFound { .. }));
    }
}
