use super::{Checkpoint, CheckpointStore};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use git2::{IndexAddOption, Repository, Signature, Status, StatusOptions, build::CheckoutBuilder};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

/// One lock per repository: parallel agents share a workdir and index.
static REPO_LOCKS: LazyLock<DashMap<PathBuf, Arc<Mutex<()>>>> = LazyLock::new(DashMap::new);

fn repo_lock(path: &Path) -> Arc<Mutex<()>> {
    REPO_LOCKS
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Open the repository at `path`, initializing one if none exists.
pub fn ensure_repository(path: &Path) -> Result<()> {
    if Repository::open(path).is_ok() {
        return Ok(());
    }
    Repository::init(path)
        .with_context(|| format!("Failed to initialize git repository at {}", path.display()))?;
    Ok(())
}

/// Git-backed checkpoints limited to a set of pathspecs.
///
/// Each agent gets a store scoped to its own deliverables, so snapshots and
/// rollbacks of parallel agents in one repository touch disjoint paths. An
/// empty scope covers the whole repository.
#[derive(Clone)]
pub struct GitCheckpointStore {
    repo_path: PathBuf,
    scope: Vec<String>,
    lock: Arc<Mutex<()>>,
}

impl GitCheckpointStore {
    pub fn new(repo_path: &Path) -> Self {
        Self::scoped(repo_path, Vec::new())
    }

    pub fn scoped(repo_path: &Path, scope: Vec<String>) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            scope,
            lock: repo_lock(repo_path),
        }
    }

    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    fn pathspecs(&self) -> Vec<String> {
        if self.scope.is_empty() {
            vec!["*".to_string()]
        } else {
            self.scope.clone()
        }
    }

    /// Run a git operation on a blocking thread while holding the repository lock.
    async fn with_repo<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Repository, &[String]) -> Result<T> + Send + 'static,
    {
        let repo_path = self.repo_path.clone();
        let pathspecs = self.pathspecs();
        let lock = self.lock.clone();

        tokio::task::spawn_blocking(move || {
            let _guard = lock
                .lock()
                .map_err(|e| anyhow!("Repository lock poisoned: {}", e))?;
            let repo = Repository::open(&repo_path).with_context(|| {
                format!("Failed to open git repository at {}", repo_path.display())
            })?;
            op(&repo, &pathspecs)
        })
        .await
        .context("Git task panicked")?
    }
}

/// Stage everything under `pathspecs` (including deletions) and commit it on HEAD.
fn commit_scope(repo: &Repository, pathspecs: &[String], message: &str) -> Result<String> {
    let mut index = repo.index()?;
    index.add_all(pathspecs.iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(pathspecs.iter(), None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now("warden", "warden@localhost")?;

    // Unborn branch: first checkpoint has no parent.
    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
    let commit_id = match parent {
        Some(parent) => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?,
        None => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?,
    };

    Ok(commit_id.to_string())
}

fn restore_scope(repo: &Repository, pathspecs: &[String], checkpoint_id: &str) -> Result<()> {
    let oid = git2::Oid::from_str(checkpoint_id)?;
    let commit = repo
        .find_commit(oid)
        .with_context(|| format!("Checkpoint {} not found", checkpoint_id))?;
    let tree = commit.tree()?;

    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    for spec in pathspecs {
        checkout.path(spec);
    }
    repo.checkout_tree(tree.as_object(), Some(&mut checkout))?;

    // Anything created since the checkpoint is not in its tree and has to go.
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    for spec in pathspecs {
        opts.pathspec(spec);
    }

    let workdir = repo
        .workdir()
        .ok_or_else(|| anyhow!("Cannot roll back a bare repository"))?
        .to_path_buf();
    let created: Vec<(String, bool)> = repo
        .statuses(Some(&mut opts))?
        .iter()
        .filter(|entry| entry.status().intersects(Status::WT_NEW | Status::INDEX_NEW))
        .filter_map(|entry| {
            let path = entry.path()?.to_string();
            Some((path, entry.status().contains(Status::INDEX_NEW)))
        })
        .filter(|(path, _)| tree.get_path(Path::new(path)).is_err())
        .collect();

    let mut index = repo.index()?;
    for (path, staged) in &created {
        let full = workdir.join(path);
        if full.is_file() {
            std::fs::remove_file(&full)
                .with_context(|| format!("Failed to remove {}", full.display()))?;
        }
        if *staged {
            index.remove_path(Path::new(path))?;
        }
    }
    index.write()?;

    Ok(())
}

#[async_trait]
impl CheckpointStore for GitCheckpointStore {
    async fn create(&self, label: &str, attempt: u32) -> Result<Checkpoint> {
        let message = format!("[warden] checkpoint {} attempt {}", label, attempt);
        let id = self
            .with_repo(move |repo, specs| commit_scope(repo, specs, &message))
            .await
            .with_context(|| format!("Failed to create checkpoint for {}", label))?;

        tracing::debug!(agent = label, attempt, checkpoint = %id, "checkpoint created");
        Ok(Checkpoint {
            id,
            label: label.to_string(),
            attempt,
        })
    }

    async fn rollback(&self, checkpoint: &Checkpoint) -> Result<()> {
        let id = checkpoint.id.clone();
        self.with_repo(move |repo, specs| restore_scope(repo, specs, &id))
            .await
            .with_context(|| format!("Failed to roll back {}", checkpoint.label))?;

        tracing::debug!(
            agent = %checkpoint.label,
            attempt = checkpoint.attempt,
            checkpoint = %checkpoint.id,
            "workspace rolled back"
        );
        Ok(())
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<String> {
        let message = format!(
            "[warden] {} completed (attempt {})",
            checkpoint.label, checkpoint.attempt
        );
        self.with_repo(move |repo, specs| commit_scope(repo, specs, &message))
            .await
            .with_context(|| format!("Failed to commit {}", checkpoint.label))
    }
}
