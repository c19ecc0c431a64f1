//! Per-run working directories and their retention.
//!
//! Every `/detect` request gets a fresh workspace under
//! `<runs_dir>/<run_id>/` so concurrent runs never share files. Completed
//! runs keep only their annotated results and are evicted once more than
//! `max_retained` runs exist or once they outlive the retention window.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::constants::{FRAMES_DIR, RESULTS_DIR, UPLOAD_STEM, UPLOADS_DIR};

/// Scratch and result directories owned by one run
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    id: String,
    root: PathBuf,
}

impl RunWorkspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.root.join(FRAMES_DIR)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join(RESULTS_DIR)
    }

    /// Where the uploaded video is stored, e.g. `uploads/input.mp4`
    pub fn upload_path(&self, extension: &str) -> PathBuf {
        self.uploads_dir().join(format!("{}.{}", UPLOAD_STEM, extension))
    }

    /// Drop the upload and sampled frames; results stay.
    async fn release_scratch(&self) {
        for dir in [self.uploads_dir(), self.frames_dir()] {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                log::warn!("[runs] Failed to release {:?}: {}", dir, e);
            }
        }
    }
}

/// A workspace whose request has not handed it off yet.
/// Dropping it without [`PendingRun::into_workspace`] discards the run.
pub struct PendingRun {
    registry: Arc<RunRegistry>,
    workspace: RunWorkspace,
    armed: bool,
}

impl PendingRun {
    pub fn workspace(&self) -> &RunWorkspace {
        &self.workspace
    }

    /// Take ownership of the workspace; the caller now completes or discards it.
    pub fn into_workspace(mut self) -> RunWorkspace {
        self.armed = false;
        self.workspace.clone()
    }
}

impl Drop for PendingRun {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::info!("[runs] Run {} abandoned before processing", self.workspace.id);
        let registry = self.registry.clone();
        let workspace = self.workspace.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { registry.discard(workspace).await });
            }
            Err(_) => {
                if let Err(e) = std::fs::remove_dir_all(&workspace.root) {
                    log::warn!("[runs] Failed to remove {:?}: {}", workspace.root, e);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CompletedRun {
    id: String,
    completed_at: DateTime<Utc>,
}

/// Tracks completed runs and deletes the ones past retention
pub struct RunRegistry {
    root: PathBuf,
    max_retained: usize,
    retention: Duration,
    completed: Mutex<VecDeque<CompletedRun>>,
}

/// `20261017093015-1a2b3c4d`
pub fn new_run_id() -> String {
    format!(
        "{}-{:08x}",
        Utc::now().format("%Y%m%d%H%M%S"),
        rand::random::<u32>()
    )
}

/// A single path component that cannot escape its parent directory
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
        && !name.contains("..")
}

impl RunRegistry {
    /// Wipe leftovers from a previous process and create the runs root.
    pub async fn init(root: PathBuf, max_retained: usize, retention: Duration) -> std::io::Result<Self> {
        if tokio::fs::try_exists(&root).await? {
            tokio::fs::remove_dir_all(&root).await?;
        }
        tokio::fs::create_dir_all(&root).await?;
        log::info!(
            "[runs] Workspace root {:?} (keep {} runs, {}s retention)",
            root,
            max_retained,
            retention.as_secs()
        );

        Ok(Self {
            root,
            max_retained: max_retained.max(1),
            retention,
            completed: Mutex::new(VecDeque::new()),
        })
    }

    fn completed(&self) -> MutexGuard<'_, VecDeque<CompletedRun>> {
        self.completed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a fresh workspace with empty upload, frame and result directories.
    pub async fn allocate(&self) -> std::io::Result<RunWorkspace> {
        let id = new_run_id();
        let workspace = RunWorkspace {
            root: self.root.join(&id),
            id,
        };

        for dir in [
            workspace.uploads_dir(),
            workspace.frames_dir(),
            workspace.results_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        log::debug!("[runs] Allocated run {}", workspace.id);
        Ok(workspace)
    }

    /// Allocate a workspace that is discarded if dropped before hand-off.
    pub async fn begin(self: &Arc<Self>) -> std::io::Result<PendingRun> {
        let workspace = self.allocate().await?;
        Ok(PendingRun {
            registry: self.clone(),
            workspace,
            armed: true,
        })
    }

    /// Mark a run finished: release scratch files, register its results and
    /// evict the oldest runs beyond the retention count.
    pub async fn complete(&self, workspace: &RunWorkspace) {
        workspace.release_scratch().await;

        let evicted: Vec<CompletedRun> = {
            let mut completed = self.completed();
            completed.push_back(CompletedRun {
                id: workspace.id.clone(),
                completed_at: Utc::now(),
            });
            let excess = completed.len().saturating_sub(self.max_retained);
            completed.drain(..excess).collect()
        };

        for run in evicted {
            self.remove_run_dir(&run.id).await;
        }
    }

    /// Delete a run that did not complete.
    pub async fn discard(&self, workspace: RunWorkspace) {
        self.remove_run_dir(&workspace.id).await;
    }

    async fn remove_run_dir(&self, run_id: &str) {
        let dir = self.root.join(run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => log::info!("[runs] Released run {}", run_id),
            Err(e) => log::warn!("[runs] Failed to remove {:?}: {}", dir, e),
        }
    }

    /// Most recently completed run still retained
    pub fn latest(&self) -> Option<String> {
        self.completed().back().map(|run| run.id.clone())
    }

    pub fn is_retained(&self, run_id: &str) -> bool {
        self.completed().iter().any(|run| run.id == run_id)
    }

    /// Path of an annotated result, if the run is retained and the name is safe.
    /// The file itself may not exist.
    pub fn result_path(&self, run_id: &str, filename: &str) -> Option<PathBuf> {
        if !is_safe_component(run_id) || !is_safe_component(filename) {
            return None;
        }
        if !self.is_retained(run_id) {
            return None;
        }
        Some(self.root.join(run_id).join(RESULTS_DIR).join(filename))
    }

    /// Evict completed runs older than the retention window. Returns how many were removed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<CompletedRun> = {
            let mut completed = self.completed();
            let (expired, kept): (Vec<_>, Vec<_>) = completed.drain(..).partition(|run| {
                now.signed_duration_since(run.completed_at)
                    .to_std()
                    .is_ok_and(|age| age >= self.retention)
            });
            completed.extend(kept);
            expired
        };

        for run in &expired {
            self.remove_run_dir(&run.id).await;
        }
        expired.len()
    }
}

/// Periodically evict runs past the retention window.
pub async fn run_retention_sweeper(registry: Arc<RunRegistry>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    log::info!("[runs] Retention sweeper starting ({}s interval)", every.as_secs());

    loop {
        interval.tick().await;
        let removed = registry.sweep_expired(Utc::now()).await;
        if removed > 0 {
            log::info!("[runs] Sweep removed {} expired runs", removed);
        }
    }
}
