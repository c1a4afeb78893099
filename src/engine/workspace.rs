// Job workspace: job-scoped directory tree and its guaranteed removal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::api::request::JobId;
use crate::config::{CONFIG_DIR, CONFIG_FILE_NAME, MODELS_DIR, OUTPUT_DIR, SCENE_DIR};

/// Canonical paths of one job's workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub scene_dir: PathBuf,
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl WorkspacePaths {
    fn for_root(root: PathBuf) -> Self {
        Self {
            scene_dir: root.join(SCENE_DIR),
            models_dir: root.join(MODELS_DIR),
            output_dir: root.join(OUTPUT_DIR),
            config_dir: root.join(CONFIG_DIR),
            root,
        }
    }

    /// Where the base invocation must write the engine-native scene file.
    pub fn scene_output(&self, job_id: &JobId) -> PathBuf {
        self.output_dir
            .join(format!("scene{}.blend", job_id.path_component()))
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }
}

/// Creates and destroys job workspaces under a common root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    work_root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
        }
    }

    /// Paths for `job_id`, derived deterministically without touching disk.
    pub fn paths(&self, job_id: &JobId) -> WorkspacePaths {
        WorkspacePaths::for_root(self.work_root.join(job_id.path_component()))
    }

    /// Create the four subdirectories. Safe to call when they already exist.
    pub fn prepare(&self, job_id: &JobId) -> io::Result<WorkspacePaths> {
        let paths = self.paths(job_id);
        for dir in [
            &paths.scene_dir,
            &paths.models_dir,
            &paths.output_dir,
            &paths.config_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        debug!("workspace prepared job={} root={}", job_id, paths.root.display());
        Ok(paths)
    }

    /// Remove the workspace recursively. A missing workspace is not an error.
    pub fn cleanup(&self, job_id: &JobId) -> io::Result<()> {
        remove_tree(&self.paths(job_id).root)
    }

    /// Remove the workspace, logging instead of returning any failure.
    pub fn cleanup_quietly(&self, job_id: &JobId) {
        match self.cleanup(job_id) {
            Ok(()) => debug!("workspace removed job={}", job_id),
            Err(e) => warn!("workspace cleanup failed job={}: {}", job_id, e),
        }
    }

    /// Prepare the workspace and return a guard that removes it on drop.
    pub fn acquire(&self, job_id: &JobId) -> io::Result<WorkspaceGuard> {
        let guard = WorkspaceGuard {
            manager: self.clone(),
            job_id: job_id.clone(),
            released: false,
        };
        // The guard exists before any directory does, so a partial prepare is
        // still cleaned up.
        self.prepare(job_id)?;
        Ok(guard)
    }
}

fn remove_tree(root: &Path) -> io::Result<()> {
    match fs::remove_dir_all(root) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Owns a prepared workspace. Dropping it removes the tree, so cleanup also
/// runs on early returns, panics and cancelled futures.
#[derive(Debug)]
pub struct WorkspaceGuard {
    manager: WorkspaceManager,
    job_id: JobId,
    released: bool,
}

impl WorkspaceGuard {
    pub fn paths(&self) -> WorkspacePaths {
        self.manager.paths(&self.job_id)
    }

    /// Remove the workspace now instead of at drop.
    pub fn release(mut self) {
        self.released = true;
        self.manager.cleanup_quietly(&self.job_id);
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if !self.released {
            self.manager.cleanup_quietly(&self.job_id);
        }
    }
}
