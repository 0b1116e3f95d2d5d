//! Artifact storage is where a package job's build output ends up once the executor
//! finishes. The scheduler only ever talks to the [`ArtifactStorage`] trait; the chosen
//! backend (a local directory here, an object-store prefix in a fuller deployment) is
//! opaque to it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Common trait for artifact storage backends.
pub trait ArtifactStorage: Send + Sync {
    /// The directory a worker should point an executor's output at for `job_id`. The
    /// directory need not exist yet; implementations create it lazily.
    fn output_dir(&self, job_id: &str) -> PathBuf;

    /// Persists whatever the executor wrote at `from` as `job_id`'s permanent output.
    /// For a filesystem backend rooted at the same location `output_dir` returns, this is
    /// typically a no-op; it exists so an object-store backend has a hook to upload.
    fn sync_output_dir(&self, job_id: &str, from: &Path) -> Result<()>;
}

/// Filesystem-rooted artifact storage. `output_dir` and `sync_output_dir`'s source are the
/// same directory, so sync is a no-op unless the worker wrote somewhere else first.
pub struct FilesystemArtifactStorage {
    root: PathBuf,
}

impl FilesystemArtifactStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactStorage for FilesystemArtifactStorage {
    fn output_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    fn sync_output_dir(&self, job_id: &str, from: &Path) -> Result<()> {
        let dest = self.output_dir(job_id);
        std::fs::create_dir_all(&dest)
            .with_context(|| format!("failed to create output directory {}", dest.display()))?;

        if from == dest {
            return Ok(());
        }

        copy_dir_contents(from, &dest)
            .with_context(|| format!("failed to sync {} into {}", from.display(), dest.display()))
    }
}

fn copy_dir_contents(from: &Path, to: &Path) -> Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&dest)?;
            copy_dir_contents(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}
