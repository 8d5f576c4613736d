use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

use super::error::SandboxError;

/// Warm base dependency install shared by all local previews.
///
/// Generated projects share one framework dependency set, so the cache
/// runs the install once and new sandboxes copy the result instead of
/// paying for a full install each time. The copy is a real copy, never a
/// symlink: a preview that later adds its own packages must not write
/// into the shared tree.
pub struct DependencyCache {
    cache_dir: PathBuf,
    /// Package whose manifest proves the cache is complete.
    base_package: String,
    /// Command run inside `cache_dir` to build the cache (e.g. npm install).
    warm_command: Vec<String>,
    rebuild: Mutex<()>,
    warm_runs: AtomicUsize,
}

impl DependencyCache {
    pub fn new(cache_dir: PathBuf, base_package: String, warm_command: Vec<String>) -> Self {
        Self {
            cache_dir,
            base_package,
            warm_command,
            rebuild: Mutex::new(()),
            warm_runs: AtomicUsize::new(0),
        }
    }

    /// Path to the cached dependency tree.
    pub fn modules_dir(&self) -> PathBuf {
        self.cache_dir.join("node_modules")
    }

    /// How many rebuilds have actually run.
    pub fn warm_runs(&self) -> usize {
        self.warm_runs.load(Ordering::SeqCst)
    }

    /// Whether the cache is safe to reuse.
    ///
    /// Checks for the base package's own manifest rather than the modules
    /// directory: a partially completed install leaves the directory
    /// behind, and a symlinked tree resolves the manifest check against
    /// whatever it points at, so both fail here.
    pub fn is_valid(&self) -> bool {
        let base_dir = self.modules_dir().join(&self.base_package);
        if base_dir.is_symlink() {
            return false;
        }
        let manifest = base_dir.join("package.json");
        !manifest.is_symlink() && manifest.is_file()
    }

    /// Make sure the cache is built. Concurrent callers on a cold cache
    /// wait on the one rebuild instead of starting their own.
    pub async fn ensure_warm(&self) -> Result<(), SandboxError> {
        if self.is_valid() {
            return Ok(());
        }

        let _guard = self.rebuild.lock().await;
        // Another caller may have finished the rebuild while we waited.
        if self.is_valid() {
            return Ok(());
        }

        tracing::info!(
            cache_dir = %self.cache_dir.display(),
            base_package = %self.base_package,
            "warming dependency cache"
        );
        self.warm_runs.fetch_add(1, Ordering::SeqCst);

        tokio::fs::create_dir_all(&self.cache_dir).await.map_err(|e| {
            SandboxError::Provision(format!(
                "failed to create dependency cache dir {}: {e}",
                self.cache_dir.display()
            ))
        })?;

        let (program, args) = self
            .warm_command
            .split_first()
            .ok_or_else(|| SandboxError::Provision("empty dependency warm command".into()))?;

        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.cache_dir)
            .output()
            .await
            .map_err(|e| SandboxError::Provision(format!("dependency warm spawn failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Provision(format!(
                "dependency warm exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        if !self.is_valid() {
            return Err(SandboxError::Provision(format!(
                "dependency warm completed but {} manifest is missing",
                self.base_package
            )));
        }

        tracing::info!(cache_dir = %self.cache_dir.display(), "dependency cache warm");
        Ok(())
    }

    /// Copy the cached dependency tree into a project workspace.
    pub async fn hydrate_into(&self, project_dir: &Path) -> Result<(), SandboxError> {
        self.ensure_warm().await?;

        let src = self.modules_dir();
        let dst = project_dir.join("node_modules");
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(|e| SandboxError::Provision(format!("dependency copy task failed: {e}")))??;
        Ok(())
    }
}

/// Recursive copy. Symlinks inside the tree are skipped rather than
/// followed so a poisoned cache cannot reach outside itself.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), SandboxError> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
