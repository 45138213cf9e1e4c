//! Data-versioning tool adapters.
//!
//! Snapshot files are handed to a [`DataTracker`] after they are written.
//! Tracking is best effort: callers log failures and carry on.

use crate::errors::{DatasetError, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, info, warn};

/// Registers written files with a content-addressed versioning tool.
pub trait DataTracker: Send + Sync {
    /// Track `paths`, all located under `repo_root`.
    fn track(&self, repo_root: &Path, paths: &[PathBuf]) -> Result<()>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Tracker that does nothing. Used when no versioning tool is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl DataTracker for NoopTracker {
    fn track(&self, repo_root: &Path, paths: &[PathBuf]) -> Result<()> {
        debug!(repo = %repo_root.display(), files = paths.len(), "Tracking disabled");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Tracker backed by the `dvc` command line tool, optionally committing the
/// generated `.dvc` pointer files with `git`.
#[derive(Debug, Clone)]
pub struct DvcTracker {
    dvc_bin: PathBuf,
    git_bin: PathBuf,
    commit: bool,
}

impl Default for DvcTracker {
    fn default() -> Self {
        Self {
            dvc_bin: PathBuf::from("dvc"),
            git_bin: PathBuf::from("git"),
            commit: true,
        }
    }
}

impl DvcTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binaries(dvc_bin: impl Into<PathBuf>, git_bin: impl Into<PathBuf>) -> Self {
        Self {
            dvc_bin: dvc_bin.into(),
            git_bin: git_bin.into(),
            commit: true,
        }
    }

    /// Skip the `git add` / `git commit` of pointer files.
    pub fn without_commit(mut self) -> Self {
        self.commit = false;
        self
    }

    fn run(&self, program: &Path, args: &[&str], cwd: &Path) -> Result<Output> {
        let tool = program.display().to_string();
        debug!(%tool, ?args, cwd = %cwd.display(), "Running external tool");

        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|e| DatasetError::ExternalTool {
                tool: tool.clone(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(DatasetError::ExternalTool {
                tool,
                reason: format!(
                    "{} exited with {}: {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }

    /// Initialise a repository without SCM when `dvc status` fails.
    fn ensure_repo(&self, repo_root: &Path) -> Result<()> {
        if self.run(&self.dvc_bin, &["status"], repo_root).is_ok() {
            return Ok(());
        }
        self.run(&self.dvc_bin, &["init", "--no-scm"], repo_root)?;
        info!(repo = %repo_root.display(), "Initialised data repository");
        Ok(())
    }
}

impl DataTracker for DvcTracker {
    fn track(&self, repo_root: &Path, paths: &[PathBuf]) -> Result<()> {
        self.ensure_repo(repo_root)?;

        for path in paths {
            let relative = path.strip_prefix(repo_root).unwrap_or(path);
            let relative = relative.to_string_lossy();
            self.run(&self.dvc_bin, &["add", relative.as_ref()], repo_root)?;

            if self.commit {
                let pointer = format!("{relative}.dvc");
                let message = format!("Add {relative} to DVC");
                if let Err(err) = self
                    .run(&self.git_bin, &["add", pointer.as_str()], repo_root)
                    .and_then(|_| {
                        self.run(&self.git_bin, &["commit", "-m", message.as_str()], repo_root)
                    })
                {
                    warn!(file = %relative, error = %err, "Could not commit pointer file");
                }
            }
        }

        info!(repo = %repo_root.display(), files = paths.len(), "Tracked files");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dvc"
    }
}

/// Track files, logging instead of failing.
pub fn track_best_effort(tracker: &dyn DataTracker, repo_root: &Path, paths: &[PathBuf]) {
    if let Err(err) = tracker.track(repo_root, paths) {
        warn!(
            tracker = tracker.name(),
            repo = %repo_root.display(),
            error = %err,
            "Data tracking failed; continuing without it"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_noop_tracker() {
        let dir = tempdir().unwrap();
        assert!(NoopTracker.track(dir.path(), &[dir.path().join("a")]).is_ok());
    }

    #[test]
    fn test_missing_binary_is_reported_not_panicking() {
        let dir = tempdir().unwrap();
        let tracker = DvcTracker::with_binaries(
            dir.path().join("no-such-dvc"),
            dir.path().join("no-such-git"),
        );
        let err = tracker
            .track(dir.path(), &[dir.path().join("file.csv")])
            .unwrap_err();
        assert!(matches!(err, DatasetError::ExternalTool { .. }));

        // best effort wrapper swallows the failure
        track_best_effort(&tracker, dir.path(), &[dir.path().join("file.csv")]);
    }
}
