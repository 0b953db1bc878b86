// src/core/archive.rs

//! External archiving of checkpoint files.
//!
//! The core only knows "archive these files with this message"; the git
//! implementation commits them to a branch and pushes it.

use async_trait::async_trait;
use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ArchiveError;

/// What an archive call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub branch: String,
    pub commit: Option<String>,
}

#[async_trait]
pub trait Archiver: Send + Sync {
    async fn archive(&self, files: &[PathBuf], message: &str) -> Result<ArchiveRecord, ArchiveError>;
}

/// Used when archiving is turned off.
pub struct NoopArchiver;

#[async_trait]
impl Archiver for NoopArchiver {
    async fn archive(&self, _files: &[PathBuf], _message: &str) -> Result<ArchiveRecord, ArchiveError> {
        Ok(ArchiveRecord {
            branch: String::new(),
            commit: None,
        })
    }
}

/// Default branch name: `scan` followed by today's local date.
pub fn default_branch_name() -> String {
    format!("scan{}", Local::now().format("%Y%m%d"))
}

/// Commit message for a checkpoint.
pub fn commit_message(result_count: usize) -> String {
    format!(
        "Next.js scan result | {} | {} sites",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        result_count
    )
}

/// Commits and pushes files with the `git` binary.
pub struct GitArchiver {
    repo_dir: PathBuf,
    branch: String,
    remote: String,
}

impl GitArchiver {
    pub fn new(repo_dir: impl Into<PathBuf>, branch: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            branch: branch.into(),
            remote: remote.into(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String, ArchiveError> {
        run_git(&self.repo_dir, args).await
    }
}

/// Output paths are relative to the process, git runs inside `repo_dir`, so
/// files are handed to git as absolute paths.
fn pathspec(file: &Path) -> Result<String, ArchiveError> {
    std::path::absolute(file)
        .map(|path| path.display().to_string())
        .map_err(|source| ArchiveError::Path {
            path: file.to_path_buf(),
            source,
        })
}

async fn run_git(repo_dir: &Path, args: &[&str]) -> Result<String, ArchiveError> {
    let command = format!("git {}", args.join(" "));
    debug!(%command, "Running archive command.");
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .await
        .map_err(|source| ArchiveError::Spawn {
            command: command.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(ArchiveError::Exit {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl Archiver for GitArchiver {
    async fn archive(&self, files: &[PathBuf], message: &str) -> Result<ArchiveRecord, ArchiveError> {
        // -B resets the branch to HEAD if it already exists from an earlier checkpoint.
        let current = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        if current != self.branch {
            self.git(&["checkout", "-B", &self.branch]).await?;
        }

        let paths = files.iter().map(|p| pathspec(p)).collect::<Result<Vec<_>, _>>()?;
        let mut add = vec!["add", "--"];
        add.extend(paths.iter().map(String::as_str));
        self.git(&add).await?;

        // Nothing staged means the files are unchanged since the last checkpoint.
        let staged = self.git(&["diff", "--cached", "--name-only"]).await?;
        if staged.is_empty() {
            debug!(branch = %self.branch, "Nothing new to archive.");
            return Ok(ArchiveRecord {
                branch: self.branch.clone(),
                commit: None,
            });
        }

        self.git(&["commit", "-m", message]).await?;
        self.git(&["push", "-u", &self.remote, &self.branch]).await?;
        let commit = self.git(&["rev-parse", "HEAD"]).await?;
        info!(branch = %self.branch, %commit, "Archived checkpoint.");
        Ok(ArchiveRecord {
            branch: self.branch.clone(),
            commit: Some(commit),
        })
    }
}
