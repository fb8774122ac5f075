//! Thin wrapper over the `git` CLI.
//!
//! Working-tree mutations go through the CLI rather than libgit2 so git's
//! own refusal to clobber uncommitted work stays in effect.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use super::GitError;

#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl GitCli {
    pub fn new() -> Result<Self, GitError> {
        let program = which::which("git").map_err(|_| GitError::NotAvailable)?;
        Ok(Self { program })
    }

    /// Runs `git -C <repo> <args...>` and returns trimmed stdout.
    pub async fn run(&self, repo: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new(&self.program)
            .arg("-C")
            .arg(repo)
            .args(args)
            .output()
            .await
            .map_err(|e| GitError::Command(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(GitError::Command(if stderr.is_empty() {
                format!("git {} exited with {}", args.join(" "), output.status)
            } else {
                stderr
            }));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Like [`GitCli::run`] but success is just the exit status.
    pub async fn run_ok(&self, repo: &Path, args: &[&str]) -> bool {
        self.run(repo, args).await.is_ok()
    }
}
