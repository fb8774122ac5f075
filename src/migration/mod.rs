//! Migration transformer.
//!
//! Applies parsed migration steps to the files of a repository with
//! stash-backed rollback: pre-existing uncommitted work is stashed before
//! the first write, restored afterwards, and required to restore if the
//! transformation aborts mid-way.

pub mod rewrite;
pub mod steps;
pub mod targets;

pub use rewrite::{NodeRewriter, RewriteError, RewriteOutcome, Rewriter};
pub use steps::{parse_steps, MigrationStep, ParsedStep};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::fs;

use crate::gitflow::{GitCli, GitError};

const STASH_MESSAGE: &str = "migration-transformer-backup";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("git failure: {0}")]
    Git(#[from] GitError),
    #[error("failed to read {file}: {message}")]
    Io { file: PathBuf, message: String },
    #[error("transform failed in {file}: {source}")]
    Transform {
        file: PathBuf,
        #[source]
        source: RewriteError,
    },
    /// The working tree was rolled back but the pre-existing stash could
    /// not be restored. Operators must recover `stash@{0}` by hand.
    #[error("rollback incomplete, stashed changes need manual recovery: {0}")]
    RollbackFailed(String),
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub files_changed: Vec<PathBuf>,
    /// Files skipped with the reason (parse errors).
    pub files_skipped: Vec<(PathBuf, String)>,
    pub steps_parsed: usize,
    pub steps_dropped: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub exclude_dirs: Vec<String>,
    pub dry_run: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            exclude_dirs: vec!["node_modules".to_string(), ".git".to_string()],
            dry_run: false,
        }
    }
}

pub struct MigrationEngine {
    cli: GitCli,
    rewriter: Arc<dyn Rewriter>,
    config: MigrationConfig,
}

impl MigrationEngine {
    pub fn new(rewriter: Arc<dyn Rewriter>, config: MigrationConfig) -> Result<Self, GitError> {
        Ok(Self {
            cli: GitCli::new()?,
            rewriter,
            config,
        })
    }

    /// Applies the given suggestion texts to `repo`. An empty or fully
    /// unparseable step list is a no-op: nothing is written and no stash
    /// is taken.
    pub async fn apply(
        &self,
        repo: &Path,
        descriptions: &[String],
    ) -> Result<MigrationReport, MigrationError> {
        let parsed = parse_steps(descriptions);
        let mut report = MigrationReport {
            steps_parsed: parsed.len(),
            steps_dropped: descriptions.len() - parsed.len(),
            dry_run: self.config.dry_run,
            ..MigrationReport::default()
        };
        if parsed.is_empty() {
            return Ok(report);
        }

        let targets = targets::resolve_targets(repo, &parsed, &self.config.exclude_dirs);

        // Per-file step lists, preserving step input order within a file.
        let mut by_file: BTreeMap<PathBuf, Vec<MigrationStep>> = BTreeMap::new();
        for (idx, files) in targets.iter().enumerate() {
            for file in files {
                by_file
                    .entry(file.clone())
                    .or_default()
                    .push(parsed[idx].step.clone());
            }
        }
        if by_file.is_empty() {
            return Ok(report);
        }

        let stashed = if self.config.dry_run {
            false
        } else {
            self.stash_existing_changes(repo).await?
        };

        for (file, file_steps) in &by_file {
            let absolute = repo.join(file);
            let source = match fs::read_to_string(&absolute).await {
                Ok(source) => source,
                Err(err) => {
                    self.rollback(repo, stashed).await?;
                    return Err(MigrationError::Io {
                        file: file.clone(),
                        message: err.to_string(),
                    });
                }
            };

            match self.rewriter.rewrite(file, &source, file_steps).await {
                Ok(RewriteOutcome::Unchanged) => {}
                Ok(RewriteOutcome::Rewritten(output)) => {
                    if !self.config.dry_run {
                        if let Err(err) = fs::write(&absolute, output).await {
                            self.rollback(repo, stashed).await?;
                            return Err(MigrationError::Io {
                                file: file.clone(),
                                message: err.to_string(),
                            });
                        }
                    }
                    report.files_changed.push(file.clone());
                }
                Err(RewriteError::Parse(message)) => {
                    tracing::warn!("Skipping {} with parse error: {}", file.display(), message);
                    report.files_skipped.push((file.clone(), message));
                }
                Err(err) => {
                    self.rollback(repo, stashed).await?;
                    return Err(MigrationError::Transform {
                        file: file.clone(),
                        source: err,
                    });
                }
            }
        }

        if stashed {
            // Restore pre-existing work on top of the transformed tree.
            // Non-fatal here: the transformation itself succeeded.
            if let Err(err) = self.cli.run(repo, &["stash", "pop"]).await {
                tracing::warn!("Could not pop migration backup stash: {}", err);
            }
        }

        Ok(report)
    }

    /// Stashes uncommitted pre-existing changes, including untracked files.
    /// Returns whether a stash was actually taken.
    async fn stash_existing_changes(&self, repo: &Path) -> Result<bool, MigrationError> {
        let status = self.cli.run(repo, &["status", "--porcelain"]).await?;
        if status.is_empty() {
            return Ok(false);
        }
        self.cli
            .run(repo, &["stash", "push", "-u", "-m", STASH_MESSAGE])
            .await?;
        tracing::info!("Stashed pre-existing changes as {}", STASH_MESSAGE);
        Ok(true)
    }

    /// Undoes transformer writes (`checkout .` + `clean -fd`), then pops
    /// the backup stash. The pop is required: failing to restore the
    /// operator's own work must surface loudly.
    async fn rollback(&self, repo: &Path, stashed: bool) -> Result<(), MigrationError> {
        if self.config.dry_run {
            return Ok(());
        }
        self.cli
            .run(repo, &["checkout", "."])
            .await
            .map_err(|e| MigrationError::RollbackFailed(e.to_string()))?;
        self.cli
            .run(repo, &["clean", "-fd"])
            .await
            .map_err(|e| MigrationError::RollbackFailed(e.to_string()))?;
        if stashed {
            self.cli
                .run(repo, &["stash", "pop"])
                .await
                .map_err(|e| MigrationError::RollbackFailed(e.to_string()))?;
        }
        Ok(())
    }
}

impl MigrationError {
    /// Rollback failures are repository-integrity failures; the process
    /// exit contract reserves a distinct code for them.
    pub fn is_rollback_failure(&self) -> bool {
        matches!(self, MigrationError::RollbackFailed(_))
    }
}

impl From<MigrationError> for crate::jobs::HandlerError {
    fn from(err: MigrationError) -> Self {
        let code = match &err {
            MigrationError::RollbackFailed(_) => "rollback-failed",
            MigrationError::Transform { .. } => "transform-error",
            MigrationError::Io { .. } => "file-not-found",
            MigrationError::Git(_) => "git-error",
        };
        crate::jobs::HandlerError::with_code(err.to_string(), code)
    }
}
