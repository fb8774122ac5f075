//! Git workflow manager.
//!
//! Brackets a job that mutates a repository with a branch, commit, push,
//! and pull-request lifecycle. Branch creation and commit failures are
//! fatal for the workflow step; push and PR failures are recorded in the
//! outcome without failing the job.

mod cli;

pub use cli::GitCli;

use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

const COMMIT_ATTRIBUTION: &str = "Automated maintenance commit [alephauto]";
const DESCRIPTION_SLUG_MAX: usize = 30;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("git command failed: {0}")]
    Command(String),
    #[error("branch creation failed: {0}")]
    BranchCreation(String),
    #[error("commit failed: {0}")]
    Commit(String),
    #[error("push failed: {0}")]
    Push(String),
    #[error("pull request creation failed: {0}")]
    PullRequest(String),
}

#[derive(Debug, Clone)]
pub struct GitWorkflowConfig {
    pub base_branch: String,
    pub branch_prefix: String,
    pub dry_run: bool,
    pub github_token: Option<String>,
    pub github_api_base: String,
}

impl Default for GitWorkflowConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            branch_prefix: "automated".to_string(),
            dry_run: false,
            github_token: None,
            github_api_base: "https://api.github.com".to_string(),
        }
    }
}

/// Ephemeral per-job git state, bracketed by branch creation and cleanup.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchContext {
    pub repository_path: String,
    pub original_branch: String,
    pub branch_name: String,
    pub has_changes: bool,
    pub changed_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BranchRequest<'a> {
    pub job_id: &'a str,
    pub job_type: &'a str,
    pub description: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct CommitRequest<'a> {
    pub message: &'a str,
    pub job_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct PrRequest<'a> {
    pub branch_name: &'a str,
    pub title: &'a str,
    pub body: &'a str,
    pub labels: &'a [String],
}

/// Result of a full branch/commit/push/PR pass. Push and PR failures are
/// recorded here rather than propagated.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowOutcome {
    #[serde(flatten)]
    pub context: BranchContext,
    pub pushed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_error: Option<String>,
}

pub struct GitWorkflow {
    cli: GitCli,
    http: reqwest::Client,
    config: GitWorkflowConfig,
}

impl GitWorkflow {
    pub fn new(config: GitWorkflowConfig) -> Result<Self, GitError> {
        Ok(Self {
            cli: GitCli::new()?,
            http: reqwest::Client::new(),
            config,
        })
    }

    pub fn config(&self) -> &GitWorkflowConfig {
        &self.config
    }

    pub async fn is_repo(&self, path: &Path) -> bool {
        path.is_dir()
            && self
                .cli
                .run_ok(path, &["rev-parse", "--is-inside-work-tree"])
                .await
    }

    pub async fn has_changes(&self, path: &Path) -> Result<bool, GitError> {
        let status = self.cli.run(path, &["status", "--porcelain"]).await?;
        Ok(!status.is_empty())
    }

    pub async fn changed_files(&self, path: &Path) -> Result<Vec<String>, GitError> {
        let status = self.cli.run(path, &["status", "--porcelain"]).await?;
        Ok(parse_porcelain(&status))
    }

    pub async fn current_branch(&self, path: &Path) -> Result<String, GitError> {
        self.cli
            .run(path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
    }

    /// Checks out the base branch, pulls best-effort, and creates the job
    /// branch. A non-repository path is a no-op returning empty names.
    pub async fn create_job_branch(
        &self,
        path: &Path,
        request: &BranchRequest<'_>,
    ) -> Result<(String, String), GitError> {
        if !self.is_repo(path).await {
            tracing::warn!("{} is not a git repository, skipping branch", path.display());
            return Ok((String::new(), String::new()));
        }

        let original_branch = self.current_branch(path).await?;
        self.cli
            .run(path, &["checkout", &self.config.base_branch])
            .await
            .map_err(|e| GitError::BranchCreation(e.to_string()))?;

        if let Err(err) = self.cli.run(path, &["pull", "--ff-only"]).await {
            tracing::warn!(
                "Pull of {} failed, continuing from local state: {}",
                self.config.base_branch,
                err
            );
        }

        let branch_name = self.branch_name(request);
        self.cli
            .run(path, &["checkout", "-b", &branch_name])
            .await
            .map_err(|e| GitError::BranchCreation(e.to_string()))?;

        tracing::info!("Created branch {} for job {}", branch_name, request.job_id);
        Ok((branch_name, original_branch))
    }

    /// Stages and commits everything. Returns an empty sha when the tree is
    /// clean.
    pub async fn commit_changes(
        &self,
        path: &Path,
        request: &CommitRequest<'_>,
    ) -> Result<String, GitError> {
        if !self.has_changes(path).await? {
            return Ok(String::new());
        }

        let files = self.changed_files(path).await?;
        self.cli
            .run(path, &["add", "."])
            .await
            .map_err(|e| GitError::Commit(e.to_string()))?;

        let message = compose_commit_message(request.message, request.job_id, files.len());
        self.cli
            .run(path, &["commit", "-m", &message])
            .await
            .map_err(|e| GitError::Commit(e.to_string()))?;

        self.cli
            .run(path, &["rev-parse", "HEAD"])
            .await
            .map_err(|e| GitError::Commit(e.to_string()))
    }

    /// No-op returning false in dry-run mode.
    pub async fn push_branch(&self, path: &Path, branch_name: &str) -> Result<bool, GitError> {
        if self.config.dry_run {
            tracing::info!("Dry run: skipping push of {}", branch_name);
            return Ok(false);
        }
        self.cli
            .run(path, &["push", "-u", "origin", branch_name])
            .await
            .map_err(|e| GitError::Push(e.to_string()))?;
        Ok(true)
    }

    /// Opens a pull request through the GitHub API. Dry-run returns the
    /// synthetic `dry-run-{branch}` url without touching the network.
    pub async fn create_pull_request(
        &self,
        path: &Path,
        request: &PrRequest<'_>,
    ) -> Result<Option<String>, GitError> {
        if self.config.dry_run {
            return Ok(Some(format!("dry-run-{}", request.branch_name)));
        }

        let token = self
            .config
            .github_token
            .as_ref()
            .ok_or_else(|| GitError::PullRequest("no GitHub token configured".to_string()))?;

        let remote = self.cli.run(path, &["remote", "get-url", "origin"]).await?;
        let (owner, repo) = parse_github_slug(&remote)
            .ok_or_else(|| GitError::PullRequest(format!("unrecognized remote: {remote}")))?;

        let url = format!("{}/repos/{owner}/{repo}/pulls", self.config.github_api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header("User-Agent", "alephauto-backend")
            .json(&json!({
                "title": request.title,
                "head": request.branch_name,
                "base": self.config.base_branch,
                "body": request.body,
            }))
            .send()
            .await
            .map_err(|e| GitError::PullRequest(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GitError::PullRequest(format!("{status}: {body}")));
        }

        let created: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GitError::PullRequest(e.to_string()))?;
        let pr_url = created
            .get("html_url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        if !request.labels.is_empty() {
            if let Some(number) = created.get("number").and_then(|v| v.as_u64()) {
                let labels_url = format!(
                    "{}/repos/{owner}/{repo}/issues/{number}/labels",
                    self.config.github_api_base
                );
                let result = self
                    .http
                    .post(&labels_url)
                    .bearer_auth(token)
                    .header("User-Agent", "alephauto-backend")
                    .json(&json!({ "labels": request.labels }))
                    .send()
                    .await;
                if let Err(err) = result {
                    tracing::warn!("Failed to apply PR labels: {}", err);
                }
            }
        }

        Ok(pr_url)
    }

    /// Best-effort restore of the original branch and deletion of the job
    /// branch. Never fails.
    pub async fn cleanup_branch(&self, path: &Path, branch_name: &str, original_branch: &str) {
        let target = if original_branch.is_empty() {
            &self.config.base_branch
        } else {
            original_branch
        };
        if !self.cli.run_ok(path, &["checkout", target]).await {
            tracing::warn!("Cleanup could not check out {}", target);
            return;
        }
        if !branch_name.is_empty() && !self.cli.run_ok(path, &["branch", "-D", branch_name]).await
        {
            tracing::warn!("Cleanup could not delete branch {}", branch_name);
        }
    }

    /// Full pass over a repository with pending changes: branch, commit,
    /// push, PR, cleanup. Branch and commit failures propagate; push and PR
    /// failures are captured in the outcome.
    pub async fn publish_changes(
        &self,
        path: &Path,
        branch: &BranchRequest<'_>,
        commit_message: &str,
        pr_title: &str,
        pr_body: &str,
        labels: &[String],
    ) -> Result<WorkflowOutcome, GitError> {
        let changed_files = self.changed_files(path).await.unwrap_or_default();
        let (branch_name, original_branch) = self.create_job_branch(path, branch).await?;
        if branch_name.is_empty() {
            return Ok(WorkflowOutcome::default());
        }

        let mut outcome = WorkflowOutcome {
            context: BranchContext {
                repository_path: path.display().to_string(),
                original_branch: original_branch.clone(),
                branch_name: branch_name.clone(),
                has_changes: !changed_files.is_empty(),
                changed_files,
                commit_sha: None,
                pr_url: None,
            },
            ..WorkflowOutcome::default()
        };

        let commit = self
            .commit_changes(
                path,
                &CommitRequest {
                    message: commit_message,
                    job_id: branch.job_id,
                },
            )
            .await;
        match commit {
            Ok(sha) if sha.is_empty() => {
                // Nothing to commit after all; restore and bail out.
                self.cleanup_branch(path, &branch_name, &original_branch).await;
                return Ok(outcome);
            }
            Ok(sha) => outcome.context.commit_sha = Some(sha),
            Err(err) => {
                self.cleanup_branch(path, &branch_name, &original_branch).await;
                return Err(err);
            }
        }

        match self.push_branch(path, &branch_name).await {
            Ok(pushed) => outcome.pushed = pushed,
            Err(err) => {
                tracing::warn!("Push failed for {}: {}", branch_name, err);
                outcome.push_error = Some(err.to_string());
            }
        }

        if outcome.pushed || self.config.dry_run {
            let pr = self
                .create_pull_request(
                    path,
                    &PrRequest {
                        branch_name: &branch_name,
                        title: pr_title,
                        body: pr_body,
                        labels,
                    },
                )
                .await;
            match pr {
                Ok(url) => outcome.context.pr_url = url,
                Err(err) => {
                    tracing::warn!("PR creation failed for {}: {}", branch_name, err);
                    outcome.pr_error = Some(err.to_string());
                }
            }
        }

        self.cleanup_branch(path, &branch_name, &original_branch).await;
        Ok(outcome)
    }

    fn branch_name(&self, request: &BranchRequest<'_>) -> String {
        build_branch_name(&self.config.branch_prefix, request)
    }
}

/// `{prefix}/{type-slug}[-description-slug]-{epoch-millis}`.
fn build_branch_name(prefix: &str, request: &BranchRequest<'_>) -> String {
    let mut name = format!("{}/{}", prefix, slug(request.job_type));
    if let Some(description) = request.description {
        let desc = slug(description);
        if !desc.is_empty() {
            let truncated: String = desc.chars().take(DESCRIPTION_SLUG_MAX).collect();
            name.push('-');
            name.push_str(truncated.trim_end_matches('-'));
        }
    }
    name.push('-');
    name.push_str(&Utc::now().timestamp_millis().to_string());
    name
}

/// Lowercased, alphanumerics kept, everything else collapsed to `-`.
fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = true;
    for ch in raw.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

fn compose_commit_message(message: &str, job_id: &str, file_count: usize) -> String {
    format!(
        "{message}\n\nJob: {job_id}\nFiles changed: {file_count}\n\n{COMMIT_ATTRIBUTION}"
    )
}

/// Parses `git status --porcelain` output into relative paths. Renames
/// (`R  old -> new`) report the new path.
fn parse_porcelain(status: &str) -> Vec<String> {
    status
        .lines()
        .filter_map(|line| {
            if line.len() < 4 {
                return None;
            }
            let path = line[3..].trim();
            let path = match path.split_once(" -> ") {
                Some((_, renamed)) => renamed,
                None => path,
            };
            let path = path.trim_matches('"');
            if path.is_empty() {
                None
            } else {
                Some(path.to_string())
            }
        })
        .collect()
}

/// Extracts `owner/repo` from ssh and https GitHub remotes.
fn parse_github_slug(remote: &str) -> Option<(String, String)> {
    let remote = remote.trim().trim_end_matches(".git");
    let rest = if let Some(rest) = remote.strip_prefix("git@github.com:") {
        rest
    } else if let Some(rest) = remote.strip_prefix("ssh://git@github.com/") {
        rest
    } else if let Some(rest) = remote.strip_prefix("https://github.com/") {
        rest
    } else if let Some(rest) = remote.strip_prefix("http://github.com/") {
        rest
    } else {
        return None;
    };
    let (owner, repo) = rest.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}
