//! AST rewrite seam.
//!
//! The actual parse/transform/generate runs in a Node.js codemod
//! subprocess so the transformer gets real TypeScript/JSX coverage; the
//! [`Rewriter`] trait keeps the engine testable without Node.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::steps::MigrationStep;

const CODEMOD_SOURCE: &str = include_str!("../../assets/codemod.cjs");

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("transform failed: {0}")]
    Transform(String),
    #[error("rewriter process failed: {0}")]
    Process(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RewriteOutcome {
    Unchanged,
    Rewritten(String),
}

#[async_trait]
pub trait Rewriter: Send + Sync {
    /// Applies `steps` to `source` in order. Returns the new source only
    /// when at least one step modified the tree.
    async fn rewrite(
        &self,
        file: &Path,
        source: &str,
        steps: &[MigrationStep],
    ) -> Result<RewriteOutcome, RewriteError>;
}

#[derive(Debug, Deserialize)]
struct CodemodReply {
    status: String,
    #[serde(default)]
    changed: bool,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Runs the bundled codemod script under `node`, speaking JSON over
/// stdin/stdout.
pub struct NodeRewriter {
    node: PathBuf,
    script: PathBuf,
}

impl NodeRewriter {
    /// Materializes the bundled script under `script_dir` and resolves the
    /// `node` binary.
    pub fn new(script_dir: &Path) -> Result<Self, RewriteError> {
        let node = which::which("node")
            .map_err(|_| RewriteError::Process("node executable not found".to_string()))?;
        std::fs::create_dir_all(script_dir)
            .map_err(|e| RewriteError::Process(e.to_string()))?;
        let script = script_dir.join("codemod.cjs");
        std::fs::write(&script, CODEMOD_SOURCE)
            .map_err(|e| RewriteError::Process(e.to_string()))?;
        Ok(Self { node, script })
    }
}

#[async_trait]
impl Rewriter for NodeRewriter {
    async fn rewrite(
        &self,
        file: &Path,
        source: &str,
        steps: &[MigrationStep],
    ) -> Result<RewriteOutcome, RewriteError> {
        let request = json!({
            "file": file.to_string_lossy(),
            "source": source,
            "steps": steps,
        });

        let mut child = Command::new(&self.node)
            .arg(&self.script)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| RewriteError::Process(e.to_string()))?;

        let payload =
            serde_json::to_vec(&request).map_err(|e| RewriteError::Process(e.to_string()))?;
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| RewriteError::Process("codemod stdin unavailable".to_string()))?;
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| RewriteError::Process(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RewriteError::Process(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RewriteError::Process(format!(
                "codemod exited with {}: {stderr}",
                output.status
            )));
        }

        let reply: CodemodReply = serde_json::from_slice(&output.stdout)
            .map_err(|e| RewriteError::Process(format!("malformed codemod reply: {e}")))?;

        match reply.status.as_str() {
            "ok" if reply.changed => Ok(RewriteOutcome::Rewritten(
                reply
                    .output
                    .ok_or_else(|| RewriteError::Process("reply missing output".to_string()))?,
            )),
            "ok" => Ok(RewriteOutcome::Unchanged),
            "parse-error" => Err(RewriteError::Parse(
                reply.error.unwrap_or_else(|| "unknown parse error".to_string()),
            )),
            _ => Err(RewriteError::Transform(
                reply.error.unwrap_or_else(|| "unknown transform error".to_string()),
            )),
        }
    }
}
