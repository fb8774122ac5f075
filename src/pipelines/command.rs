//! Subprocess job handler.
//!
//! The contract for pipeline executables that live outside this process
//! (the duplicate-detection scanner, report generators, and similar): run
//! a configured argv, capture output, and map the exit status onto the
//! handler result. The job payload is passed on stdin as JSON.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::jobs::{HandlerError, JobContext, JobHandler};

const OUTPUT_TAIL_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct CommandJobHandler {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandJobHandler {
    pub fn new(command: &[String]) -> Result<Self, HandlerError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| HandlerError::with_code("empty command", "invalid-argument"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: None,
        })
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

#[async_trait]
impl JobHandler for CommandJobHandler {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(HandlerError::from)?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&ctx.job().data)
                .map_err(|e| HandlerError::new(e.to_string()))?;
            let _ = stdin.write_all(&payload).await;
        }

        // kill_on_drop reaps the child if cancellation wins the race.
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(HandlerError::from)?,
            _ = ctx.cancelled() => {
                return Err(HandlerError::with_code(
                    format!("{} cancelled", self.program),
                    "timed-out",
                ));
            }
        };

        let stdout = tail(&output.stdout);
        let stderr = tail(&output.stderr);

        if output.status.success() {
            // Structured output when the tool prints JSON, raw text otherwise.
            let parsed: Option<Value> = serde_json::from_str(stdout.trim()).ok();
            Ok(json!({
                "exitCode": 0,
                "output": parsed.unwrap_or(Value::String(stdout)),
            }))
        } else {
            let code = output.status.code().unwrap_or(-1);
            Err(HandlerError::with_code(
                format!("{} exited with {code}: {stderr}", self.program),
                "command-failed",
            ))
        }
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= OUTPUT_TAIL_BYTES {
        return text.into_owned();
    }
    let start = text.len() - OUTPUT_TAIL_BYTES;
    let start = text
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= start)
        .unwrap_or(0);
    text[start..].to_string()
}
