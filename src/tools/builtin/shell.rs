// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Shell command tool
//!
//! Runs `sh -c <command>` in the working directory. The child is killed as
//! soon as the call is cancelled or times out.

use async_trait::async_trait;
use std::collections::HashSet;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{CodeloopError, Result};
use crate::tools::{SchemaBuilder, Tool, ToolContext, ToolDefinition, ToolOutput, ValidatedArgs};

use super::WORKSPACE_KIND;

const MAX_STDOUT_BYTES: usize = 30_000;
const MAX_STDERR_BYTES: usize = 10_000;

/// Tool for executing shell commands
pub struct ShellTool {
    /// Patterns that are always blocked
    blocked_patterns: HashSet<String>,
}

impl ShellTool {
    pub fn new() -> Self {
        let blocked_patterns = [
            "rm -rf /",
            "rm -rf /*",
            "mkfs",
            ":(){:|:&};:",
            "> /dev/sda",
            "dd if=/dev/zero of=/dev",
            "sudo ",
            "shutdown",
            "reboot",
            "poweroff",
            "init 0",
            "init 6",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        Self { blocked_patterns }
    }

    fn is_blocked(&self, command: &str) -> bool {
        let lower = command.to_lowercase();
        self.blocked_patterns.iter().any(|p| lower.contains(p))
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "shell",
            "Run a shell command in the working directory. Returns the exit code, stdout and stderr.",
        )
        .with_parameters(
            SchemaBuilder::new()
                .string("command", "Command line passed to sh -c", true)
                .build(),
        )
        .exclusive(WORKSPACE_KIND)
    }

    async fn execute(
        &self,
        args: &ValidatedArgs,
        context: &ToolContext,
        cancel: CancellationToken,
    ) -> Result<ToolOutput> {
        let command = args
            .str("command")
            .ok_or_else(|| CodeloopError::InvalidInput("command is required".to_string()))?;

        if self.is_blocked(command) {
            return Err(CodeloopError::ToolExecution(
                "This command has been blocked for safety reasons.".to_string(),
            ));
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&context.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CodeloopError::ToolExecution(format!("Failed to spawn command: {}", e)))?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let run = async {
            let (out, err) = tokio::join!(read_all(stdout.as_mut()), read_all(stderr.as_mut()));
            let status = child.wait().await;
            (out, err, status)
        };

        let (stdout_output, stderr_output, status) = tokio::select! {
            finished = run => finished,
            _ = cancel.cancelled() => {
                tracing::debug!(target: "codeloop.tools", command, "killing cancelled shell command");
                // kill_on_drop reaps the child when `child` goes out of scope.
                return Err(CodeloopError::ToolExecution("command cancelled".to_string()));
            }
        };

        let status = status
            .map_err(|e| CodeloopError::ToolExecution(format!("Failed to wait for command: {}", e)))?;
        let exit_code = status.code().unwrap_or(-1);

        let mut text = format!("Exit code: {}\n", exit_code);
        if !stdout_output.is_empty() {
            text.push_str("\n--- stdout ---\n");
            text.push_str(&clip(&stdout_output, MAX_STDOUT_BYTES));
        }
        if !stderr_output.is_empty() {
            text.push_str("\n--- stderr ---\n");
            text.push_str(&clip(&stderr_output, MAX_STDERR_BYTES));
        }

        Ok(ToolOutput::text(text).with_metadata("exit_code", exit_code))
    }
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(reader: Option<&mut R>) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let mut bytes = Vec::new();
    let _ = reader.read_to_end(&mut bytes).await;
    String::from_utf8_lossy(&bytes).into_owned()
}

fn clip(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... (output truncated)", &text[..cut])
}
