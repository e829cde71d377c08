// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! File write tool
//!
//! Creates or overwrites files in the working directory. Writes share the
//! `workspace` kind with the shell tool so they never interleave.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{CodeloopError, Result};
use crate::tools::{SchemaBuilder, Tool, ToolContext, ToolDefinition, ToolOutput, ValidatedArgs};

use super::WORKSPACE_KIND;

/// Tool for writing file contents
pub struct FileWriteTool;

#[async_trait]
impl Tool for FileWriteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "file_write",
            "Write content to a file, creating parent directories. Refuses to replace an existing file unless overwrite=true.",
        )
        .with_parameters(
            SchemaBuilder::new()
                .string("path", "Where the file should be written", true)
                .string("content", "Full file content", true)
                .boolean("overwrite", "Replace the file if it already exists", false)
                .default_value("false")
                .build(),
        )
        .exclusive(WORKSPACE_KIND)
    }

    async fn execute(
        &self,
        args: &ValidatedArgs,
        context: &ToolContext,
        _cancel: CancellationToken,
    ) -> Result<ToolOutput> {
        let path_str = args
            .str("path")
            .ok_or_else(|| CodeloopError::InvalidInput("path is required".to_string()))?;
        let content = args
            .str("content")
            .ok_or_else(|| CodeloopError::InvalidInput("content is required".to_string()))?;
        let overwrite = args.bool("overwrite").unwrap_or(false);

        let path = context.resolve_path(path_str);
        let existed = path.exists();
        if existed && !overwrite {
            return Err(CodeloopError::ToolExecution(format!(
                "File already exists: {}. Pass overwrite=true to replace it.",
                path.display()
            )));
        }
        if path.is_dir() {
            return Err(CodeloopError::ToolExecution(format!(
                "Path is a directory: {}",
                path.display()
            )));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CodeloopError::ToolExecution(format!("Failed to create parent directories: {}", e))
            })?;
        }

        tokio::fs::write(&path, content)
            .await
            .map_err(|e| CodeloopError::ToolExecution(format!("Failed to write file: {}", e)))?;

        let verb = if existed { "Overwrote" } else { "Created" };
        Ok(ToolOutput::text(format!(
            "{} {} ({} lines, {} bytes)",
            verb,
            path.display(),
            content.lines().count(),
            content.len()
        ))
        .with_metadata("path", path.display().to_string())
        .with_metadata("bytes", content.len()))
    }
}
