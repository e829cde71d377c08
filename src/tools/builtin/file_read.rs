// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! File read tool
//!
//! Reads a window of lines from a file, numbered for the model.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{CodeloopError, Result};
use crate::tools::{SchemaBuilder, Tool, ToolContext, ToolDefinition, ToolOutput, ValidatedArgs};

const MAX_LINE_CHARS: usize = 500;

/// Tool for reading file contents
pub struct FileReadTool;

#[async_trait]
impl Tool for FileReadTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "file_read",
            "Read a file. Returns the requested lines prefixed with line numbers.",
        )
        .with_parameters(
            SchemaBuilder::new()
                .string("path", "File path, absolute or relative to the working directory", true)
                .integer("offset", "First line to read, 1-indexed", false)
                .default_value("1")
                .integer("limit", "Maximum number of lines", false)
                .default_value("2000")
                .build(),
        )
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
        let offset = args.int("offset").unwrap_or(1).max(1) as usize;
        let limit = args.int("limit").unwrap_or(2000).max(0) as usize;

        let path = context.resolve_path(path_str);
        if !path.exists() {
            return Err(CodeloopError::ToolExecution(format!(
                "File not found: {}",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(CodeloopError::ToolExecution(format!(
                "Not a file: {}",
                path.display()
            )));
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CodeloopError::ToolExecution(format!("Failed to read file: {}", e)))?;

        let lines: Vec<&str> = content.lines().collect();
        let start = (offset - 1).min(lines.len());
        let end = start.saturating_add(limit).min(lines.len());

        let mut output = format!(
            "File: {} (lines {}-{} of {})\n",
            path.display(),
            start + 1,
            end,
            lines.len()
        );
        for (i, line) in lines[start..end].iter().enumerate() {
            let display: String = if line.chars().count() > MAX_LINE_CHARS {
                let cut: String = line.chars().take(MAX_LINE_CHARS).collect();
                format!("{}... (truncated)", cut)
            } else {
                line.to_string()
            };
            output.push_str(&format!("{:>6}\t{}\n", start + i + 1, display));
        }

        Ok(ToolOutput::text(output)
            .with_metadata("path", path.display().to_string())
            .with_metadata("total_lines", lines.len()))
    }
}
