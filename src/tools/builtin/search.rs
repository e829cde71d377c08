// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Search tool
//!
//! Regex search over file contents. Read-only, so any number of searches
//! may run side by side.

use async_trait::async_trait;
use regex::RegexBuilder;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::{CodeloopError, Result};
use crate::tools::{SchemaBuilder, Tool, ToolContext, ToolDefinition, ToolOutput, ValidatedArgs};

/// Tool for searching file contents
pub struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "search",
            "Search files for a regex. Returns matching lines with paths and line numbers.",
        )
        .with_parameters(
            SchemaBuilder::new()
                .string("pattern", "Regex pattern to search for", true)
                .string("path", "File or directory to search", false)
                .default_value(".")
                .boolean("ignore_case", "Case-insensitive match", false)
                .default_value("false")
                .integer("limit", "Maximum number of matches", false)
                .default_value("50")
                .build(),
        )
    }

    async fn execute(
        &self,
        args: &ValidatedArgs,
        context: &ToolContext,
        cancel: CancellationToken,
    ) -> Result<ToolOutput> {
        let pattern = args
            .str("pattern")
            .ok_or_else(|| CodeloopError::InvalidInput("pattern is required".to_string()))?;
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(args.bool("ignore_case").unwrap_or(false))
            .build()
            .map_err(|e| CodeloopError::ToolExecution(format!("Invalid regex pattern: {}", e)))?;
        let limit = args.int("limit").unwrap_or(50).max(1) as usize;
        let root = context.resolve_path(args.str("path").unwrap_or("."));

        if !root.exists() {
            return Err(CodeloopError::ToolExecution(format!(
                "Path not found: {}",
                root.display()
            )));
        }

        // The walk is blocking; it checks the token between files.
        let walk_cancel = cancel.clone();
        let walk_root = root.clone();
        let found = tokio::task::spawn_blocking(move || scan(&walk_root, &regex, limit, &walk_cancel))
            .await
            .map_err(|e| CodeloopError::ToolExecution(format!("search task failed: {}", e)))?;

        if cancel.is_cancelled() {
            return Err(CodeloopError::ToolExecution("search cancelled".to_string()));
        }

        let base = if root.is_file() {
            root.parent().map(Path::to_path_buf).unwrap_or_default()
        } else {
            root.clone()
        };

        let mut output = format!(
            "Found {} matches in {} files (searched {} files):\n",
            found.matches.len(),
            found.files_with_matches,
            found.files_searched
        );
        let mut current_file: Option<PathBuf> = None;
        for m in &found.matches {
            if current_file.as_ref() != Some(&m.path) {
                let display = m.path.strip_prefix(&base).unwrap_or(&m.path);
                output.push_str(&format!("\n{}:\n", display.display()));
                current_file = Some(m.path.clone());
            }
            output.push_str(&format!("  {:>5}: {}\n", m.line_number, m.line.trim()));
        }
        if found.matches.len() >= limit {
            output.push_str(&format!("\n(limited to {} matches)\n", limit));
        }

        Ok(ToolOutput::text(output)
            .with_metadata("matches", found.matches.len())
            .with_metadata("files_searched", found.files_searched))
    }
}

#[derive(Debug)]
struct SearchMatch {
    path: PathBuf,
    line_number: usize,
    line: String,
}

#[derive(Debug, Default)]
struct Scan {
    matches: Vec<SearchMatch>,
    files_searched: usize,
    files_with_matches: usize,
}

fn scan(root: &Path, regex: &regex::Regex, limit: usize, cancel: &CancellationToken) -> Scan {
    let mut scan = Scan::default();

    let entries = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden_or_ignored(entry.path(), root))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file());

    for entry in entries {
        if cancel.is_cancelled() || scan.matches.len() >= limit {
            break;
        }
        let path = entry.path();
        if is_likely_binary(path) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        scan.files_searched += 1;

        let before = scan.matches.len();
        for (i, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                scan.matches.push(SearchMatch {
                    path: path.to_path_buf(),
                    line_number: i + 1,
                    line: line.to_string(),
                });
                if scan.matches.len() >= limit {
                    break;
                }
            }
        }
        if scan.matches.len() > before {
            scan.files_with_matches += 1;
        }
    }

    scan
}

fn is_likely_binary(path: &Path) -> bool {
    let Some(ext) = path.extension() else {
        return false;
    };
    matches!(
        ext.to_string_lossy().to_lowercase().as_str(),
        "png" | "jpg" | "jpeg" | "gif" | "ico" | "woff" | "woff2" | "ttf" | "zip" | "tar"
            | "gz" | "7z" | "exe" | "dll" | "so" | "dylib" | "pdf" | "mp3" | "mp4" | "wav"
            | "o" | "a" | "pyc" | "class" | "db" | "sqlite" | "safetensors" | "gguf"
    )
}

/// Hidden and build directories below the search root are skipped.
fn is_hidden_or_ignored(path: &Path, root: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| match component {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            name.starts_with('.')
                || matches!(
                    name.as_ref(),
                    "node_modules" | "target" | "__pycache__" | "venv" | "dist" | "build" | "vendor"
                )
        }
        _ => false,
    })
}
