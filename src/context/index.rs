// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Lexical code index
//!
//! Files under a root are split into line-aligned chunks. A query is scored
//! against every chunk with TF-IDF over identifier terms, and the best
//! chunks become the retrieval tier of context assembly.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::RetrievalConfig;
use crate::error::{CodeloopError, Result};

/// One indexed piece of a file
#[derive(Debug, Clone, PartialEq)]
pub struct CodeChunk {
    /// Path relative to the index root
    pub path: PathBuf,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
    term_counts: HashMap<String, u32>,
}

/// A chunk matched by a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedSnippet {
    pub path: PathBuf,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
    pub score: f64,
}

impl RetrievedSnippet {
    /// Text laid into the context window
    pub fn render(&self) -> String {
        format!(
            "[code:{} {}/{}]\n```\n{}\n```\n",
            self.path.display(),
            self.chunk_index + 1,
            self.total_chunks,
            self.text
        )
    }
}

/// Counters from one indexing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub errors: usize,
    pub chunks: usize,
}

/// In-memory chunk index over one directory tree
pub struct CodeIndex {
    root: PathBuf,
    config: RetrievalConfig,
    chunks: Vec<CodeChunk>,
    /// Number of chunks each term occurs in
    document_frequency: HashMap<String, usize>,
}

impl CodeIndex {
    pub fn new(root: impl Into<PathBuf>, config: RetrievalConfig) -> Self {
        Self {
            root: root.into(),
            config,
            chunks: Vec::new(),
            document_frequency: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Number of indexed chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn unique_files(&self) -> usize {
        self.chunks
            .iter()
            .map(|c| c.path.as_path())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn chunks(&self) -> &[CodeChunk] {
        &self.chunks
    }

    /// Whether a path relative to the root passes the name and extension filters.
    pub fn should_index(&self, relative: &Path) -> bool {
        let excluded = relative.components().any(|component| {
            let name = component.as_os_str().to_string_lossy();
            self.is_excluded_name(&name)
        });
        if excluded {
            return false;
        }

        if self.config.extensions.is_empty() {
            return true;
        }
        let Some(ext) = relative.extension() else {
            return false;
        };
        let ext = ext.to_string_lossy().to_lowercase();
        self.config
            .extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').to_lowercase() == ext)
    }

    fn is_excluded_name(&self, name: &str) -> bool {
        (name.starts_with('.') && name != "." && name != "..")
            || self.config.exclude.iter().any(|pattern| pattern == name)
    }

    /// Walk the root and index every eligible file. Blocking.
    pub fn index_directory(&mut self) -> Result<IndexStats> {
        if !self.root.is_dir() {
            return Err(CodeloopError::Context(format!(
                "Directory does not exist: {}",
                self.root.display()
            )));
        }

        let mut stats = IndexStats::default();
        let root = self.root.clone();
        let entries = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !self.is_excluded_name(&entry.file_name().to_string_lossy())
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect::<Vec<_>>();

        for path in entries {
            let relative = path.strip_prefix(&root).unwrap_or(&path);
            if !self.should_index(relative) {
                stats.files_skipped += 1;
                continue;
            }
            match self.index_file(&path) {
                Ok(true) => stats.files_indexed += 1,
                Ok(false) => stats.files_skipped += 1,
                Err(err) => {
                    tracing::warn!(
                        target: "codeloop.context",
                        path = %path.display(),
                        error = %err,
                        "failed to index file"
                    );
                    stats.errors += 1;
                }
            }
        }

        stats.chunks = self.chunks.len();
        tracing::info!(
            target: "codeloop.context",
            root = %self.root.display(),
            files = stats.files_indexed,
            skipped = stats.files_skipped,
            chunks = stats.chunks,
            "indexed directory"
        );
        Ok(stats)
    }

    /// Index one file, replacing any chunks it had.
    ///
    /// Returns `false` for files that are too large, not UTF-8, or blank.
    pub fn index_file(&mut self, path: &Path) -> Result<bool> {
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let relative = full.strip_prefix(&self.root).unwrap_or(&full).to_path_buf();

        if std::fs::metadata(&full)?.len() > self.config.max_file_bytes {
            return Ok(false);
        }
        let content = match std::fs::read_to_string(&full) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if content.trim().is_empty() {
            return Ok(false);
        }

        self.remove_file(&relative);

        let pieces = split_into_chunks(&content, self.config.chunk_chars);
        let total_chunks = pieces.len();
        for (chunk_index, text) in pieces.into_iter().enumerate() {
            let mut term_counts: HashMap<String, u32> = HashMap::new();
            for term in terms(&text) {
                *term_counts.entry(term).or_insert(0) += 1;
            }
            for term in term_counts.keys() {
                *self.document_frequency.entry(term.clone()).or_insert(0) += 1;
            }
            self.chunks.push(CodeChunk {
                path: relative.clone(),
                chunk_index,
                total_chunks,
                text,
                term_counts,
            });
        }
        Ok(true)
    }

    /// Drop every chunk of a file. Returns how many were removed.
    pub fn remove_file(&mut self, relative: &Path) -> usize {
        let before = self.chunks.len();
        let mut kept = Vec::with_capacity(before);
        for chunk in self.chunks.drain(..) {
            if chunk.path != relative {
                kept.push(chunk);
                continue;
            }
            for term in chunk.term_counts.keys() {
                if let Some(count) = self.document_frequency.get_mut(term) {
                    *count -= 1;
                    if *count == 0 {
                        self.document_frequency.remove(term);
                    }
                }
            }
        }
        self.chunks = kept;
        before - self.chunks.len()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.document_frequency.clear();
    }

    /// Best `limit` chunks for `query`, highest score first.
    ///
    /// Chunks sharing no term with the query are never returned.
    pub fn search(&self, query: &str, limit: usize) -> Vec<RetrievedSnippet> {
        let query_terms: HashSet<String> = terms(query).into_iter().collect();
        if query_terms.is_empty() || limit == 0 {
            return Vec::new();
        }

        let total = self.chunks.len() as f64;
        let mut scored: Vec<(f64, &CodeChunk)> = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let score: f64 = query_terms
                    .iter()
                    .filter_map(|term| {
                        let tf = *chunk.term_counts.get(term)? as f64;
                        let df = *self.document_frequency.get(term)? as f64;
                        Some((1.0 + tf.ln()) * (1.0 + total / df).ln())
                    })
                    .sum();
                (score > 0.0).then_some((score, chunk))
            })
            .collect();

        scored.sort_by(|(a_score, a), (b_score, b)| {
            b_score
                .total_cmp(a_score)
                .then_with(|| a.path.cmp(&b.path))
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });

        scored
            .into_iter()
            .take(limit)
            .map(|(score, chunk)| RetrievedSnippet {
                path: chunk.path.clone(),
                chunk_index: chunk.chunk_index,
                total_chunks: chunk.total_chunks,
                text: chunk.text.clone(),
                score,
            })
            .collect()
    }

    /// Snippets for a prompt within the configured count and character caps.
    ///
    /// Stops at the first snippet whose rendering would pass the cap.
    pub fn context_for_query(&self, query: &str) -> Vec<RetrievedSnippet> {
        let mut used = 0usize;
        let mut selected = Vec::new();
        for snippet in self.search(query, self.config.max_results) {
            let size = snippet.render().chars().count();
            if used + size > self.config.max_context_chars {
                break;
            }
            used += size;
            selected.push(snippet);
        }
        selected
    }
}

/// Split text into chunks of at most `max_chunk_chars` characters.
///
/// Lines are kept whole where possible; a line longer than the limit is
/// broken on whitespace. A single word longer than the limit stays intact.
pub fn split_into_chunks(text: &str, max_chunk_chars: usize) -> Vec<String> {
    let max = max_chunk_chars.max(1);
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_size = 0usize;

    for line in text.split('\n') {
        let line_size = line.chars().count();

        if line_size > max {
            if !current.is_empty() {
                chunks.push(current.join("\n"));
                current.clear();
                current_size = 0;
            }
            let mut words: Vec<&str> = Vec::new();
            let mut words_size = 0usize;
            for word in line.split_whitespace() {
                let word_size = word.chars().count();
                if !words.is_empty() && words_size + 1 + word_size > max {
                    chunks.push(words.join(" "));
                    words.clear();
                    words_size = 0;
                }
                words_size += if words.is_empty() { word_size } else { word_size + 1 };
                words.push(word);
            }
            if !words.is_empty() {
                chunks.push(words.join(" "));
            }
        } else if !current.is_empty() && current_size + 1 + line_size > max {
            chunks.push(current.join("\n"));
            current = vec![line];
            current_size = line_size;
        } else {
            current_size += if current.is_empty() { line_size } else { line_size + 1 };
            current.push(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current.join("\n"));
    }

    chunks.retain(|chunk| !chunk.trim().is_empty());
    chunks
}

/// Lowercased identifier terms of `text`.
///
/// Each identifier yields itself and, when compound, its snake_case and
/// camelCase parts: `build_context` gives `build_context`, `build`,
/// `context`. Terms shorter than two characters are dropped.
pub fn terms(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        let word = word.trim_matches('_');
        if word.chars().count() < 2 {
            continue;
        }
        let lower = word.to_lowercase();
        let parts = subwords(word);
        if parts.len() > 1 {
            out.extend(parts.into_iter().filter(|p| p.chars().count() >= 2));
        }
        out.push(lower);
    }
    out
}

fn subwords(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut previous_lower = false;
    for c in word.chars() {
        if c == '_' {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            previous_lower = false;
            continue;
        }
        if c.is_uppercase() && previous_lower && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        previous_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
