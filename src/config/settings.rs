// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Settings management for codeloop
//!
//! Handles loading and saving settings from ~/.codeloop/settings.json

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod io;
mod validation;

/// Main settings structure, stored in ~/.codeloop/settings.json
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// Repetition and length guard
    #[serde(default)]
    pub guard: GuardConfig,

    /// Tool dispatch settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Context assembly and memory settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Generation session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Inference bridge process settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Code retrieval settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

/// Limits enforced on every streamed token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardConfig {
    /// Hard ceiling on generated characters
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Hard ceiling on generated tokens
    #[serde(default = "default_guard_max_tokens")]
    pub max_tokens: usize,

    /// Shortest repeated pattern considered a loop
    #[serde(default = "default_min_pattern_len")]
    pub min_pattern_len: usize,

    /// Longest repeated pattern considered a loop
    #[serde(default = "default_max_pattern_len")]
    pub max_pattern_len: usize,

    /// Consecutive repetitions that stop generation
    #[serde(default = "default_repetition_threshold")]
    pub repetition_threshold: usize,

    /// Trailing characters inspected per check
    #[serde(default = "default_window_chars")]
    pub window_chars: usize,

    /// Number of trailing sentences checked for degeneration
    #[serde(default = "default_sentence_window")]
    pub sentence_window: usize,

    /// Fraction of the buffer kept after a stop
    #[serde(default = "default_retain_fraction")]
    pub retain_fraction: f64,
}

/// Tool dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    /// Per-call timeout in milliseconds
    #[serde(default = "default_tool_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Time a cancelled adapter gets before it is aborted
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Working directory handed to tools (defaults to the process cwd)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
}

/// Context assembly and memory configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextConfig {
    /// Token budget for the assembled context
    #[serde(default = "default_budget_tokens")]
    pub budget_tokens: usize,

    /// Most recent tool results given priority in the context
    #[serde(default = "default_tool_result_cap")]
    pub tool_result_cap: usize,

    /// Maximum memory entries before eviction kicks in
    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,

    /// SQLite file for long-term memory (None = in-memory only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_db: Option<PathBuf>,
}

/// Generation session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Re-enter generation after tool results are folded into memory
    #[serde(default = "default_true")]
    pub auto_continue: bool,

    /// Maximum automatic continuations per user prompt
    #[serde(default = "default_max_continuation_depth")]
    pub max_continuation_depth: usize,

    /// Stop sequences sent to the engine
    #[serde(default)]
    pub stop_sequences: Vec<String>,

    /// `max_tokens` sent to the engine
    #[serde(default = "default_max_generation_tokens")]
    pub max_generation_tokens: u32,
}

/// Inference bridge process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Executable used to launch the bridge
    #[serde(default = "default_engine_command")]
    pub command: String,

    /// Arguments passed to the bridge executable
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,

    /// Model directory loaded after the bridge reports ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,

    /// Time allowed for the bridge to print its ready line
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling parameter
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Penalty for repeating tokens; 1.0 disables it
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
}

/// Code retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    /// Index the working directory and add matching code to the context
    #[serde(default)]
    pub enabled: bool,

    /// File extensions to index, without the dot (empty = all text files)
    #[serde(default = "default_retrieval_extensions")]
    pub extensions: Vec<String>,

    /// Directory or file names never indexed
    #[serde(default = "default_retrieval_exclude")]
    pub exclude: Vec<String>,

    /// Maximum characters per indexed chunk
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,

    /// Chunks retrieved per prompt
    #[serde(default = "default_retrieval_results")]
    pub max_results: usize,

    /// Character cap on all retrieved chunks together
    #[serde(default = "default_retrieval_context_chars")]
    pub max_context_chars: usize,

    /// Files larger than this are skipped
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            max_tokens: default_guard_max_tokens(),
            min_pattern_len: default_min_pattern_len(),
            max_pattern_len: default_max_pattern_len(),
            repetition_threshold: default_repetition_threshold(),
            window_chars: default_window_chars(),
            sentence_window: default_sentence_window(),
            retain_fraction: default_retain_fraction(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_tool_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            working_directory: None,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: default_budget_tokens(),
            tool_result_cap: default_tool_result_cap(),
            max_memory_entries: default_max_memory_entries(),
            memory_db: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_continue: true,
            max_continuation_depth: default_max_continuation_depth(),
            stop_sequences: Vec::new(),
            max_generation_tokens: default_max_generation_tokens(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            extensions: default_retrieval_extensions(),
            exclude: default_retrieval_exclude(),
            chunk_chars: default_chunk_chars(),
            max_results: default_retrieval_results(),
            max_context_chars: default_retrieval_context_chars(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: default_engine_args(),
            model_path: None,
            startup_timeout_ms: default_startup_timeout_ms(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            repetition_penalty: default_repetition_penalty(),
        }
    }
}

fn default_max_chars() -> usize {
    8_000
}

fn default_guard_max_tokens() -> usize {
    2_000
}

fn default_min_pattern_len() -> usize {
    15
}

fn default_max_pattern_len() -> usize {
    300
}

fn default_repetition_threshold() -> usize {
    3
}

fn default_window_chars() -> usize {
    2_000
}

fn default_sentence_window() -> usize {
    5
}

fn default_retain_fraction() -> f64 {
    0.8
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

fn default_budget_tokens() -> usize {
    4_096
}

fn default_tool_result_cap() -> usize {
    4
}

fn default_max_memory_entries() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_max_continuation_depth() -> usize {
    1
}

fn default_max_generation_tokens() -> u32 {
    2_000
}

fn default_engine_command() -> String {
    "python3".to_string()
}

fn default_engine_args() -> Vec<String> {
    vec![
        "mlx_inference.py".to_string(),
        "--mode".to_string(),
        "interactive".to_string(),
    ]
}

fn default_startup_timeout_ms() -> u64 {
    120_000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_repetition_penalty() -> f32 {
    1.0
}

fn default_retrieval_extensions() -> Vec<String> {
    ["rs", "py", "js", "ts", "go", "swift", "m", "h", "json", "toml", "md"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

fn default_retrieval_exclude() -> Vec<String> {
    [
        "target",
        "build",
        "Build",
        "DerivedData",
        "dist",
        "node_modules",
        "__pycache__",
        "vendor",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}

fn default_chunk_chars() -> usize {
    1_000
}

fn default_retrieval_results() -> usize {
    3
}

fn default_retrieval_context_chars() -> usize {
    4_000
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}
