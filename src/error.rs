// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Error types for codeloop
//!
//! Failures inside the agent loop are scoped: a bad tool call becomes a tool
//! result, an engine failure ends one session. The variants here cover the
//! remaining cases where a caller has to react.

use thiserror::Error;

/// Main error type for codeloop operations
#[derive(Error, Debug)]
pub enum CodeloopError {
    /// Inference engine errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Tool registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Tool call rejected before dispatch
    #[error("Validation error: {0}")]
    Validation(#[from] crate::tools::ValidationError),

    /// Session state machine misuse
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Tool adapter failure (reported as an ExecutionError result)
    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    /// Memory and context errors
    #[error("Context error: {0}")]
    Context(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Errors raised at the inference engine boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine process could not be started
    #[error("Failed to start engine: {0}")]
    Spawn(String),

    /// The engine did not become ready in time
    #[error("Engine did not become ready within {0} ms")]
    StartupTimeout(u64),

    /// The engine could not load the requested model
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// The engine emitted something outside the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The engine reported a generation failure
    #[error("Generation failed: {0}")]
    Generation(String),

    /// The engine process exited
    #[error("Engine process exited unexpectedly")]
    ProcessExited,

    /// Another generation holds the engine
    #[error("Engine is busy with another generation")]
    Busy,
}

/// Errors raised when building the tool registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A tool with the same name is already registered
    #[error("Tool already registered: {0}")]
    DuplicateName(String),

    /// The tool definition itself is unusable
    #[error("Invalid tool definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },
}

/// Errors raised by the generation session state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// `start()` was called while a generation is streaming
    #[error("A generation is already streaming for this conversation")]
    AlreadyStreaming,

    /// An operation that needs an active stream was called without one
    #[error("No generation is streaming")]
    NotStreaming,

    /// A transition the state machine does not allow
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

/// Result type alias for codeloop operations
pub type Result<T> = std::result::Result<T, CodeloopError>;
