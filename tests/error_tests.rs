// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

use std::io;

use codeloop::error::{CodeloopError, EngineError, RegistryError, SessionError};
use codeloop::tools::ValidationError;

#[test]
fn test_io_error_conversion() {
    let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
    let error: CodeloopError = io_error.into();

    match error {
        CodeloopError::Io(_) => {} // Expected
        _ => panic!("Expected Io error, got different error type"),
    }
}

#[test]
fn test_json_error_conversion() {
    let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let error: CodeloopError = json_error.into();
    assert!(matches!(error, CodeloopError::Json(_)));
}

#[test]
fn test_config_error_display() {
    let error = CodeloopError::Config("guard.min_pattern_len must be at least 1".to_string());
    assert_eq!(
        error.to_string(),
        "Configuration error: guard.min_pattern_len must be at least 1"
    );
}

#[test]
fn test_tool_execution_error() {
    let error = CodeloopError::ToolExecution("Command failed".to_string());
    assert_eq!(error.to_string(), "Tool execution failed: Command failed");
}

#[test]
fn test_engine_errors() {
    assert_eq!(
        EngineError::StartupTimeout(500).to_string(),
        "Engine did not become ready within 500 ms"
    );
    assert_eq!(
        EngineError::ModelLoad("Model path does not exist".to_string()).to_string(),
        "Model load failed: Model path does not exist"
    );

    let error: CodeloopError = EngineError::Busy.into();
    assert!(matches!(error, CodeloopError::Engine(EngineError::Busy)));
}

#[test]
fn test_registry_error_conversion() {
    let error: CodeloopError = RegistryError::DuplicateName("shell".to_string()).into();
    assert_eq!(error.to_string(), "Registry error: Tool already registered: shell");
}

#[test]
fn test_validation_error_messages() {
    assert_eq!(
        ValidationError::UnknownTool("make_coffee".to_string()).to_string(),
        "Unknown tool: make_coffee"
    );
    assert_eq!(
        ValidationError::MissingParameter("pattern".to_string()).to_string(),
        "Missing required parameter: pattern"
    );
}

#[test]
fn test_session_error_conversion() {
    let error: CodeloopError = SessionError::AlreadyStreaming.into();
    assert!(matches!(
        error,
        CodeloopError::Session(SessionError::AlreadyStreaming)
    ));
}

#[test]
fn test_invalid_input_error() {
    let error = CodeloopError::InvalidInput("Empty prompt".to_string());
    assert_eq!(error.to_string(), "Invalid input: Empty prompt");
}
