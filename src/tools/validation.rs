// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Argument validation against a tool definition

use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

use super::call::ToolCall;
use super::definition::{ParamType, ToolDefinition};

/// A typed argument value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Float(v) => Some(*v),
            ArgValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArgValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgValue::Bool(v) => write!(f, "{}", v),
            ArgValue::Int(v) => write!(f, "{}", v),
            ArgValue::Float(v) => write!(f, "{}", v),
            ArgValue::String(v) => f.write_str(v),
        }
    }
}

/// Why a call was rejected before dispatch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Malformed tool call: {0}")]
    Malformed(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Parameter '{parameter}' expects {expected}, got {value:?}")]
    InvalidType {
        parameter: String,
        expected: ParamType,
        value: String,
    },
}

/// Arguments converted to their declared types, in definition order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidatedArgs {
    values: Vec<(String, ArgValue)>,
}

impl ValidatedArgs {
    pub fn new(values: Vec<(String, ArgValue)>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ArgValue::as_str)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ArgValue::as_i64)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ArgValue::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(ArgValue::as_bool)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A call that passed validation and can be dispatched
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: ValidatedArgs,
    /// Unknown parameters that were ignored
    pub warnings: Vec<String>,
    pub source_span: Range<usize>,
}

/// Check a parsed call against its definition.
///
/// Missing required parameters are reported before type errors so the
/// caller always learns about absent arguments first. Unknown parameters
/// only produce warnings.
pub fn validate(call: &ToolCall, definition: &ToolDefinition) -> Result<ValidatedCall, ValidationError> {
    if call.tool_name != definition.name {
        return Err(ValidationError::UnknownTool(call.tool_name.clone()));
    }

    if let Some(missing) = definition
        .parameters
        .iter()
        .find(|p| p.required && call.argument(&p.name).is_none())
    {
        return Err(ValidationError::MissingParameter(missing.name.clone()));
    }

    let mut values = Vec::with_capacity(definition.parameters.len());
    for param in &definition.parameters {
        let literal = match call.argument(&param.name) {
            Some(literal) => literal,
            None => match &param.default {
                Some(default) => default.as_str(),
                None => continue,
            },
        };
        let value = param
            .param_type
            .parse(literal)
            .ok_or_else(|| ValidationError::InvalidType {
                parameter: param.name.clone(),
                expected: param.param_type,
                value: literal.to_string(),
            })?;
        values.push((param.name.clone(), value));
    }

    let warnings: Vec<String> = call
        .raw_arguments
        .iter()
        .filter(|(key, _)| definition.parameter(key).is_none())
        .map(|(key, _)| format!("ignored unknown parameter '{}'", key))
        .collect();

    if !warnings.is_empty() {
        tracing::debug!(
            target: "codeloop.tools",
            tool = %call.tool_name,
            call_id = %call.id,
            warnings = ?warnings,
            "validated call with unknown parameters"
        );
    }

    Ok(ValidatedCall {
        call_id: call.id.clone(),
        tool_name: call.tool_name.clone(),
        arguments: ValidatedArgs::new(values),
        warnings,
        source_span: call.source_span.clone(),
    })
}
