// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Tool definition types
//!
//! A definition names a tool, describes it for the model, and lists its
//! parameters in the order they are documented.

use serde::{Deserialize, Serialize};

use super::call::is_identifier;
use super::validation::ArgValue;
use crate::error::RegistryError;

/// Scalar type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Bool => "bool",
        }
    }

    /// Convert a literal from the call text into a typed value.
    pub fn parse(&self, literal: &str) -> Option<ArgValue> {
        match self {
            ParamType::String => Some(ArgValue::String(literal.to_string())),
            ParamType::Int => literal.trim().parse::<i64>().ok().map(ArgValue::Int),
            ParamType::Float => literal
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(ArgValue::Float),
            ParamType::Bool => match literal.trim().to_ascii_lowercase().as_str() {
                "true" => Some(ArgValue::Bool(true)),
                "false" => Some(ArgValue::Bool(false)),
                _ => None,
            },
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parameter of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
    /// Literal used when an optional parameter is omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// Whether invocations of a tool may overlap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Exclusivity {
    /// Runs concurrently with anything
    Shared,
    /// Serializes with every tool of the same kind
    Exclusive { kind: String },
}

/// Tool definition offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique registry key
    pub name: String,
    /// Description for the model
    pub description: String,
    /// Parameters in documentation order
    pub parameters: Vec<ParameterSpec>,
    /// Concurrency policy
    pub exclusivity: Exclusivity,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            exclusivity: Exclusivity::Shared,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<ParameterSpec>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Serialize with other tools of the same `kind`.
    pub fn exclusive(mut self, kind: impl Into<String>) -> Self {
        self.exclusivity = Exclusivity::Exclusive { kind: kind.into() };
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn exclusive_kind(&self) -> Option<&str> {
        match &self.exclusivity {
            Exclusivity::Shared => None,
            Exclusivity::Exclusive { kind } => Some(kind),
        }
    }

    /// Signature line used in the prompt catalogue, e.g.
    /// `search(pattern: string, path?: string = ".")`.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|p| {
                let marker = if p.required { "" } else { "?" };
                match &p.default {
                    Some(default) => {
                        format!("{}{}: {} = {:?}", p.name, marker, p.param_type, default)
                    }
                    None => format!("{}{}: {}", p.name, marker, p.param_type),
                }
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }

    /// Check the definition is internally consistent before registration.
    pub fn check(&self) -> Result<(), RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidDefinition {
            name: self.name.clone(),
            reason,
        };

        if !is_tool_name(&self.name) {
            return Err(invalid("name must be an identifier".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for param in &self.parameters {
            if !is_identifier(&param.name) {
                return Err(invalid(format!(
                    "parameter '{}' is not an identifier",
                    param.name
                )));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(invalid(format!("parameter '{}' declared twice", param.name)));
            }
            if let Some(default) = &param.default {
                if param.param_type.parse(default).is_none() {
                    return Err(invalid(format!(
                        "default {:?} for '{}' is not a valid {}",
                        default, param.name, param.param_type
                    )));
                }
            }
        }

        if let Exclusivity::Exclusive { kind } = &self.exclusivity {
            if kind.trim().is_empty() {
                return Err(invalid("exclusive kind must not be empty".to_string()));
            }
        }

        Ok(())
    }
}

/// Tool names may also contain `.` and `-` for namespaced adapters.
pub fn is_tool_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// Helper to build an ordered parameter list
pub struct SchemaBuilder {
    parameters: Vec<ParameterSpec>,
}

impl SchemaBuilder {
    /// Create a new schema builder
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    fn push(mut self, name: &str, param_type: ParamType, description: &str, required: bool) -> Self {
        self.parameters.push(ParameterSpec {
            name: name.to_string(),
            param_type,
            required,
            default: None,
            description: description.to_string(),
        });
        self
    }

    /// Add a string parameter
    pub fn string(self, name: &str, description: &str, required: bool) -> Self {
        self.push(name, ParamType::String, description, required)
    }

    /// Add an integer parameter
    pub fn integer(self, name: &str, description: &str, required: bool) -> Self {
        self.push(name, ParamType::Int, description, required)
    }

    /// Add a float parameter
    pub fn float(self, name: &str, description: &str, required: bool) -> Self {
        self.push(name, ParamType::Float, description, required)
    }

    /// Add a boolean parameter
    pub fn boolean(self, name: &str, description: &str, required: bool) -> Self {
        self.push(name, ParamType::Bool, description, required)
    }

    /// Set the default literal of the most recently added parameter
    pub fn default_value(mut self, literal: &str) -> Self {
        if let Some(last) = self.parameters.last_mut() {
            last.default = Some(literal.to_string());
        }
        self
    }

    /// Build the parameter list
    pub fn build(self) -> Vec<ParameterSpec> {
        self.parameters
    }
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_definition() -> ToolDefinition {
        ToolDefinition::new("search", "Search files").with_parameters(
            SchemaBuilder::new()
                .string("pattern", "Regex", true)
                .string("path", "Directory", false)
                .default_value(".")
                .integer("limit", "Max matches", false)
                .build(),
        )
    }

    #[test]
    fn test_schema_builder_preserves_order() {
        let params = search_definition().parameters;
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["pattern", "path", "limit"]);
        assert!(params[0].required);
        assert_eq!(params[1].default.as_deref(), Some("."));
        assert_eq!(params[2].param_type, ParamType::Int);
    }

    #[test]
    fn test_default_value_without_parameters_is_noop() {
        let params = SchemaBuilder::default().default_value("x").build();
        assert!(params.is_empty());
    }

    #[test]
    fn test_param_type_parse() {
        assert_eq!(ParamType::Int.parse("42"), Some(ArgValue::Int(42)));
        assert_eq!(ParamType::Int.parse("-7"), Some(ArgValue::Int(-7)));
        assert_eq!(ParamType::Int.parse("4.2"), None);
        assert_eq!(ParamType::Float.parse("4.5"), Some(ArgValue::Float(4.5)));
        assert_eq!(ParamType::Float.parse("NaN"), None);
        assert_eq!(ParamType::Bool.parse("TRUE"), Some(ArgValue::Bool(true)));
        assert_eq!(ParamType::Bool.parse("yes"), None);
        assert_eq!(
            ParamType::String.parse("two words"),
            Some(ArgValue::String("two words".to_string()))
        );
    }

    #[test]
    fn test_signature_rendering() {
        assert_eq!(
            search_definition().signature(),
            "search(pattern: string, path?: string = \".\", limit?: int)"
        );
    }

    #[test]
    fn test_exclusive_kind() {
        let def = ToolDefinition::new("shell", "Run").exclusive("workspace");
        assert_eq!(def.exclusive_kind(), Some("workspace"));
        assert_eq!(search_definition().exclusive_kind(), None);
    }

    #[test]
    fn test_check_accepts_valid_definition() {
        assert!(search_definition().check().is_ok());
    }

    #[test]
    fn test_check_rejects_bad_default() {
        let def = ToolDefinition::new("t", "d").with_parameters(
            SchemaBuilder::new()
                .integer("n", "count", false)
                .default_value("many")
                .build(),
        );
        assert!(matches!(
            def.check(),
            Err(RegistryError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_check_rejects_duplicate_parameter() {
        let def = ToolDefinition::new("t", "d").with_parameters(
            SchemaBuilder::new()
                .string("a", "", true)
                .string("a", "", false)
                .build(),
        );
        assert!(def.check().is_err());
    }

    #[test]
    fn test_check_rejects_bad_names() {
        assert!(ToolDefinition::new("9lives", "d").check().is_err());
        assert!(ToolDefinition::new("make coffee", "d").check().is_err());
        assert!(ToolDefinition::new("fs.read_dir", "d").check().is_ok());
    }

    #[test]
    fn test_definition_serializes_type_field() {
        let json = serde_json::to_value(search_definition()).unwrap();
        assert_eq!(json["parameters"][0]["type"], "string");
        assert_eq!(json["exclusivity"]["mode"], "shared");
    }
}
