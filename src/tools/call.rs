// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Tool-call extraction from completed assistant text
//!
//! Calls are wrapped in delimiters and hold one call expression:
//!
//! ```text
//! <tool_call>
//! search(pattern=TODO, path="src/engine dir")
//! </tool_call>
//! ```
//!
//! Grammar:
//!
//! ```text
//! call   := name ws "(" ws [ arg ( ws "," ws arg )* ] ws ")" ws EOF
//! arg    := ident ws "=" ws value
//! value  := quoted | bare
//! quoted := '"' ( '\' any | [^"\\] )* '"'
//! bare   := ( char | "(" nested* ")" )+     ; not starting with '"'
//! char   := [^ \t\r\n,()]
//! nested := [^ \t\r\n()] | "(" nested* ")"
//! ```
//!
//! A bare value ends at whitespace, a comma, or the `)` that closes the call.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;

use super::definition::is_tool_name;

/// Opening delimiter of a tool call
pub const TOOL_CALL_OPEN: &str = "<tool_call>";
/// Closing delimiter of a tool call
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// A well-formed call parsed out of generated text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier that ties the call to its result
    pub id: String,
    pub tool_name: String,
    /// Arguments as written, in order
    pub raw_arguments: Vec<(String, String)>,
    /// Byte range of the whole delimited block in the source text
    pub source_span: Range<usize>,
}

impl ToolCall {
    pub fn argument(&self, key: &str) -> Option<&str> {
        self.raw_arguments
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A delimited block whose contents did not parse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedCall {
    pub id: String,
    /// Leading name if one could be read
    pub tool_name: Option<String>,
    /// Text between the delimiters
    pub raw: String,
    pub reason: String,
    pub source_span: Range<usize>,
}

/// Outcome of scanning one delimited block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCall {
    Call(ToolCall),
    Malformed(MalformedCall),
}

impl ParsedCall {
    pub fn id(&self) -> &str {
        match self {
            ParsedCall::Call(call) => &call.id,
            ParsedCall::Malformed(bad) => &bad.id,
        }
    }

    /// Tool name, or `"unknown"` when a malformed block has none
    pub fn tool_name(&self) -> &str {
        match self {
            ParsedCall::Call(call) => &call.tool_name,
            ParsedCall::Malformed(bad) => bad.tool_name.as_deref().unwrap_or("unknown"),
        }
    }

    pub fn source_span(&self) -> &Range<usize> {
        match self {
            ParsedCall::Call(call) => &call.source_span,
            ParsedCall::Malformed(bad) => &bad.source_span,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, ParsedCall::Malformed(_))
    }
}

fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Scan completed text for delimited tool calls, in order of appearance.
pub fn extract_tool_calls(text: &str) -> Vec<ParsedCall> {
    let mut calls = Vec::new();
    let mut cursor = 0;

    while let Some(found) = text[cursor..].find(TOOL_CALL_OPEN) {
        let start = cursor + found;
        let body_start = start + TOOL_CALL_OPEN.len();
        let next_open = text[body_start..]
            .find(TOOL_CALL_OPEN)
            .map(|i| body_start + i);
        let close = text[body_start..]
            .find(TOOL_CALL_CLOSE)
            .map(|i| body_start + i);

        match (close, next_open) {
            (Some(close), next) if next.map_or(true, |n| close < n) => {
                let end = close + TOOL_CALL_CLOSE.len();
                let body = &text[body_start..close];
                calls.push(parse_block(body, start..end));
                cursor = end;
            }
            (_, Some(next)) => {
                // Another block opens before this one closes.
                calls.push(malformed(
                    &text[body_start..next],
                    start..next,
                    format!("missing {} before next {}", TOOL_CALL_CLOSE, TOOL_CALL_OPEN),
                ));
                cursor = next;
            }
            _ => {
                calls.push(malformed(
                    &text[body_start..],
                    start..text.len(),
                    format!("missing {}", TOOL_CALL_CLOSE),
                ));
                break;
            }
        }
    }

    calls
}

fn parse_block(body: &str, span: Range<usize>) -> ParsedCall {
    match parse_call_expression(body) {
        Ok((tool_name, raw_arguments)) => ParsedCall::Call(ToolCall {
            id: new_call_id(),
            tool_name,
            raw_arguments,
            source_span: span,
        }),
        Err(reason) => malformed(body, span, reason),
    }
}

fn malformed(body: &str, span: Range<usize>, reason: String) -> ParsedCall {
    let trimmed = body.trim();
    let name: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    ParsedCall::Malformed(MalformedCall {
        id: new_call_id(),
        tool_name: is_tool_name(&name).then_some(name),
        raw: trimmed.to_string(),
        reason,
        source_span: span,
    })
}

/// Parse a single `name(key=value, ...)` expression.
pub fn parse_call_expression(expr: &str) -> Result<(String, Vec<(String, String)>), String> {
    let mut parser = Parser {
        chars: expr.chars().collect(),
        pos: 0,
    };
    parser.call()
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn call(&mut self) -> Result<(String, Vec<(String, String)>), String> {
        self.skip_ws();
        let name = self.take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if name.is_empty() {
            return Err("expected tool name".to_string());
        }
        if !is_tool_name(&name) {
            return Err(format!("invalid tool name '{}'", name));
        }

        self.skip_ws();
        if self.bump() != Some('(') {
            return Err(format!("expected '(' after '{}'", name));
        }

        let mut args: Vec<(String, String)> = Vec::new();
        let mut seen = HashSet::new();

        self.skip_ws();
        if self.peek() == Some(')') {
            self.pos += 1;
        } else {
            loop {
                let (key, value) = self.argument()?;
                if !seen.insert(key.clone()) {
                    return Err(format!("duplicate argument '{}'", key));
                }
                args.push((key, value));

                self.skip_ws();
                match self.bump() {
                    Some(',') => self.skip_ws(),
                    Some(')') => break,
                    Some('(') => return Err("unbalanced parentheses".to_string()),
                    Some(c) => return Err(format!("unexpected '{}' in argument list", c)),
                    None => return Err("unbalanced parentheses: missing ')'".to_string()),
                }
            }
        }

        self.skip_ws();
        match self.peek() {
            None => Ok((name, args)),
            Some(')') => Err("unbalanced parentheses: extra ')'".to_string()),
            Some(_) => Err("unexpected text after call expression".to_string()),
        }
    }

    fn argument(&mut self) -> Result<(String, String), String> {
        let key = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
        if key.is_empty() {
            return match self.peek() {
                None => Err("unbalanced parentheses: missing ')'".to_string()),
                Some(c) => Err(format!("expected argument name, found '{}'", c)),
            };
        }
        if !is_identifier(&key) {
            return Err(format!("invalid argument name '{}'", key));
        }

        self.skip_ws();
        if self.bump() != Some('=') {
            return Err(format!("expected '=' after '{}'", key));
        }
        self.skip_ws();

        let value = match self.peek() {
            Some('"') => self.quoted()?,
            _ => self.bare(&key)?,
        };

        Ok((key, value))
    }

    /// Unquoted scalar: runs to whitespace, a comma, or the `)` closing the
    /// call. Parentheses inside the value must balance.
    fn bare(&mut self, key: &str) -> Result<String, String> {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            match c {
                c if c.is_whitespace() => break,
                ',' if depth == 0 => break,
                ')' if depth == 0 => break,
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
            self.pos += 1;
        }
        if depth > 0 {
            return Err(format!("unbalanced parentheses in value for '{}'", key));
        }
        if self.pos == start {
            return Err(format!("missing value for '{}'", key));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn quoted(&mut self) -> Result<String, String> {
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(value),
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some(other) => value.push(other),
                    None => return Err("unterminated string".to_string()),
                },
                Some(c) => value.push(c),
                None => return Err("unterminated string".to_string()),
            }
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }
}

/// Bare identifier: `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Render a call in wire syntax, quoting values only when needed.
pub fn format_tool_call<K, V>(name: &str, args: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let rendered: Vec<String> = args
        .iter()
        .map(|(k, v)| format!("{}={}", k.as_ref(), format_value(v.as_ref())))
        .collect();
    format!(
        "{}\n{}({})\n{}",
        TOOL_CALL_OPEN,
        name,
        rendered.join(", "),
        TOOL_CALL_CLOSE
    )
}

fn format_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ',' | '(' | ')' | '=' | '"' | '\\'));
    if !needs_quotes {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Remove delimited call blocks from text, leaving the prose.
pub fn strip_tool_calls(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for parsed in extract_tool_calls(text) {
        let span = parsed.source_span();
        out.push_str(&text[cursor..span.start]);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}
