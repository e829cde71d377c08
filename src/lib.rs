// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! codeloop - agent orchestration core for a local inference engine.
//!
//! The crate streams text from an opaque inference process, stops degenerate
//! output as it happens, runs the tool calls the model writes into its
//! answer, and keeps a bounded memory of the conversation for the next
//! prompt.
//!
//! Architecture highlights:
//! - `guard`: per-token repetition and length checks
//! - `tools`: `<tool_call>` parser, schema validation, registry and dispatch
//! - `context`: scoped memory, conversation log, budgeted context assembly
//! - `engine`: inference engine boundary and the JSON-lines bridge process
//! - `session`: generation state machine and the agent loop around it

pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod guard;
pub mod session;
pub mod tools;

pub use error::{CodeloopError, Result};
