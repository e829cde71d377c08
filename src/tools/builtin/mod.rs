// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Built-in tools for codeloop

mod file_read;
mod file_write;
mod search;
mod shell;

pub use file_read::FileReadTool;
pub use file_write::FileWriteTool;
pub use search::SearchTool;
pub use shell::ShellTool;

use std::sync::Arc;

use crate::error::RegistryError;

use super::ToolRegistry;

/// Exclusive kind shared by tools that mutate the working directory
pub const WORKSPACE_KIND: &str = "workspace";

/// Register every built-in tool.
pub fn register_all(registry: &mut ToolRegistry) -> Result<(), RegistryError> {
    registry.register(Arc::new(FileReadTool))?;
    registry.register(Arc::new(FileWriteTool))?;
    registry.register(Arc::new(SearchTool))?;
    registry.register(Arc::new(ShellTool::new()))?;
    Ok(())
}
