// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! CLI argument definitions using Clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// codeloop - agent loop for a local inference engine
#[derive(Parser, Debug)]
#[command(name = "codeloop")]
#[command(version, about = "Agent loop for a local inference engine")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Working directory for tools (defaults to current)
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<PathBuf>,

    /// Settings file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one agent turn against the inference bridge
    Ask(AskArgs),

    /// List registered tools and their call syntax
    Tools,

    /// Search the working directory for code matching a query
    Retrieve(RetrieveArgs),

    /// Inspect or edit persistent memory
    Memory(MemoryArgs),

    /// Inspect or create the settings file
    #[command(alias = "config")]
    Settings(SettingsArgs),
}

/// Arguments for the ask subcommand
#[derive(clap::Args, Debug)]
pub struct AskArgs {
    /// The prompt to send
    pub prompt: String,

    /// Model directory to load (overrides settings)
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Do not re-enter generation after tool results
    #[arg(long)]
    pub no_continue: bool,

    /// Context budget in estimated tokens (overrides settings)
    #[arg(long)]
    pub budget: Option<usize>,

    /// Add code from the working directory that matches the prompt
    #[arg(short, long)]
    pub retrieve: bool,
}

/// Arguments for the retrieve subcommand
#[derive(clap::Args, Debug)]
pub struct RetrieveArgs {
    /// What to look for
    pub query: String,

    /// Maximum number of chunks to show (overrides settings)
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

/// Arguments for the memory subcommand
#[derive(clap::Args, Debug)]
pub struct MemoryArgs {
    #[command(subcommand)]
    pub command: Option<MemoryCommands>,
}

/// Memory subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum MemoryCommands {
    /// List persisted entries
    List,

    /// Store an entry
    Set {
        key: String,
        value: String,
        /// Always include this entry in the context
        #[arg(short, long)]
        important: bool,
    },

    /// Remove an entry
    Forget { key: String },
}

/// Arguments for the settings subcommand
#[derive(clap::Args, Debug)]
pub struct SettingsArgs {
    #[command(subcommand)]
    pub command: Option<SettingsCommands>,
}

/// Settings subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum SettingsCommands {
    /// Show current configuration
    Show,

    /// Print the settings file location
    Path,

    /// Write a settings file with defaults
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
