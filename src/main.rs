// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! codeloop - agent loop for a local inference engine
//!
//! Entry point for the codeloop CLI.

use clap::Parser;

use codeloop::cli::{Cli, Commands};
use codeloop::config::Settings;
use codeloop::error::Result;

#[path = "main/cli_commands.rs"]
mod cli_commands;

use cli_commands::{run_ask, run_memory_command, run_retrieve, run_settings_command, run_tools};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into());

    // `-v` turns on the agent loop diagnostics; `RUST_LOG` still takes precedence.
    if cli.verbose > 0 {
        let level = if cli.verbose > 1 { "trace" } else { "debug" };
        for target in [
            "codeloop.session",
            "codeloop.tools",
            "codeloop.engine",
            "codeloop.context",
        ] {
            if let Ok(parsed) = format!("{}={}", target, level).parse() {
                env_filter = env_filter.add_directive(parsed);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let settings_path = cli.config.clone().unwrap_or_else(Settings::default_path);

    match cli.command {
        Commands::Ask(args) => {
            let settings = Settings::load_from(&settings_path)?;
            Settings::ensure_directories()?;
            run_ask(args, settings, cli.directory).await?;
        }
        Commands::Tools => {
            run_tools()?;
        }
        Commands::Retrieve(args) => {
            let settings = Settings::load_from(&settings_path)?;
            run_retrieve(args, settings, cli.directory).await?;
        }
        Commands::Memory(args) => {
            let settings = Settings::load_from(&settings_path)?;
            Settings::ensure_directories()?;
            run_memory_command(args, &settings)?;
        }
        Commands::Settings(args) => {
            run_settings_command(args, &settings_path)?;
        }
    }

    Ok(())
}
