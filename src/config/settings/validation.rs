// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

use crate::error::{CodeloopError, Result};

use super::Settings;

impl Settings {
    /// Reject combinations that would make the guard or dispatcher misbehave.
    pub fn validate(&self) -> Result<()> {
        let guard = &self.guard;

        if guard.min_pattern_len == 0 {
            return Err(invalid("guard.min_pattern_len must be at least 1"));
        }
        if guard.min_pattern_len > guard.max_pattern_len {
            return Err(invalid(format!(
                "guard.min_pattern_len ({}) exceeds guard.max_pattern_len ({})",
                guard.min_pattern_len, guard.max_pattern_len
            )));
        }
        if guard.repetition_threshold < 2 {
            return Err(invalid("guard.repetition_threshold must be at least 2"));
        }
        if guard.sentence_window < 2 {
            return Err(invalid("guard.sentence_window must be at least 2"));
        }
        if !(guard.retain_fraction > 0.0 && guard.retain_fraction <= 1.0) {
            return Err(invalid(format!(
                "guard.retain_fraction must be in (0, 1], got {}",
                guard.retain_fraction
            )));
        }
        if guard.window_chars < guard.min_pattern_len * guard.repetition_threshold {
            tracing::warn!(
                target: "codeloop.config",
                window_chars = guard.window_chars,
                "guard window too small to ever detect the shortest pattern"
            );
        }

        if self.tools.default_timeout_ms == 0 {
            return Err(invalid("tools.default_timeout_ms must be positive"));
        }
        if self.engine.startup_timeout_ms == 0 {
            return Err(invalid("engine.startup_timeout_ms must be positive"));
        }
        if !(self.engine.repetition_penalty > 0.0) {
            return Err(invalid("engine.repetition_penalty must be positive"));
        }
        if self.engine.command.trim().is_empty() {
            return Err(invalid("engine.command must not be empty"));
        }

        if self.retrieval.chunk_chars == 0 {
            return Err(invalid("retrieval.chunk_chars must be at least 1"));
        }
        if self.retrieval.max_results == 0 {
            return Err(invalid("retrieval.max_results must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> CodeloopError {
    CodeloopError::Config(message.into())
}
