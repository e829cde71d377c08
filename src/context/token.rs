// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Token estimation
//!
//! A fixed characters-per-token ratio, rounded up. Deterministic, so the
//! same history always costs the same.

/// Characters counted as one token
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token cost of a string.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}
