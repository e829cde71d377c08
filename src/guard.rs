// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Repetition and length guard for streamed generations
//!
//! The guard inspects the append-only generation buffer after every token and
//! decides whether generation may continue. It stops on three conditions,
//! checked in order:
//!
//! 1. hard character / token ceilings
//! 2. a trailing pattern repeated back-to-back (whitespace-insensitive)
//! 3. sentence-level degeneration: too few distinct sentences at the tail
//!
//! Only the trailing `window_chars` characters are inspected, so the cost of a
//! check is bounded by `window_chars * (max_pattern_len - min_pattern_len)`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::GuardConfig;

/// Prefix of the machine-readable marker appended after a truncation.
pub const TRUNCATION_MARKER_PREFIX: &str = "[generation truncated: ";

/// Why the guard stopped a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardStop {
    /// Character or token ceiling exceeded
    LengthLimit,
    /// A trailing pattern repeated `repetition_threshold` times
    PatternRepetition,
    /// Too few distinct sentences among the last few
    SentenceRepetition,
}

impl GuardStop {
    /// Stable identifier used in truncation markers and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardStop::LengthLimit => "length_limit",
            GuardStop::PatternRepetition => "pattern_repetition",
            GuardStop::SentenceRepetition => "sentence_repetition",
        }
    }

    /// Human-readable notice for the presentation layer
    pub fn notice(&self) -> &'static str {
        match self {
            GuardStop::LengthLimit => "truncated: response exceeded the length limit",
            GuardStop::PatternRepetition => "truncated due to repetition",
            GuardStop::SentenceRepetition => "truncated due to repeated sentences",
        }
    }
}

impl std::fmt::Display for GuardStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-token decision of the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Continue,
    Stop(GuardStop),
}

impl GuardVerdict {
    pub fn is_stop(&self) -> bool {
        matches!(self, GuardVerdict::Stop(_))
    }
}

/// Bookkeeping kept between observations of one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardState {
    /// Number of `observe` calls so far
    pub observations: usize,
    /// Length in characters of the buffer at the last observation
    pub last_char_count: usize,
    /// Verdict that ended the session, if any
    pub stopped: Option<GuardStop>,
}

/// Analyzer for one generation session
#[derive(Debug, Clone)]
pub struct RepetitionGuard {
    config: GuardConfig,
    state: GuardState,
}

impl RepetitionGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            state: GuardState::default(),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn state(&self) -> &GuardState {
        &self.state
    }

    /// Clear per-session state so the guard can watch a new generation.
    pub fn reset(&mut self) {
        self.state = GuardState::default();
    }

    /// Inspect the buffer after a token was appended.
    pub fn observe(&mut self, buffer: &str, token_count: usize) -> GuardVerdict {
        self.state.observations += 1;

        let char_count = buffer.chars().count();
        self.state.last_char_count = char_count;

        let verdict = self.evaluate(buffer, char_count, token_count);
        if let GuardVerdict::Stop(reason) = verdict {
            tracing::debug!(
                target: "codeloop.guard",
                reason = %reason,
                char_count,
                token_count,
                observations = self.state.observations,
                "guard stopped generation"
            );
            self.state.stopped = Some(reason);
        }
        verdict
    }

    fn evaluate(&self, buffer: &str, char_count: usize, token_count: usize) -> GuardVerdict {
        if char_count > self.config.max_chars || token_count > self.config.max_tokens {
            return GuardVerdict::Stop(GuardStop::LengthLimit);
        }

        let window = trailing_window(buffer, self.config.window_chars);
        let chars: Vec<char> = window.chars().collect();

        if detect_pattern_repetition(
            &chars,
            self.config.min_pattern_len,
            self.config.max_pattern_len,
            self.config.repetition_threshold,
        )
        .is_some()
        {
            return GuardVerdict::Stop(GuardStop::PatternRepetition);
        }

        if detect_sentence_repetition(window, self.config.sentence_window) {
            return GuardVerdict::Stop(GuardStop::SentenceRepetition);
        }

        GuardVerdict::Continue
    }
}

/// Last `max_chars` characters of `text`, on a char boundary.
pub fn trailing_window(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}

/// Find a trailing pattern repeated back-to-back at least `threshold` times.
///
/// Returns the pattern length in characters.
pub fn detect_pattern_repetition(
    chars: &[char],
    min_len: usize,
    max_len: usize,
    threshold: usize,
) -> Option<usize> {
    let total = chars.len();
    if min_len == 0 || threshold == 0 {
        return None;
    }

    for len in min_len..=max_len {
        if len.saturating_mul(threshold) > total {
            break;
        }

        let pattern = &chars[total - len..];
        // Blank runs (indentation, empty lines) are not degenerate output.
        if words(pattern).next().is_none() {
            continue;
        }
        let mut count = 1;
        let mut end = total - len;

        while count < threshold && end >= len {
            let previous = &chars[end - len..end];
            if !normalized_eq(previous, pattern) {
                break;
            }
            count += 1;
            end -= len;
        }

        if count >= threshold {
            return Some(len);
        }
    }

    None
}

/// Check whether the last `window` sentences are mostly duplicates.
///
/// Stops when at most `window / 2` distinct sentences appear among the last
/// `window` while at least `window - 1` sentences are present. Only sentences
/// closed by `.`, `!` or `?` count; a trailing fragment is still being written.
pub fn detect_sentence_repetition(text: &str, window: usize) -> bool {
    if window < 2 {
        return false;
    }

    let sentences = closed_sentences(text);
    let tail = &sentences[sentences.len().saturating_sub(window)..];
    if tail.len() < window - 1 {
        return false;
    }

    let unique: HashSet<&String> = tail.iter().collect();
    unique.len() <= window / 2
}

/// Split on sentence terminators, normalized and without the open fragment.
fn closed_sentences(text: &str) -> Vec<String> {
    let mut pieces: Vec<&str> = text.split(['.', '!', '?']).collect();
    // The piece after the last terminator has not been closed yet.
    pieces.pop();

    pieces
        .into_iter()
        .map(normalize_sentence)
        .filter(|s| !s.is_empty())
        .collect()
}

fn normalize_sentence(sentence: &str) -> String {
    sentence
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn words(chars: &[char]) -> impl Iterator<Item = &[char]> {
    chars
        .split(|c| c.is_whitespace())
        .filter(|word| !word.is_empty())
}

/// Equality after collapsing whitespace runs and trimming both ends.
fn normalized_eq(a: &[char], b: &[char]) -> bool {
    words(a).eq(words(b))
}

/// Number of characters kept when truncating `char_count` characters.
pub fn retained_len(char_count: usize, retain_fraction: f64) -> usize {
    let fraction = retain_fraction.clamp(0.0, 1.0);
    let kept = (char_count as f64 * fraction).ceil() as usize;
    kept.min(char_count)
}

/// Machine-readable marker appended after a guard stop.
pub fn truncation_marker(reason: GuardStop) -> String {
    format!("\n{}{}]", TRUNCATION_MARKER_PREFIX, reason.as_str())
}

/// Cut the buffer to the retained fraction and append the marker.
pub fn truncate_with_marker(buffer: &str, retain_fraction: f64, reason: GuardStop) -> String {
    let char_count = buffer.chars().count();
    let keep = retained_len(char_count, retain_fraction);
    let mut truncated: String = buffer.chars().take(keep).collect();
    truncated.push_str(&truncation_marker(reason));
    truncated
}

/// Recover the stop reason from text that ends with a truncation marker.
pub fn parse_truncation_marker(text: &str) -> Option<GuardStop> {
    let start = text.rfind(TRUNCATION_MARKER_PREFIX)?;
    let rest = text[start + TRUNCATION_MARKER_PREFIX.len()..].strip_suffix(']')?;
    match rest {
        "length_limit" => Some(GuardStop::LengthLimit),
        "pattern_repetition" => Some(GuardStop::PatternRepetition),
        "sentence_repetition" => Some(GuardStop::SentenceRepetition),
        _ => None,
    }
}
