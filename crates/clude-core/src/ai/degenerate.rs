//! Pathological-output detection for the LLM chokepoint.
//!
//! Two cheap signals over the raw completion text:
//! - n-gram repetition ratio: distinct n-grams / total n-grams
//! - Shannon entropy over characters
//!
//! Either one below its threshold marks the output degenerate. The text is
//! truncated before being surfaced so a runaway `{{{{…` stream never reaches
//! the parser or the user.

use std::collections::HashMap;

/// Window size for the n-gram ratio.
const NGRAM: usize = 8;

/// Outputs shorter than this are never flagged (short answers legitimately
/// repeat little).
const MIN_LEN: usize = 200;

/// Below this distinct/total ratio the output is considered repetitive.
const REPETITION_RATIO_THRESHOLD: f64 = 0.10;

/// Below this many bits per character the output is considered degenerate.
const ENTROPY_THRESHOLD: f64 = 1.5;

/// How much of a degenerate output is kept for diagnostics.
const TRUNCATE_TO: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegenerateKind {
    Repetition,
    LowEntropy,
}

impl DegenerateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Repetition => "repetition",
            Self::LowEntropy => "low_entropy",
        }
    }
}

/// Verdict over one completion.
#[derive(Debug, Clone)]
pub struct DegenerateReport {
    pub kind: DegenerateKind,
    /// Head of the offending text, bounded.
    pub truncated: String,
    pub ratio: f64,
}

/// Inspect a completion for repetition collapse. Returns `None` for healthy
/// output.
pub fn detect(text: &str) -> Option<DegenerateReport> {
    if text.len() < MIN_LEN {
        return None;
    }

    let chars: Vec<char> = text.chars().collect();

    let ratio = ngram_distinct_ratio(&chars);
    if ratio < REPETITION_RATIO_THRESHOLD {
        return Some(DegenerateReport {
            kind: DegenerateKind::Repetition,
            truncated: truncate(text),
            ratio,
        });
    }

    let entropy = char_entropy(&chars);
    if entropy < ENTROPY_THRESHOLD {
        return Some(DegenerateReport {
            kind: DegenerateKind::LowEntropy,
            truncated: truncate(text),
            ratio: entropy,
        });
    }

    None
}

fn truncate(text: &str) -> String {
    let mut end = TRUNCATE_TO.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

fn ngram_distinct_ratio(chars: &[char]) -> f64 {
    if chars.len() < NGRAM * 2 {
        return 1.0;
    }
    let total = chars.len() - NGRAM + 1;
    let mut seen: HashMap<&[char], ()> = HashMap::with_capacity(total);
    for window in chars.windows(NGRAM) {
        seen.entry(window).or_insert(());
    }
    seen.len() as f64 / total as f64
}

fn char_entropy(chars: &[char]) -> f64 {
    if chars.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<char, usize> = HashMap::new();
    for &c in chars {
        *counts.entry(c).or_insert(0) += 1;
    }
    let n = chars.len() as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / n;
            -p * p.log2()
        })
        .sum()
}
