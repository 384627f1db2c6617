//! Phrase matching for spoken answers.
//!
//! Recognizers mangle accented or partial speech, so matching favors recall:
//! a complete but reordered answer scores 100, near-miss words earn partial
//! credit, and a learner who says more than required gets a small bonus.

use std::collections::BTreeSet;

/// Scores at or above this count as a correct utterance.
pub const ACCEPT_THRESHOLD: u8 = 60;

const PUNCTUATION: [char; 6] = ['.', ',', '?', '!', ';', ':'];
const PARTIAL_MATCH_RATIO: f64 = 0.7;
const PARTIAL_MATCH_WEIGHT: f64 = 0.8;
const VERBOSITY_BONUS: f64 = 5.0;
const VOCABULARY_PREFIX_CHARS: usize = 2;
const VOCABULARY_PREFIX_RATIO: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
enum TokenMatch {
    Exact,
    Partial,
    Missing,
}

impl TokenMatch {
    fn weight(self) -> f64 {
        match self {
            TokenMatch::Exact => 1.0,
            TokenMatch::Partial => PARTIAL_MATCH_WEIGHT,
            TokenMatch::Missing => 0.0,
        }
    }
}

/// Lowercases, strips `.,?!;:` and splits on whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .filter(|c| !PUNCTUATION.contains(c))
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Same normalization as [`tokenize`], rejoined with single spaces.
pub fn normalize(text: &str) -> String {
    tokenize(text).join(" ")
}

/// Position-by-position comparison up to the shorter token, measured against
/// the longer one. Tokens of two characters or fewer never partially match.
fn is_partial_match(expected: &str, spoken: &str) -> bool {
    let expected: Vec<char> = expected.chars().collect();
    let spoken: Vec<char> = spoken.chars().collect();
    if expected.len() <= 2 || spoken.len() <= 2 {
        return false;
    }
    let longer = expected.len().max(spoken.len());
    let agreeing = expected
        .iter()
        .zip(spoken.iter())
        .filter(|(e, s)| e == s)
        .count();
    agreeing as f64 / longer as f64 >= PARTIAL_MATCH_RATIO
}

fn match_token(expected: &str, spoken: &[String]) -> TokenMatch {
    if spoken.iter().any(|s| s == expected) {
        TokenMatch::Exact
    } else if spoken.iter().any(|s| is_partial_match(expected, s)) {
        TokenMatch::Partial
    } else {
        TokenMatch::Missing
    }
}

/// Similarity of a recognized utterance to the expected phrase, 0..=100.
pub fn score(spoken: &str, expected: &str) -> u8 {
    let spoken_tokens = tokenize(spoken);
    let expected_tokens = tokenize(expected);
    if spoken_tokens.is_empty() || expected_tokens.is_empty() {
        return 0;
    }

    if expected_tokens.iter().all(|t| spoken_tokens.contains(t)) {
        return 100;
    }

    let weighted: f64 = expected_tokens
        .iter()
        .map(|t| match_token(t, &spoken_tokens).weight())
        .sum();
    let mut percentage = 100.0 * weighted / expected_tokens.len() as f64;
    if spoken_tokens.len() > expected_tokens.len() {
        percentage += VERBOSITY_BONUS;
    }
    percentage.clamp(0.0, 100.0).round() as u8
}

/// Expected tokens the learner is considered to have said, for highlighting.
pub fn matched_words(spoken: &str, expected: &str) -> BTreeSet<String> {
    let spoken_tokens = tokenize(spoken);
    if spoken_tokens.is_empty() {
        return BTreeSet::new();
    }
    tokenize(expected)
        .into_iter()
        .filter(|t| match_token(t, &spoken_tokens) != TokenMatch::Missing)
        .collect()
}

pub fn is_accepted(score: u8) -> bool {
    score >= ACCEPT_THRESHOLD
}

/// Looser check used by the vocabulary quiz, where answers are single words.
///
/// Accepts an exact normalized match, containment in either direction, or a
/// shared prefix of at least two characters or 30% of the expected length.
pub fn is_vocabulary_match(spoken: &str, expected: &str) -> bool {
    let spoken = normalize(spoken);
    let expected = normalize(expected);
    if spoken.is_empty() || expected.is_empty() {
        return false;
    }
    if spoken == expected || spoken.contains(&expected) || expected.contains(&spoken) {
        return true;
    }

    let shared_prefix = spoken
        .chars()
        .zip(expected.chars())
        .take_while(|(s, e)| s == e)
        .count();
    let expected_len = expected.chars().count();
    shared_prefix >= VOCABULARY_PREFIX_CHARS
        || shared_prefix as f64 >= VOCABULARY_PREFIX_RATIO * expected_len as f64
}
