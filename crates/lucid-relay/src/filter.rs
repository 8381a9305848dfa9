use std::collections::HashSet;

/// Replacement token for banned words.
pub const FILTERED_MARKER: &str = "[filtered]";

/// Case-insensitive banned-word filter over whitespace-delimited tokens.
///
/// The marker itself is stripped from the banned set at construction, so
/// `filter` is idempotent: running it twice yields the same output.
pub struct WordFilter {
    banned: HashSet<String>,
}

impl WordFilter {
    pub fn new(words: Vec<String>) -> Self {
        let banned = words
            .into_iter()
            .map(|w| w.to_lowercase())
            .filter(|w| w != FILTERED_MARKER)
            .collect();
        Self { banned }
    }

    /// Replace each banned token with the marker. Runs of whitespace
    /// collapse to single spaces and the result is trimmed.
    pub fn filter(&self, text: &str) -> String {
        text.split_whitespace()
            .map(|token| {
                if self.banned.contains(&token.to_lowercase()) {
                    FILTERED_MARKER
                } else {
                    token
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.banned.is_empty()
    }
}
