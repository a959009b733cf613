//! Token count estimation.

/// Estimates how many tokens a model will see for a piece of text.
///
/// Implementations must be deterministic and monotonic: appending text never
/// lowers the estimate.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Character-ratio heuristic, roughly four characters per token for English
/// prose across current tokenizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    pub fn chars_per_token(&self) -> usize {
        self.chars_per_token
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_ratio_rounds_up() {
        let estimator = CharRatioEstimator::default();
        assert_eq!(estimator.estimate(""), 0);
        assert_eq!(estimator.estimate("a"), 1);
        assert_eq!(estimator.estimate("abcd"), 1);
        assert_eq!(estimator.estimate("abcde"), 2);
        assert_eq!(estimator.estimate(&"x".repeat(12_000)), 3_000);
    }

    #[test]
    fn test_counts_chars_not_bytes() {
        let estimator = CharRatioEstimator::default();
        assert_eq!(estimator.estimate("日本語です"), 2);
    }

    #[test]
    fn test_monotonic_in_length() {
        let estimator = CharRatioEstimator::new(3);
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(20);
        let mut previous = 0;
        for end in 0..=text.len() {
            let estimate = estimator.estimate(&text[..end]);
            assert!(estimate >= previous);
            previous = estimate;
        }
    }

    #[test]
    fn test_zero_ratio_is_clamped() {
        assert_eq!(CharRatioEstimator::new(0).chars_per_token(), 1);
    }
}
