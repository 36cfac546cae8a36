//! Token counting capability used for chunk budgeting.

use crate::job::TokenEstimatorInfo;

/// A tokenizer could not count a piece of text.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TokenizeError(pub String);

/// Counts tokens in a piece of text.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> Result<u64, TokenizeError>;

    /// Human-readable description of how counts are produced.
    fn strategy(&self) -> String;

    /// `false` when counts are an approximation.
    fn is_exact(&self) -> bool;
}

/// Fallback estimator: one token per four characters, rounded up.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count(&self, text: &str) -> Result<u64, TokenizeError> {
        Ok((text.chars().count() as u64).div_ceil(4))
    }

    fn strategy(&self) -> String {
        "approximate (characters / 4)".into()
    }

    fn is_exact(&self) -> bool {
        false
    }
}

/// Describe a tokenizer for a job result.
pub fn estimator_info(tokenizer: &dyn Tokenizer, enabled: bool) -> TokenEstimatorInfo {
    TokenEstimatorInfo {
        enabled,
        approximate: !tokenizer.is_exact(),
        strategy: tokenizer.strategy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_rounds_up() {
        let t = HeuristicTokenizer;
        assert_eq!(t.count("").unwrap(), 0);
        assert_eq!(t.count("a").unwrap(), 1);
        assert_eq!(t.count("abcd").unwrap(), 1);
        assert_eq!(t.count("abcde").unwrap(), 2);
        assert_eq!(t.count(&"x".repeat(200)).unwrap(), 50);
    }

    #[test]
    fn heuristic_counts_chars_not_bytes() {
        let t = HeuristicTokenizer;
        // four multi-byte chars
        assert_eq!(t.count("éééé").unwrap(), 1);
    }

    #[test]
    fn heuristic_reported_approximate() {
        let info = estimator_info(&HeuristicTokenizer, true);
        assert!(info.enabled);
        assert!(info.approximate);
        assert_eq!(info.strategy, "approximate (characters / 4)");
    }
}
