//! Token counting with a conservative safety margin.
//!
//! The Pager and the Proposer both need to know how many tokens a piece of
//! text will cost before it is ever sent to a model. [`HeuristicTokenizer`]
//! is the always-available fallback (`ceil(len/3)`); a caller that wants
//! closer parity with a specific model family can implement [`Tokenizer`]
//! against a real BPE vocabulary without the kernel depending on one
//! directly, the same way model drivers are a trait boundary.

/// 1.75x applied to every raw estimate to absorb tokenizer mismatch between
/// the heuristic and whatever encoding the target model actually uses.
const SAFETY_MARGIN: f64 = 1.75;

pub trait Tokenizer: Send + Sync {
    /// Map text to a token count, inclusive of the safety margin.
    fn count_tokens(&self, text: &str) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        if text.trim().is_empty() {
            return 0;
        }
        let raw = (text.chars().count() as f64 / 3.0).ceil();
        let scaled = (raw * SAFETY_MARGIN).ceil() as usize;
        scaled.max(1)
    }
}
