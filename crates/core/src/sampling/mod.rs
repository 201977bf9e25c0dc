//! Next-token selection for batched generation.
//!
//! This module provides:
//! - Score transforms: watermark bias, repetition penalty, temperature,
//!   top-k, top-p and typical-p
//! - Greedy and seeded sampling selectors
//! - [`NextTokenChooser`] for a single request and
//!   [`HeterogeneousNextTokenChooser`] for a batch with per-row parameters
//! - Top-n log-probability extraction with [`batch_top_tokens`]

mod chooser;
mod heterogeneous;
pub mod logits_processor;
mod rows;
mod selector;
mod top_tokens;
mod watermark;

pub use chooser::NextTokenChooser;
pub use heterogeneous::{HeterogeneousNextTokenChooser, NextTokens};
pub use logits_processor::{
    HeterogeneousRepetitionPenalty, HeterogeneousWarper, StaticWarper, WarperKind,
};
pub use rows::{validate_filter_indices, RowMap};
pub use selector::{argmax, Greedy, HeterogeneousSampling, Sampling, TokenSelector};
pub use top_tokens::{batch_top_tokens, TopTokens};
pub use watermark::{HeterogeneousWatermark, WatermarkProcessor};

/// Numerically stable softmax. A row with no finite score maps to all zeros.
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max_logit == f32::NEG_INFINITY {
        return vec![0.0; logits.len()];
    }
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

/// Compute log-softmax in a numerically stable way.
/// log_softmax(x_i) = x_i - max(x) - log(sum(exp(x_j - max(x))))
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum_ln = logits
        .iter()
        .map(|&x| (x - max_logit).exp())
        .sum::<f32>()
        .ln();
    logits.iter().map(|&x| x - max_logit - exp_sum_ln).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_produces_valid_distribution() {
        let logits = vec![1.0, 2.0, 3.0];
        let probs = softmax(&logits);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs.iter().all(|&p| p >= 0.0));
        assert!(probs[2] > probs[1]);
        assert!(probs[1] > probs[0]);
    }

    #[test]
    fn softmax_gives_masked_entries_zero_mass() {
        let probs = softmax(&[0.0, f32::NEG_INFINITY, 0.0]);
        assert_eq!(probs[1], 0.0);
        assert!((probs[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn softmax_of_fully_masked_row_is_zero() {
        let probs = softmax(&[f32::NEG_INFINITY; 3]);
        assert_eq!(probs, vec![0.0; 3]);
    }

    #[test]
    fn log_softmax_exponentiates_to_one() {
        let lp = log_softmax(&[0.5, -1.0, 2.0, 0.0]);
        let sum: f32 = lp.iter().map(|x| x.exp()).sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(lp.iter().all(|&x| x <= 0.0));
    }

    #[test]
    fn log_softmax_is_shift_invariant() {
        let a = log_softmax(&[1.0, 2.0, 3.0]);
        let b = log_softmax(&[101.0, 102.0, 103.0]);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-4);
        }
    }
}
