//! Green-list watermarking.
//!
//! The previous token seeds a permutation of the vocabulary; the first
//! `gamma` fraction of that permutation is the green list, whose scores are
//! raised by `delta`. A detector with the same key can later recount green
//! tokens without access to the model.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::WatermarkConfig;

use super::rows::RowMap;

#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkProcessor {
    gamma: f32,
    delta: f32,
    hash_key: u64,
}

impl WatermarkProcessor {
    pub fn new(config: &WatermarkConfig) -> Self {
        Self {
            gamma: config.gamma,
            delta: config.delta,
            hash_key: config.hash_key,
        }
    }

    /// Green-listed token ids following `prev_token`.
    pub fn greenlist(&self, prev_token: u32, vocab_size: usize) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(self.hash_key.wrapping_mul(u64::from(prev_token)));
        let mut permutation: Vec<usize> = (0..vocab_size).collect();
        permutation.shuffle(&mut rng);
        permutation.truncate((vocab_size as f32 * self.gamma) as usize);
        permutation
    }

    /// Bias `scores` toward the green list. No-op on an empty history.
    pub fn apply(&self, history: &[u32], scores: &mut [f32]) {
        let Some(&prev_token) = history.last() else {
            return;
        };
        for token_id in self.greenlist(prev_token, scores.len()) {
            scores[token_id] += self.delta;
        }
    }
}

/// Watermarking for the rows that requested it.
#[derive(Debug, Clone)]
pub struct HeterogeneousWatermark {
    processors: RowMap<WatermarkProcessor>,
}

impl HeterogeneousWatermark {
    /// `None` when no row is watermarked.
    pub fn new(watermark: &[bool], config: &WatermarkConfig) -> Option<Self> {
        let processors: RowMap<WatermarkProcessor> = watermark
            .iter()
            .enumerate()
            .filter(|(_, &w)| w)
            .map(|(row, _)| (row, WatermarkProcessor::new(config)))
            .collect();
        (!processors.is_empty()).then_some(Self { processors })
    }

    pub fn rows(&self) -> usize {
        self.processors.len()
    }

    pub fn apply(&self, histories: &[Vec<u32>], rows: &mut [Vec<f32>]) {
        for (row, processor) in self.processors.iter() {
            if let (Some(scores), Some(history)) = (rows.get_mut(row), histories.get(row)) {
                processor.apply(history, scores);
            }
        }
    }

    pub fn filter(self, retained: &[usize]) -> Option<Self> {
        let processors = self.processors.compact(retained);
        (!processors.is_empty()).then_some(Self { processors })
    }
}
