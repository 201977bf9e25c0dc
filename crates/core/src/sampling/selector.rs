//! Strategies that turn a row of scores into a token id.

use rand::distributions::Open01;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::rows::RowMap;
use super::softmax;

/// Index of the largest value; the lowest index wins ties and NaN is never
/// selected over a number.
pub fn argmax(values: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_value = f32::NAN;
    for (i, &value) in values.iter().enumerate() {
        if (best_value.is_nan() && !value.is_nan()) || value > best_value {
            best = i;
            best_value = value;
        }
    }
    best as u32
}

/// Deterministic argmax selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greedy;

impl Greedy {
    pub fn choose(&self, scores: &[f32]) -> u32 {
        argmax(scores)
    }

    pub fn choose_batch(&self, rows: &[Vec<f32>]) -> Vec<u32> {
        rows.iter().map(|row| argmax(row)).collect()
    }
}

/// Seeded multinomial sampling.
///
/// Draws one exponential variate per vocabulary entry and returns
/// `argmax(probs / q)`, which is distributed like a multinomial draw from
/// `probs` without a cumulative-sum pass. Every call consumes exactly
/// `scores.len()` draws, so the sequence of choices depends only on the seed
/// and the scores.
#[derive(Debug, Clone)]
pub struct Sampling {
    seed: u64,
    rng: StdRng,
}

impl Sampling {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn choose(&mut self, scores: &[f32]) -> u32 {
        let probs = softmax(scores);
        let ratios: Vec<f32> = probs
            .iter()
            .map(|&p| {
                let u: f32 = self.rng.sample(Open01);
                p / -u.ln()
            })
            .collect();
        argmax(&ratios)
    }
}

/// Mixed greedy and seeded sampling across batch rows.
#[derive(Debug, Clone)]
pub struct HeterogeneousSampling {
    greedy_indices: Vec<usize>,
    sampling_mapping: RowMap<Sampling>,
}

impl HeterogeneousSampling {
    pub fn new(do_sample: &[bool], seeds: &[u64]) -> Self {
        let mut greedy_indices = Vec::new();
        let mut sampling_mapping = RowMap::new();
        for (row, (&sample, &seed)) in do_sample.iter().zip(seeds).enumerate() {
            if sample {
                sampling_mapping.insert(row, Sampling::new(seed));
            } else {
                greedy_indices.push(row);
            }
        }
        Self {
            greedy_indices,
            sampling_mapping,
        }
    }

    pub fn greedy_indices(&self) -> &[usize] {
        &self.greedy_indices
    }

    pub fn sampling_rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.sampling_mapping.iter().map(|(row, _)| row)
    }

    pub fn choose(&mut self, rows: &[Vec<f32>]) -> Vec<u32> {
        // Argmax over every row is cheaper than picking out the greedy ones.
        let mut out = if self.greedy_indices.is_empty() {
            vec![0; rows.len()]
        } else {
            Greedy.choose_batch(rows)
        };
        for (row, sampling) in self.sampling_mapping.iter_mut() {
            if let Some(scores) = rows.get(row) {
                out[row] = sampling.choose(scores);
            }
        }
        out
    }

    /// Keep `retained` rows, carrying each survivor's generator forward.
    pub fn filter(self, retained: &[usize]) -> Self {
        let sampling_mapping = self.sampling_mapping.compact(retained);
        let greedy_indices = (0..retained.len())
            .filter(|&row| !sampling_mapping.contains(row))
            .collect();
        Self {
            greedy_indices,
            sampling_mapping,
        }
    }
}

/// Batch-level selector: pure greedy when no row samples.
#[derive(Debug, Clone)]
pub enum TokenSelector {
    Greedy(Greedy),
    Heterogeneous(HeterogeneousSampling),
}

impl TokenSelector {
    pub fn new(do_sample: &[bool], seeds: &[u64]) -> Self {
        if do_sample.iter().any(|&s| s) {
            Self::Heterogeneous(HeterogeneousSampling::new(do_sample, seeds))
        } else {
            Self::Greedy(Greedy)
        }
    }

    pub fn is_greedy(&self) -> bool {
        matches!(self, Self::Greedy(_))
    }

    pub fn choose(&mut self, rows: &[Vec<f32>]) -> Vec<u32> {
        match self {
            Self::Greedy(greedy) => greedy.choose_batch(rows),
            Self::Heterogeneous(sampling) => sampling.choose(rows),
        }
    }
}
