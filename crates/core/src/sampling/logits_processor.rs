//! Logit transforms applied before token selection.
//!
//! Row-level functions transform one score vector in place. The heterogeneous
//! wrappers hold a [`RowMap`] of only the rows they touch, so a transform that
//! is configured for no retained row disappears on filter.
//!
//! Filtered-out entries are set to `-inf`.

use std::collections::HashSet;

use crate::request::NextTokenChooserParameters;

use super::rows::RowMap;
use super::{log_softmax, softmax};

/// Scale down scores of tokens already present in `history`.
///
/// Each distinct token is penalized once: negative scores are multiplied by
/// `penalty`, the rest divided by it.
pub fn apply_repetition_penalty(scores: &mut [f32], history: &[u32], penalty: f32) {
    let mut seen = HashSet::with_capacity(history.len());
    for &token_id in history {
        let idx = token_id as usize;
        if idx >= scores.len() || !seen.insert(idx) {
            continue;
        }
        let score = scores[idx];
        scores[idx] = if score < 0.0 {
            score * penalty
        } else {
            score / penalty
        };
    }
}

/// Whether `penalty` changes anything. Non-positive and non-finite penalties
/// are treated as disabled.
pub fn repetition_penalty_is_active(penalty: f32) -> bool {
    penalty.is_finite() && penalty > 0.0 && penalty != 1.0
}

pub fn apply_temperature(scores: &mut [f32], temperature: f32) {
    for score in scores.iter_mut() {
        *score /= temperature;
    }
}

/// Keep scores at or above the k-th largest. `k` is clamped to the vocabulary.
pub fn apply_top_k(scores: &mut [f32], top_k: usize) {
    if top_k == 0 || top_k >= scores.len() {
        return;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let kth = sorted[top_k - 1];
    for score in scores.iter_mut() {
        if *score < kth {
            *score = f32::NEG_INFINITY;
        }
    }
}

/// Nucleus filtering.
///
/// Walking from the least likely token upwards, every token whose cumulative
/// probability stays at or below `1 - top_p` is removed. The most likely token
/// always survives.
pub fn apply_top_p(scores: &mut [f32], top_p: f32) {
    if scores.is_empty() {
        return;
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
    let sorted: Vec<f32> = order.iter().map(|&i| scores[i]).collect();
    let probs = softmax(&sorted);

    let threshold = 1.0 - top_p;
    let last = order.len() - 1;
    let mut cumsum = 0.0f32;
    for (pos, &idx) in order.iter().enumerate() {
        cumsum += probs[pos];
        if pos == last || cumsum > threshold {
            break;
        }
        scores[idx] = f32::NEG_INFINITY;
    }
}

/// Typical sampling: keep tokens whose information content is closest to the
/// distribution entropy until `mass` probability is covered.
///
/// Reference: Meister et al. "Typical Decoding for Natural Language Generation"
/// https://arxiv.org/abs/2202.00666
pub fn apply_typical_p(scores: &mut [f32], mass: f32) {
    if scores.is_empty() {
        return;
    }
    let normalized = log_softmax(scores);
    let entropy: f32 = -normalized
        .iter()
        .map(|&lp| lp * lp.exp())
        .filter(|v| !v.is_nan())
        .sum::<f32>();
    let shifted: Vec<f32> = normalized.iter().map(|&lp| (-lp - entropy).abs()).collect();

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| shifted[a].total_cmp(&shifted[b]));
    let sorted_logits: Vec<f32> = order.iter().map(|&i| scores[i]).collect();
    let probs = softmax(&sorted_logits);

    let mut cumsum = 0.0f32;
    let mut last_ind = 0usize;
    for &p in &probs {
        cumsum += p;
        if cumsum >= mass {
            break;
        }
        last_ind += 1;
    }
    let cutoff = shifted[order[last_ind.min(order.len() - 1)]];

    for (score, &deviation) in scores.iter_mut().zip(&shifted) {
        if deviation > cutoff {
            *score = f32::NEG_INFINITY;
        }
    }
}

/// Repetition penalty across a batch, keyed by row.
#[derive(Debug, Clone)]
pub struct HeterogeneousRepetitionPenalty {
    penalties: RowMap<f32>,
}

impl HeterogeneousRepetitionPenalty {
    /// `None` when no penalty is active.
    pub fn new(penalties: &[f32]) -> Option<Self> {
        let penalties: RowMap<f32> = penalties
            .iter()
            .enumerate()
            .filter(|(_, &p)| repetition_penalty_is_active(p))
            .map(|(row, &p)| (row, p))
            .collect();
        (!penalties.is_empty()).then_some(Self { penalties })
    }

    pub fn rows(&self) -> usize {
        self.penalties.len()
    }

    pub fn apply(&self, histories: &[Vec<u32>], rows: &mut [Vec<f32>]) {
        for (row, &penalty) in self.penalties.iter() {
            if let (Some(scores), Some(history)) = (rows.get_mut(row), histories.get(row)) {
                apply_repetition_penalty(scores, history, penalty);
            }
        }
    }

    pub fn filter(self, retained: &[usize]) -> Option<Self> {
        let penalties = self.penalties.compact(retained);
        (!penalties.is_empty()).then_some(Self { penalties })
    }
}

/// Distribution-reshaping transforms, listed in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarperKind {
    Temperature,
    TopK,
    TopP,
    TypicalP,
}

impl WarperKind {
    pub const ORDER: [WarperKind; 4] = [
        WarperKind::Temperature,
        WarperKind::TopK,
        WarperKind::TopP,
        WarperKind::TypicalP,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::TopK => "top_k",
            Self::TopP => "top_p",
            Self::TypicalP => "typical_p",
        }
    }

    /// This warper's parameter for a request. `top_k` is carried as f32.
    pub fn value_of(self, params: &NextTokenChooserParameters) -> f32 {
        match self {
            Self::Temperature => params.temperature,
            Self::TopK => params.top_k as f32,
            Self::TopP => params.top_p,
            Self::TypicalP => params.typical_p,
        }
    }

    /// Whether `value` changes anything.
    pub fn is_active(self, value: f32) -> bool {
        match self {
            Self::Temperature => value != 1.0,
            Self::TopK => value != 0.0,
            Self::TopP | Self::TypicalP => value < 1.0,
        }
    }

    pub fn apply(self, scores: &mut [f32], value: f32) {
        match self {
            Self::Temperature => apply_temperature(scores, value),
            Self::TopK => apply_top_k(scores, value as usize),
            Self::TopP => apply_top_p(scores, value),
            Self::TypicalP => apply_typical_p(scores, value),
        }
    }
}

/// One warper kind applied across a batch, keyed by row.
#[derive(Debug, Clone)]
pub struct HeterogeneousWarper {
    kind: WarperKind,
    values: RowMap<f32>,
}

impl HeterogeneousWarper {
    /// `None` when `values` leave every row unchanged.
    pub fn new(kind: WarperKind, values: &[f32]) -> Option<Self> {
        let values: RowMap<f32> = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| kind.is_active(v))
            .map(|(row, &v)| (row, v))
            .collect();
        (!values.is_empty()).then_some(Self { kind, values })
    }

    pub fn kind(&self) -> WarperKind {
        self.kind
    }

    pub fn rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.values.iter().map(|(row, _)| row)
    }

    pub fn apply(&self, rows: &mut [Vec<f32>]) {
        for (row, &value) in self.values.iter() {
            if let Some(scores) = rows.get_mut(row) {
                self.kind.apply(scores, value);
            }
        }
    }

    pub fn filter(self, retained: &[usize]) -> Option<Self> {
        let values = self.values.compact(retained);
        (!values.is_empty()).then_some(Self {
            kind: self.kind,
            values,
        })
    }
}

/// The warpers configured for a single request.
#[derive(Debug, Clone, Default)]
pub struct StaticWarper {
    warpers: Vec<(WarperKind, f32)>,
}

impl StaticWarper {
    /// `None` when the request configures no active warper.
    pub fn from_params(params: &NextTokenChooserParameters) -> Option<Self> {
        let warpers: Vec<(WarperKind, f32)> = WarperKind::ORDER
            .into_iter()
            .map(|kind| (kind, kind.value_of(params)))
            .filter(|&(kind, value)| kind.is_active(value))
            .collect();
        (!warpers.is_empty()).then_some(Self { warpers })
    }

    pub fn apply(&self, scores: &mut [f32]) {
        for &(kind, value) in &self.warpers {
            kind.apply(scores, value);
        }
    }
}
