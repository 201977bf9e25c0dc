//! Speculative decoding: accepting proposed tokens and proposing the next ones.
//!
//! A step scores `S = 1 + k` positions per sequence, where the last `k`
//! positions were conditioned on proposed tokens. The first chosen token is
//! always valid; each following position is valid only while the token chosen
//! one position earlier equals the token that was proposed there.
//!
//! Proposals for the next step come either from auxiliary speculative scores
//! (argmax per head) or from [`create_n_gram_speculation`].

mod ngram;

pub use ngram::create_n_gram_speculation;

use candle_core::{DType, Tensor};

use crate::error::SamplingError;
use crate::sampling::argmax;

/// Outcome of validating one step's proposed tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acceptance {
    /// Accepted tokens per sequence, always at least 1.
    pub accepted_ids: Vec<u32>,
    /// Flat row indices (`i * S + j`) of every accepted position, in order.
    pub indices: Vec<usize>,
}

impl Acceptance {
    pub fn total(&self) -> usize {
        self.indices.len()
    }
}

/// Validate `next_ids` (`[B * S]`) against `speculated_ids` (`B` rows of `S - 1`).
pub fn validate_speculation(
    next_ids: &[u32],
    speculated_ids: &[Vec<u32>],
) -> Result<Acceptance, SamplingError> {
    let batch_size = speculated_ids.len();
    let positions = speculated_ids.first().map_or(0, Vec::len) + 1;
    if next_ids.len() != batch_size * positions {
        return Err(SamplingError::ShapeMismatch(format!(
            "{} chosen ids for {batch_size} sequences of {positions} positions",
            next_ids.len()
        )));
    }

    let mut accepted_ids = Vec::with_capacity(batch_size);
    let mut indices = Vec::with_capacity(next_ids.len());
    for (i, proposed) in speculated_ids.iter().enumerate() {
        let start = i * positions;
        let chosen = &next_ids[start..start + positions];
        let matching = chosen[..positions - 1]
            .iter()
            .zip(proposed)
            .take_while(|(c, p)| c == p)
            .count();
        accepted_ids.push(1 + matching as u32);
        indices.extend(start..=start + matching);
    }
    Ok(Acceptance {
        accepted_ids,
        indices,
    })
}

/// Next proposals from auxiliary speculative scores.
///
/// `speculative_scores` is `[B * S, speculate, vocab]`; for each sequence the
/// row of its last accepted position is decoded greedily into `speculate`
/// tokens. A `[B, speculate, vocab]` tensor is taken as already gathered.
pub fn speculative_argmax(
    speculative_scores: &Tensor,
    accepted_ids: &[u32],
    positions: usize,
    speculate: usize,
) -> Result<Vec<Vec<u32>>, SamplingError> {
    let (rows, depth, _vocab) = speculative_scores.dims3()?;
    if depth != speculate {
        return Err(SamplingError::ShapeMismatch(format!(
            "speculative scores have {depth} heads, expected {speculate}"
        )));
    }
    let batch_size = accepted_ids.len();
    let last_accepted: Vec<u32> = if rows == batch_size * positions {
        accepted_ids
            .iter()
            .enumerate()
            .map(|(i, &accepted)| (i * positions) as u32 + accepted.saturating_sub(1))
            .collect()
    } else if rows == batch_size {
        // Already one row per sequence.
        (0..batch_size as u32).collect()
    } else {
        return Err(SamplingError::ShapeMismatch(format!(
            "{rows} speculative score rows for {batch_size} sequences of {positions} positions"
        )));
    };
    let index = Tensor::from_vec(last_accepted, batch_size, speculative_scores.device())?;
    let selected: Vec<Vec<Vec<f32>>> = speculative_scores
        .index_select(&index, 0)?
        .to_dtype(DType::F32)?
        .to_vec3()?;
    Ok(selected
        .iter()
        .map(|heads| heads.iter().map(|scores| argmax(scores)).collect())
        .collect())
}
