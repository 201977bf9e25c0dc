//! N-gram self-speculation.
//!
//! Proposes, for each sequence, the tokens that followed the most recent
//! earlier occurrence of its last accepted token. Wrong guesses are rejected
//! by the next step's validation.

/// Propose `speculate` tokens per sequence.
///
/// `next_ids` holds the accepted tokens of the current step, flattened in
/// sequence order with `accepted_ids[i]` entries for sequence `i`.
/// `history` is each sequence's token history before this step.
pub fn create_n_gram_speculation(
    history: &[Vec<u32>],
    next_ids: &[u32],
    accepted_ids: &[u32],
    speculate: usize,
) -> Vec<Vec<u32>> {
    let mut offset = 0usize;
    history
        .iter()
        .zip(accepted_ids)
        .map(|(tokens, &accepted)| {
            offset += accepted as usize;
            let seed = offset
                .checked_sub(1)
                .and_then(|last| next_ids.get(last))
                .copied()
                .unwrap_or_default();
            propose(tokens, seed, speculate)
        })
        .collect()
}

fn propose(tokens: &[u32], seed: u32, speculate: usize) -> Vec<u32> {
    let Some(last) = tokens.len().checked_sub(1) else {
        return vec![seed; speculate];
    };
    let start = match tokens.iter().rposition(|&t| t == seed) {
        Some(pos) => pos + 1,
        None => tokens.len().saturating_sub(speculate),
    };
    (0..speculate).map(|k| tokens[(start + k).min(last)]).collect()
}
