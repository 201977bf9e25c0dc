//! Top-N token extraction for response log-probabilities.

use candle_core::{DType, Tensor};

use crate::error::SamplingError;

/// Per-sequence token ids and their log-probabilities.
pub type TopTokens = (Vec<Vec<u32>>, Vec<Vec<f32>>);

/// Find the top-n most likely tokens for each sequence of a batch.
///
/// `top_n_tokens[i]` is clamped to the vocabulary; 0 yields an empty list.
/// When tokens tie at the n-th rank all of them are returned, so a list can
/// be longer than requested. Lists are sorted by descending log-probability,
/// lower token id first on equal values.
pub fn batch_top_tokens(top_n_tokens: &[u32], logprobs: &Tensor) -> Result<TopTokens, SamplingError> {
    let max_top_n = top_n_tokens.iter().copied().max().unwrap_or(0);
    if max_top_n == 0 {
        let batch_size = top_n_tokens.len();
        return Ok((vec![Vec::new(); batch_size], vec![Vec::new(); batch_size]));
    }

    let (rows, vocab_size) = logprobs.dims2()?;
    if rows != top_n_tokens.len() {
        return Err(SamplingError::ShapeMismatch(format!(
            "{} top-n requests for {rows} log-probability rows",
            top_n_tokens.len()
        )));
    }
    let data: Vec<Vec<f32>> = logprobs.to_dtype(DType::F32)?.to_vec2()?;

    let mut top_ids = Vec::with_capacity(rows);
    let mut top_values = Vec::with_capacity(rows);
    for (row, &requested) in data.iter().zip(top_n_tokens) {
        let n = (requested as usize).min(vocab_size);
        if n == 0 {
            top_ids.push(Vec::new());
            top_values.push(Vec::new());
            continue;
        }
        let (ids, values) = fuzzy_top_n(row, n);
        top_ids.push(ids);
        top_values.push(values);
    }
    Ok((top_ids, top_values))
}

fn fuzzy_top_n(row: &[f32], n: usize) -> (Vec<u32>, Vec<f32>) {
    let mut sorted = row.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let mut threshold = sorted[n - 1];
    // Fewer than n tokens carry probability: never include the -inf tail.
    if threshold == f32::NEG_INFINITY {
        threshold = f32::MIN;
    }

    let mut included: Vec<(u32, f32)> = row
        .iter()
        .enumerate()
        .filter(|(_, &lp)| lp >= threshold)
        .map(|(i, &lp)| (i as u32, lp))
        .collect();
    included.sort_by(|a, b| b.1.total_cmp(&a.1));
    included.into_iter().unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logprobs(rows: Vec<Vec<f32>>) -> Tensor {
        let vocab = rows[0].len();
        let n = rows.len();
        Tensor::from_vec(rows.concat(), (n, vocab), &Device::Cpu).unwrap()
    }

    #[test]
    fn all_zero_requests_return_empty_lists() {
        let lp = logprobs(vec![vec![-1.0, -2.0], vec![-0.5, -3.0]]);
        let (ids, values) = batch_top_tokens(&[0, 0], &lp).unwrap();
        assert_eq!(ids, vec![Vec::<u32>::new(), Vec::new()]);
        assert_eq!(values, vec![Vec::<f32>::new(), Vec::new()]);
    }

    #[test]
    fn returns_sorted_top_n() {
        let lp = logprobs(vec![vec![-3.0, -0.5, -2.0, -1.0]]);
        let (ids, values) = batch_top_tokens(&[2], &lp).unwrap();
        assert_eq!(ids, vec![vec![1, 3]]);
        assert_eq!(values, vec![vec![-0.5, -1.0]]);
    }

    #[test]
    fn ties_at_boundary_are_all_included() {
        let lp = logprobs(vec![vec![-1.0, -2.0, -2.0, -2.0, -5.0]]);
        let (ids, values) = batch_top_tokens(&[2], &lp).unwrap();
        assert_eq!(ids, vec![vec![0, 1, 2, 3]]);
        assert_eq!(values[0].len(), 4);
        assert!(ids[0].len() >= 2);
    }

    #[test]
    fn zero_request_row_is_empty_next_to_active_row() {
        let lp = logprobs(vec![vec![-1.0, -1.0, -1.0], vec![-0.1, -2.0, -3.0]]);
        let (ids, _) = batch_top_tokens(&[0, 1], &lp).unwrap();
        assert!(ids[0].is_empty());
        assert_eq!(ids[1], vec![0]);
    }

    #[test]
    fn request_larger_than_vocab_is_clamped() {
        let lp = logprobs(vec![vec![-1.0, -0.5, -2.0]]);
        let (ids, values) = batch_top_tokens(&[10], &lp).unwrap();
        assert_eq!(ids, vec![vec![1, 0, 2]]);
        assert_eq!(values, vec![vec![-0.5, -1.0, -2.0]]);
    }

    #[test]
    fn neg_inf_threshold_excludes_masked_tokens() {
        let ninf = f32::NEG_INFINITY;
        let lp = logprobs(vec![vec![ninf, -0.1, ninf, -2.5]]);
        let (ids, values) = batch_top_tokens(&[3], &lp).unwrap();
        assert_eq!(ids, vec![vec![1, 3]]);
        assert!(values[0].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn mismatched_row_count_is_an_error() {
        let lp = logprobs(vec![vec![-1.0, -2.0]]);
        assert!(matches!(
            batch_top_tokens(&[1, 1], &lp),
            Err(SamplingError::ShapeMismatch(_))
        ));
    }
}
