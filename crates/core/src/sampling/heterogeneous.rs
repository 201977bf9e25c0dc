//! Batched token selection with per-row configuration.
//!
//! Every transform runs over the whole batch and is a no-op for rows it was
//! not configured for. Rows that leave the batch are removed with
//! [`HeterogeneousNextTokenChooser::filter`], which renumbers surviving rows
//! and moves their state (including sampling generators) along with them.

use std::borrow::Cow;

use candle_core::{DType, Device, Tensor, D};

use crate::config::WatermarkConfig;
use crate::error::SamplingError;
use crate::request::NextTokenChooserParameters;
use crate::spec_decode::{
    create_n_gram_speculation, speculative_argmax, validate_speculation, Acceptance,
};

use super::logits_processor::{HeterogeneousRepetitionPenalty, HeterogeneousWarper, WarperKind};
use super::rows::validate_filter_indices;
use super::selector::{Greedy, TokenSelector};
use super::watermark::HeterogeneousWatermark;

/// Result of one decoding step.
#[derive(Debug, Clone)]
pub struct NextTokens {
    /// Accepted token ids, `accepted_ids[i]` of them per sequence, in order.
    pub next_ids: Vec<u32>,
    /// Log-probability of each accepted token.
    pub next_logprobs: Vec<f32>,
    /// Full log-probability rows for the accepted positions, `[next_ids.len(), vocab]`.
    pub logprobs: Tensor,
    /// Accepted positions per sequence (1 without speculation).
    pub accepted_ids: Vec<u32>,
    /// Proposals for the next step, `speculate` tokens per sequence.
    pub speculative_ids: Option<Vec<Vec<u32>>>,
}

/// Per-row transforms and selection for a whole batch.
#[derive(Debug)]
pub struct HeterogeneousNextTokenChooser {
    dtype: DType,
    device: Device,
    watermark_processor: Option<HeterogeneousWatermark>,
    repetition_processor: Option<HeterogeneousRepetitionPenalty>,
    warpers: Vec<HeterogeneousWarper>,
    choice: TokenSelector,
    seeds: Vec<u64>,
    do_sample: Vec<bool>,
}

impl HeterogeneousNextTokenChooser {
    pub fn from_params(
        params: &[NextTokenChooserParameters],
        watermark: &WatermarkConfig,
        dtype: DType,
        device: &Device,
    ) -> Self {
        let watermark_flags: Vec<bool> = params.iter().map(|p| p.watermark).collect();
        let penalties: Vec<f32> = params.iter().map(|p| p.repetition_penalty).collect();

        let warpers: Vec<HeterogeneousWarper> = WarperKind::ORDER
            .into_iter()
            .filter_map(|kind| {
                let values: Vec<f32> = params.iter().map(|p| kind.value_of(p)).collect();
                HeterogeneousWarper::new(kind, &values)
            })
            .collect();

        let do_sample: Vec<bool> = params.iter().map(NextTokenChooserParameters::samples).collect();
        let seeds: Vec<u64> = params.iter().map(|p| p.seed).collect();

        let chooser = Self {
            dtype,
            device: device.clone(),
            watermark_processor: HeterogeneousWatermark::new(&watermark_flags, watermark),
            repetition_processor: HeterogeneousRepetitionPenalty::new(&penalties),
            warpers,
            choice: TokenSelector::new(&do_sample, &seeds),
            seeds,
            do_sample,
        };
        tracing::debug!(
            batch_size = chooser.batch_size(),
            watermark = chooser.watermark_processor.is_some(),
            repetition_penalty = chooser.repetition_processor.is_some(),
            warpers = ?chooser.warper_kinds(),
            sampling_rows = chooser.do_sample.iter().filter(|&&s| s).count(),
            "built heterogeneous token chooser"
        );
        chooser
    }

    pub fn batch_size(&self) -> usize {
        self.seeds.len()
    }

    pub fn seeds(&self) -> &[u64] {
        &self.seeds
    }

    /// Effective sampling flag per row.
    pub fn do_sample(&self) -> &[bool] {
        &self.do_sample
    }

    pub fn is_greedy(&self) -> bool {
        self.choice.is_greedy()
    }

    /// Active warpers in application order.
    pub fn warper_kinds(&self) -> Vec<WarperKind> {
        self.warpers.iter().map(HeterogeneousWarper::kind).collect()
    }

    /// Run one decoding step.
    ///
    /// `scores` is `[B * S, vocab]` with `S = 1 + speculated width` (row
    /// `i * S + j` is position `j` of sequence `i`). `history` holds each
    /// sequence's tokens so far. When `speculate > 0`, proposals for the next
    /// step come from `speculative_scores` if given, otherwise from the n-gram
    /// heuristic.
    pub fn choose(
        &mut self,
        history: &[Vec<u32>],
        scores: &Tensor,
        speculate: usize,
        speculated_ids: Option<&[Vec<u32>]>,
        speculative_scores: Option<&Tensor>,
    ) -> Result<NextTokens, SamplingError> {
        let batch_size = self.batch_size();
        if history.len() != batch_size {
            return Err(SamplingError::ShapeMismatch(format!(
                "{} histories for a batch of {batch_size}",
                history.len()
            )));
        }
        let positions = speculation_positions(speculated_ids, batch_size)?;
        let (rows, vocab_size) = scores.dims2()?;
        if rows != batch_size * positions {
            return Err(SamplingError::ShapeMismatch(format!(
                "{rows} score rows for {batch_size} sequences of {positions} positions"
            )));
        }

        let mut data: Vec<Vec<f32>> = scores.to_dtype(DType::F32)?.to_vec2()?;
        let mut next_ids = vec![0u32; rows];
        for j in 0..positions {
            let mut position_scores: Vec<Vec<f32>> = (0..batch_size)
                .map(|i| std::mem::take(&mut data[i * positions + j]))
                .collect();
            let position_history = self.position_history(history, &next_ids, positions, j);

            if let Some(processor) = &self.watermark_processor {
                processor.apply(&position_history, &mut position_scores);
            }
            if let Some(processor) = &self.repetition_processor {
                processor.apply(&position_history, &mut position_scores);
            }
            for warper in &self.warpers {
                warper.apply(&mut position_scores);
            }

            let chosen = self.choice.choose(&position_scores);
            for (i, (row, id)) in position_scores.into_iter().zip(chosen).enumerate() {
                data[i * positions + j] = row;
                next_ids[i * positions + j] = id;
            }
        }

        let acceptance = match speculated_ids {
            Some(speculated) => validate_speculation(&next_ids, speculated)?,
            None => Acceptance {
                accepted_ids: vec![1; batch_size],
                indices: (0..batch_size).collect(),
            },
        };
        if positions > 1 {
            tracing::trace!(
                batch_size,
                positions,
                accepted = acceptance.total(),
                "validated speculative tokens"
            );
            next_ids = acceptance.indices.iter().map(|&i| next_ids[i]).collect();
            data = acceptance
                .indices
                .iter()
                .map(|&i| std::mem::take(&mut data[i]))
                .collect();
        }

        let accepted_rows = next_ids.len();
        let flat: Vec<f32> = data.into_iter().flatten().collect();
        let scores = Tensor::from_vec(flat, (accepted_rows, vocab_size), &self.device)?;
        let logprobs = candle_nn::ops::log_softmax(&scores, D::Minus1)?;
        let index = Tensor::from_vec(next_ids.clone(), (accepted_rows, 1), &self.device)?;
        let next_logprobs: Vec<f32> = logprobs.gather(&index, 1)?.squeeze(1)?.to_vec1()?;

        let speculative_ids = if speculate > 0 {
            Some(match speculative_scores {
                Some(spec_scores) => {
                    speculative_argmax(
                        spec_scores,
                        &acceptance.accepted_ids,
                        positions,
                        speculate,
                    )?
                }
                None => create_n_gram_speculation(
                    history,
                    &next_ids,
                    &acceptance.accepted_ids,
                    speculate,
                ),
            })
        } else {
            None
        };

        Ok(NextTokens {
            next_ids,
            next_logprobs,
            logprobs: logprobs.to_dtype(self.dtype)?,
            accepted_ids: acceptance.accepted_ids,
            speculative_ids,
        })
    }

    /// History seen by position `j`: the step's history plus the tokens chosen
    /// at earlier positions of the same sequence.
    fn position_history<'a>(
        &self,
        history: &'a [Vec<u32>],
        next_ids: &[u32],
        positions: usize,
        j: usize,
    ) -> Cow<'a, [Vec<u32>]> {
        let history_dependent =
            self.watermark_processor.is_some() || self.repetition_processor.is_some();
        if j == 0 || !history_dependent {
            return Cow::Borrowed(history);
        }
        Cow::Owned(
            history
                .iter()
                .enumerate()
                .map(|(i, tokens)| {
                    let mut extended = tokens.clone();
                    extended.extend_from_slice(&next_ids[i * positions..i * positions + j]);
                    extended
                })
                .collect(),
        )
    }

    /// Keep only `retained` rows, renumbered densely in the given order.
    ///
    /// `retained` must be strictly increasing and within the batch.
    pub fn filter(&mut self, retained: &[usize]) -> Result<(), SamplingError> {
        validate_filter_indices(retained, self.batch_size())?;

        self.watermark_processor = self
            .watermark_processor
            .take()
            .and_then(|processor| processor.filter(retained));
        self.repetition_processor = self
            .repetition_processor
            .take()
            .and_then(|processor| processor.filter(retained));

        let before = self.warpers.len();
        self.warpers = std::mem::take(&mut self.warpers)
            .into_iter()
            .filter_map(|warper| warper.filter(retained))
            .collect();
        if self.warpers.len() != before {
            tracing::debug!(
                dropped = before - self.warpers.len(),
                remaining = ?self.warper_kinds(),
                "dropped warpers with no retained rows"
            );
        }

        self.seeds = retained.iter().map(|&i| self.seeds[i]).collect();
        self.do_sample = retained.iter().map(|&i| self.do_sample[i]).collect();

        let any_sampling = self.do_sample.iter().any(|&s| s);
        self.choice = match std::mem::replace(&mut self.choice, TokenSelector::Greedy(Greedy)) {
            TokenSelector::Heterogeneous(sampling) if any_sampling => {
                TokenSelector::Heterogeneous(sampling.filter(retained))
            }
            TokenSelector::Heterogeneous(_) => {
                tracing::debug!(batch_size = retained.len(), "no sampling rows left, using greedy");
                TokenSelector::Greedy(Greedy)
            }
            greedy => greedy,
        };
        Ok(())
    }
}

fn speculation_positions(
    speculated_ids: Option<&[Vec<u32>]>,
    batch_size: usize,
) -> Result<usize, SamplingError> {
    let Some(speculated) = speculated_ids else {
        return Ok(1);
    };
    if speculated.len() != batch_size {
        return Err(SamplingError::ShapeMismatch(format!(
            "{} speculated rows for a batch of {batch_size}",
            speculated.len()
        )));
    }
    let width = speculated.first().map_or(0, Vec::len);
    if speculated.iter().any(|ids| ids.len() != width) {
        return Err(SamplingError::ShapeMismatch(
            "speculated ids have unequal lengths".to_string(),
        ));
    }
    Ok(width + 1)
}
