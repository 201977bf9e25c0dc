//! Token selection for a single request.

use candle_core::{DType, Tensor, D};

use crate::config::WatermarkConfig;
use crate::error::SamplingError;
use crate::request::NextTokenChooserParameters;

use super::logits_processor::{
    apply_repetition_penalty, repetition_penalty_is_active, StaticWarper,
};
use super::selector::{Greedy, Sampling};
use super::watermark::WatermarkProcessor;

#[derive(Debug, Clone)]
enum Choice {
    Greedy(Greedy),
    Sampling(Sampling),
}

/// Watermark, repetition penalty, warpers and selection for one sequence.
#[derive(Debug, Clone)]
pub struct NextTokenChooser {
    watermark_processor: Option<WatermarkProcessor>,
    repetition_penalty: Option<f32>,
    static_warper: Option<StaticWarper>,
    choice: Choice,
}

impl NextTokenChooser {
    pub fn from_params(params: &NextTokenChooserParameters, watermark: &WatermarkConfig) -> Self {
        let choice = if params.samples() {
            Choice::Sampling(Sampling::new(params.seed))
        } else {
            Choice::Greedy(Greedy)
        };
        Self {
            watermark_processor: params.watermark.then(|| WatermarkProcessor::new(watermark)),
            repetition_penalty: repetition_penalty_is_active(params.repetition_penalty)
                .then_some(params.repetition_penalty),
            static_warper: StaticWarper::from_params(params),
            choice,
        }
    }

    pub fn is_sampling(&self) -> bool {
        matches!(self.choice, Choice::Sampling(_))
    }

    /// Choose the next token from the last row of `scores` (`[positions, vocab]`).
    ///
    /// Returns the token id and the log-probabilities of every transformed row.
    pub fn choose(
        &mut self,
        history: &[u32],
        scores: &Tensor,
    ) -> Result<(u32, Tensor), SamplingError> {
        let (positions, vocab_size) = scores.dims2()?;
        if positions == 0 {
            return Err(SamplingError::ShapeMismatch(
                "scores have no rows".to_string(),
            ));
        }
        let dtype = scores.dtype();
        let device = scores.device().clone();
        let mut rows: Vec<Vec<f32>> = scores.to_dtype(DType::F32)?.to_vec2()?;

        if let (Some(processor), Some(last)) = (&self.watermark_processor, rows.last_mut()) {
            processor.apply(history, last);
        }
        for row in rows.iter_mut() {
            if let Some(penalty) = self.repetition_penalty {
                apply_repetition_penalty(row, history, penalty);
            }
            if let Some(warper) = &self.static_warper {
                warper.apply(row);
            }
        }

        let last = &rows[positions - 1];
        let next_id = match &mut self.choice {
            Choice::Greedy(greedy) => greedy.choose(last),
            Choice::Sampling(sampling) => sampling.choose(last),
        };

        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        let scores = Tensor::from_vec(flat, (positions, vocab_size), &device)?;
        let logprobs = candle_nn::ops::log_softmax(&scores, D::Minus1)?.to_dtype(dtype)?;
        Ok((next_id, logprobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scores(data: Vec<f32>, rows: usize) -> Tensor {
        let vocab = data.len() / rows;
        Tensor::from_vec(data, (rows, vocab), &Device::Cpu).unwrap()
    }

    #[test]
    fn default_params_fall_back_to_greedy_log_softmax() {
        let mut chooser =
            NextTokenChooser::from_params(&NextTokenChooserParameters::default(), &WatermarkConfig::default());
        assert!(!chooser.is_sampling());

        let logits = vec![1.0, 5.0, 3.0, 2.0];
        let (next_id, logprobs) = chooser.choose(&[], &scores(logits.clone(), 1)).unwrap();
        assert_eq!(next_id, 1);

        let expected = crate::sampling::log_softmax(&logits);
        let actual = logprobs.to_vec2::<f32>().unwrap();
        for (a, e) in actual[0].iter().zip(&expected) {
            assert!((a - e).abs() < 1e-5);
        }
    }

    #[test]
    fn selects_from_last_row() {
        let mut chooser =
            NextTokenChooser::from_params(&NextTokenChooserParameters::default(), &WatermarkConfig::default());
        let (next_id, logprobs) = chooser
            .choose(&[], &scores(vec![9.0, 0.0, 0.0, 0.0, 0.0, 9.0], 2))
            .unwrap();
        assert_eq!(next_id, 2);
        assert_eq!(logprobs.dims(), &[2, 3]);
    }

    #[test]
    fn warpers_imply_sampling() {
        let params = NextTokenChooserParameters {
            top_k: 1,
            ..Default::default()
        };
        let mut chooser = NextTokenChooser::from_params(&params, &WatermarkConfig::default());
        assert!(chooser.is_sampling());
        // top_k = 1 leaves a single candidate.
        for _ in 0..10 {
            let (next_id, logprobs) = chooser
                .choose(&[], &scores(vec![1.0, 3.0, 2.0, 0.5], 1))
                .unwrap();
            assert_eq!(next_id, 1);
            let lp = logprobs.to_vec2::<f32>().unwrap();
            assert!(lp[0][1].abs() < 1e-6);
            assert_eq!(lp[0][0], f32::NEG_INFINITY);
        }
    }

    #[test]
    fn zero_repetition_penalty_is_ignored() {
        let params = NextTokenChooserParameters {
            repetition_penalty: 0.0,
            ..Default::default()
        };
        let mut chooser = NextTokenChooser::from_params(&params, &WatermarkConfig::default());
        let logits = vec![4.0, 2.0, 0.0];
        let (next_id, logprobs) = chooser.choose(&[0], &scores(logits.clone(), 1)).unwrap();
        assert_eq!(next_id, 0);

        let expected = crate::sampling::log_softmax(&logits);
        let actual = logprobs.to_vec2::<f32>().unwrap();
        for (a, e) in actual[0].iter().zip(&expected) {
            assert!(a.is_finite());
            assert!((a - e).abs() < 1e-5);
        }
    }

    #[test]
    fn watermark_biases_only_the_last_row() {
        let params = NextTokenChooserParameters {
            watermark: true,
            ..Default::default()
        };
        let config = WatermarkConfig::default();
        let mut chooser = NextTokenChooser::from_params(&params, &config);
        let greenlist = WatermarkProcessor::new(&config).greenlist(9, 20);

        let (_, logprobs) = chooser.choose(&[5, 9], &scores(vec![0.0; 40], 2)).unwrap();
        let lp = logprobs.to_vec2::<f32>().unwrap();
        assert!(lp[0].iter().all(|&v| (v - lp[0][0]).abs() < 1e-6));

        let red = (0..20).find(|t| !greenlist.contains(t)).unwrap();
        for (token_id, &v) in lp[1].iter().enumerate() {
            let bias = if greenlist.contains(&token_id) { 2.0 } else { 0.0 };
            assert!((v - lp[1][red] - bias).abs() < 1e-4, "token {token_id}");
        }
    }

    #[test]
    fn watermark_runs_before_repetition_penalty() {
        let params = NextTokenChooserParameters {
            watermark: true,
            repetition_penalty: 2.0,
            ..Default::default()
        };
        let config = WatermarkConfig::default();
        let mut chooser = NextTokenChooser::from_params(&params, &config);
        let greenlist = WatermarkProcessor::new(&config).greenlist(9, 20);
        let penalized_green = greenlist.iter().copied().find(|&t| t != 9).unwrap();
        let red = (0..20)
            .find(|t| !greenlist.contains(t) && *t != 9)
            .unwrap();

        let history = [penalized_green as u32, 9];
        let (_, logprobs) = chooser.choose(&history, &scores(vec![0.0; 20], 1)).unwrap();
        let lp = logprobs.to_vec2::<f32>().unwrap();
        // (0 + delta) / penalty, rather than 0 / penalty + delta.
        assert!((lp[0][penalized_green] - lp[0][red] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn repetition_penalty_changes_greedy_choice() {
        let params = NextTokenChooserParameters {
            repetition_penalty: 4.0,
            ..Default::default()
        };
        let mut chooser = NextTokenChooser::from_params(&params, &WatermarkConfig::default());
        let (next_id, _) = chooser.choose(&[0], &scores(vec![4.0, 2.0, 0.0], 1)).unwrap();
        assert_eq!(next_id, 1);
    }

    #[test]
    fn seeded_choosers_agree() {
        let params = NextTokenChooserParameters {
            do_sample: true,
            seed: 17,
            ..Default::default()
        };
        let mut a = NextTokenChooser::from_params(&params, &WatermarkConfig::default());
        let mut b = NextTokenChooser::from_params(&params, &WatermarkConfig::default());
        let logits = scores(vec![0.0f32; 50], 1);
        for _ in 0..10 {
            assert_eq!(
                a.choose(&[], &logits).unwrap().0,
                b.choose(&[], &logits).unwrap().0
            );
        }
    }

    #[test]
    fn rejects_empty_scores() {
        let mut chooser =
            NextTokenChooser::from_params(&NextTokenChooserParameters::default(), &WatermarkConfig::default());
        let empty = Tensor::zeros((0, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            chooser.choose(&[], &empty),
            Err(SamplingError::ShapeMismatch(_))
        ));
    }
}
