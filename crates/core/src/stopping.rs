//! Per-sequence termination: length, EOS token and stop sequences.

use regex::Regex;

use crate::error::SamplingError;
use crate::request::{FinishReason, StoppingCriteriaParameters};

/// Context kept in the text buffer when no stop sequence is longer.
const MIN_RETAINED_CHARS: usize = 200;
/// Slack allowed past the retained context before the buffer is truncated.
const TRUNCATE_SLACK_CHARS: usize = 100;

/// A literal stop string matched at the end of the generated text.
#[derive(Debug, Clone)]
pub struct StopSequenceCriteria {
    regex: Regex,
    char_len: usize,
}

impl StopSequenceCriteria {
    pub fn new(stop_sequence: &str) -> Result<Self, SamplingError> {
        let regex = Regex::new(&format!("{}$", regex::escape(stop_sequence)))?;
        Ok(Self {
            regex,
            char_len: stop_sequence.chars().count(),
        })
    }

    pub fn matches(&self, output: &str) -> bool {
        self.regex.is_match(output)
    }

    /// Length of the stop string in chars.
    pub fn char_len(&self) -> usize {
        self.char_len
    }
}

/// Termination state machine for one sequence, stepped once per token.
#[derive(Debug, Clone)]
pub struct StoppingCriteria {
    eos_token_id: u32,
    stop_sequence_criterias: Vec<StopSequenceCriteria>,
    max_new_tokens: u32,
    ignore_eos_token: bool,
    current_tokens: u32,
    current_output: String,
    retained_chars: usize,
    finish_reason: Option<FinishReason>,
}

impl StoppingCriteria {
    pub fn new(
        eos_token_id: u32,
        stop_sequence_criterias: Vec<StopSequenceCriteria>,
        max_new_tokens: u32,
        ignore_eos_token: bool,
    ) -> Self {
        let retained_chars = stop_sequence_criterias
            .iter()
            .map(StopSequenceCriteria::char_len)
            .fold(MIN_RETAINED_CHARS, usize::max);
        Self {
            eos_token_id,
            stop_sequence_criterias,
            max_new_tokens,
            ignore_eos_token,
            current_tokens: 0,
            current_output: String::new(),
            retained_chars,
            finish_reason: None,
        }
    }

    pub fn from_params(
        params: &StoppingCriteriaParameters,
        eos_token_id: u32,
    ) -> Result<Self, SamplingError> {
        let stop_sequence_criterias = params
            .stop_sequences
            .iter()
            .map(|s| StopSequenceCriteria::new(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(
            eos_token_id,
            stop_sequence_criterias,
            params.max_new_tokens,
            params.ignore_eos_token,
        ))
    }

    /// Account for one produced token and its decoded text fragment.
    ///
    /// Returns the finish reason once the sequence terminates. Stepping a
    /// finished sequence is an error.
    pub fn check(
        &mut self,
        last_token: u32,
        last_output: &str,
    ) -> Result<Option<FinishReason>, SamplingError> {
        if let Some(reason) = self.finish_reason {
            return Err(SamplingError::AlreadyFinished { reason });
        }
        let reason = self.evaluate(last_token, last_output);
        if let Some(reason) = reason {
            tracing::trace!(
                ?reason,
                generated_tokens = self.current_tokens,
                "sequence finished"
            );
        }
        self.finish_reason = reason;
        Ok(reason)
    }

    fn evaluate(&mut self, last_token: u32, last_output: &str) -> Option<FinishReason> {
        self.current_tokens += 1;
        if self.current_tokens >= self.max_new_tokens {
            return Some(FinishReason::Length);
        }

        if !self.ignore_eos_token && last_token == self.eos_token_id {
            return Some(FinishReason::EosToken);
        }

        if self.stop_sequence_criterias.is_empty() {
            return None;
        }
        self.current_output.push_str(last_output);
        self.truncate_output();
        self.stop_sequence_criterias
            .iter()
            .any(|criteria| criteria.matches(&self.current_output))
            .then_some(FinishReason::StopSequence)
    }

    fn truncate_output(&mut self) {
        let chars = self.current_output.chars().count();
        if chars <= self.retained_chars + TRUNCATE_SLACK_CHARS {
            return;
        }
        let skip = chars - self.retained_chars;
        if let Some((start, _)) = self.current_output.char_indices().nth(skip) {
            self.current_output.drain(..start);
        }
    }

    pub fn current_tokens(&self) -> u32 {
        self.current_tokens
    }

    pub fn current_output(&self) -> &str {
        &self.current_output
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}
