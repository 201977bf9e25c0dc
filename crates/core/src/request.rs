use serde::Deserialize;

/// Why a sequence stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Length,
    EosToken,
    StopSequence,
}

/// Per-request token selection parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NextTokenChooserParameters {
    pub watermark: bool,
    /// Logit divisor. 1.0 = disabled.
    pub temperature: f32,
    /// Penalty for tokens already in the history. 1.0 = disabled.
    pub repetition_penalty: f32,
    /// Top-K filtering. 0 = disabled.
    pub top_k: u32,
    /// Nucleus threshold (0..1]. 1.0 = disabled.
    pub top_p: f32,
    /// Typical sampling mass (0..1]. 1.0 = disabled.
    pub typical_p: f32,
    pub do_sample: bool,
    pub seed: u64,
}

impl Default for NextTokenChooserParameters {
    fn default() -> Self {
        Self {
            watermark: false,
            temperature: 1.0,
            repetition_penalty: 1.0,
            top_k: 0,
            top_p: 1.0,
            typical_p: 1.0,
            do_sample: false,
            seed: 0,
        }
    }
}

impl NextTokenChooserParameters {
    /// Whether any distribution-reshaping warper is configured.
    pub fn has_warpers(&self) -> bool {
        self.temperature != 1.0 || self.top_k != 0 || self.top_p < 1.0 || self.typical_p < 1.0
    }

    /// Effective sampling flag: any warper implies sampling.
    pub fn samples(&self) -> bool {
        self.do_sample || self.has_warpers()
    }
}

/// Per-request termination parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StoppingCriteriaParameters {
    pub max_new_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub ignore_eos_token: bool,
}

impl Default for StoppingCriteriaParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: 20,
            stop_sequences: Vec::new(),
            ignore_eos_token: false,
        }
    }
}
