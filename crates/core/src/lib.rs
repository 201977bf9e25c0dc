//! Token selection and stopping for batched text generation.
//!
//! Given per-step score tensors from a model forward pass, this crate picks
//! the next token for every sequence in a batch (greedy or seeded sampling,
//! after per-request logit transforms), validates and proposes speculative
//! tokens, extracts top-n log-probabilities and decides when each sequence
//! stops.

pub mod config;
pub mod error;
pub mod request;
pub mod sampling;
pub mod spec_decode;
pub mod stopping;

pub use config::WatermarkConfig;
pub use error::SamplingError;
pub use request::{FinishReason, NextTokenChooserParameters, StoppingCriteriaParameters};
pub use sampling::{
    batch_top_tokens, HeterogeneousNextTokenChooser, NextTokenChooser, NextTokens, TopTokens,
};
pub use stopping::{StopSequenceCriteria, StoppingCriteria};
