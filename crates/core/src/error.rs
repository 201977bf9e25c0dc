use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid filter index {index} for batch of {batch_size}")]
    InvalidFilter { index: usize, batch_size: usize },

    #[error("stopping criteria stepped after finishing with {reason:?}")]
    AlreadyFinished { reason: crate::request::FinishReason },

    #[error("stop sequence error: {0}")]
    StopSequence(#[from] regex::Error),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::FinishReason;

    #[test]
    fn error_display_invalid_filter() {
        let e = SamplingError::InvalidFilter {
            index: 7,
            batch_size: 3,
        };
        assert_eq!(e.to_string(), "invalid filter index 7 for batch of 3");
    }

    #[test]
    fn error_display_shape_mismatch() {
        let e = SamplingError::ShapeMismatch("expected 4 rows, got 3".to_string());
        assert_eq!(e.to_string(), "shape mismatch: expected 4 rows, got 3");
    }

    #[test]
    fn error_display_already_finished() {
        let e = SamplingError::AlreadyFinished {
            reason: FinishReason::Length,
        };
        assert_eq!(
            e.to_string(),
            "stopping criteria stepped after finishing with Length"
        );
    }
}
