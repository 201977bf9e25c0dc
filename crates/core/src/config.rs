use serde::Deserialize;

const DEFAULT_WATERMARK_GAMMA: f32 = 0.5;
const DEFAULT_WATERMARK_DELTA: f32 = 2.0;
const DEFAULT_WATERMARK_HASH_KEY: u64 = 15_485_863;

/// Green-list watermark parameters shared by every watermarked request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    /// Fraction of the vocabulary placed on the green list.
    pub gamma: f32,
    /// Bias added to green-listed scores.
    pub delta: f32,
    /// Multiplier applied to the previous token to seed the permutation.
    pub hash_key: u64,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            gamma: DEFAULT_WATERMARK_GAMMA,
            delta: DEFAULT_WATERMARK_DELTA,
            hash_key: DEFAULT_WATERMARK_HASH_KEY,
        }
    }
}

impl WatermarkConfig {
    /// Defaults overridden by `WATERMARK_GAMMA` / `WATERMARK_DELTA`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(gamma) = parse_var(&lookup, "WATERMARK_GAMMA") {
            config.gamma = gamma;
        }
        if let Some(delta) = parse_var(&lookup, "WATERMARK_DELTA") {
            config.delta = delta;
        }
        config
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<f32> {
    let raw = lookup(key)?;
    match raw.trim().parse::<f32>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring unparseable watermark setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let config = WatermarkConfig::default();
        assert_eq!(config.gamma, 0.5);
        assert_eq!(config.delta, 2.0);
        assert_eq!(config.hash_key, 15_485_863);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: WatermarkConfig = serde_json::from_str(r#"{"delta": 4.0}"#).unwrap();
        assert_eq!(config.delta, 4.0);
        assert_eq!(config.gamma, 0.5);
        assert_eq!(config.hash_key, 15_485_863);
    }

    #[test]
    fn lookup_overrides_gamma_and_delta() {
        let config = WatermarkConfig::from_lookup(|key| match key {
            "WATERMARK_GAMMA" => Some("0.25".to_string()),
            "WATERMARK_DELTA" => Some(" 1.5 ".to_string()),
            _ => None,
        });
        assert_eq!(config.gamma, 0.25);
        assert_eq!(config.delta, 1.5);
    }

    #[test]
    fn unparseable_lookup_falls_back_to_default() {
        let config = WatermarkConfig::from_lookup(|key| match key {
            "WATERMARK_GAMMA" => Some("half".to_string()),
            _ => None,
        });
        assert_eq!(config.gamma, 0.5);
    }
}
