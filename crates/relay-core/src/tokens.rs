use serde::{Deserialize, Serialize};

/// Token usage reported by the backend for one round, or summed over many.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_sums_every_field() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
            cached_tokens: 50,
            reasoning_tokens: 5,
        });
        total.accumulate(&TokenUsage {
            input_tokens: 10,
            output_tokens: 2,
            cached_tokens: 0,
            reasoning_tokens: 1,
        });
        assert_eq!(total.input_tokens, 110);
        assert_eq!(total.output_tokens, 22);
        assert_eq!(total.cached_tokens, 50);
        assert_eq!(total.reasoning_tokens, 6);
        assert_eq!(total.total(), 132);
    }

    #[test]
    fn missing_optional_fields_default_to_zero() {
        let usage: TokenUsage =
            serde_json::from_str(r#"{"input_tokens": 3, "output_tokens": 4}"#).unwrap();
        assert_eq!(usage.cached_tokens, 0);
        assert_eq!(usage.total(), 7);
    }
}
