use serde::{Deserialize, Serialize};

/// Accumulated token usage for a session or execution.
///
/// Mirrors the `message.usage` block of assistant records; deltas are summed
/// during the incremental parse and overwritten wholesale when a `result`
/// record carries the authoritative final usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_accumulates_all_fields() {
        let mut usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cache_read_input_tokens: 10,
            cache_creation_input_tokens: 5,
        };
        usage.add(&TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
            cache_read_input_tokens: 3,
            cache_creation_input_tokens: 4,
        });
        assert_eq!(usage.input_tokens, 101);
        assert_eq!(usage.output_tokens, 52);
        assert_eq!(usage.cache_read_input_tokens, 13);
        assert_eq!(usage.cache_creation_input_tokens, 9);
        assert_eq!(usage.total(), 175);
    }
}
