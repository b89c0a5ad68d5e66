//! Shared inference accounting types.

use serde::{Deserialize, Serialize};

/// Completion-token ceiling per request. The proposer model does not need the
/// full context window for output; this bounds runaway generations.
pub const MAX_COMPLETION_TOKENS: u32 = 16_384;

/// Token usage reported by the inference service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Accumulate usage across the turns of a session.
pub fn merge_usage(a: Option<Usage>, b: Option<Usage>) -> Option<Usage> {
    match (a, b) {
        (None, None) => None,
        (Some(u), None) | (None, Some(u)) => Some(u),
        (Some(a), Some(b)) => Some(Usage {
            prompt_tokens: a.prompt_tokens + b.prompt_tokens,
            completion_tokens: a.completion_tokens + b.completion_tokens,
            total_tokens: a.total_tokens + b.total_tokens,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adds_component_counts() {
        let a = Usage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
        };
        let b = Usage {
            prompt_tokens: 50,
            completion_tokens: 5,
            total_tokens: 55,
        };
        let merged = merge_usage(Some(a), Some(b)).unwrap();
        assert_eq!(merged.prompt_tokens, 150);
        assert_eq!(merged.total_tokens, 175);
    }

    #[test]
    fn merge_passes_through_single_side() {
        let a = Usage {
            prompt_tokens: 10,
            completion_tokens: 1,
            total_tokens: 11,
        };
        assert_eq!(merge_usage(Some(a), None).unwrap().total_tokens, 11);
        assert!(merge_usage(None, None).is_none());
    }
}
