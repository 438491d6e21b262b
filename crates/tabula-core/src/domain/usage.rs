//! Usage counters reported by the inference service.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Request and token counters, summed across every call of a Task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Usage of a single successful call.
    pub fn single(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            requests: 1,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// A call that produced no token accounting (transport failure).
    pub fn request_only() -> Self {
        Self {
            requests: 1,
            ..Self::default()
        }
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            requests: self.requests + rhs.requests,
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total += Usage::single(100, 20);
        total += Usage::request_only();
        total += Usage::single(50, 5);

        assert_eq!(total.requests, 3);
        assert_eq!(total.prompt_tokens, 150);
        assert_eq!(total.completion_tokens, 25);
        assert_eq!(total.total_tokens, 175);
    }
}
