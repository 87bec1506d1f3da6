//! Retry policy for failed keys.

use lineas_browser::FetchError;
use lineas_core::FailureKind;

/// What to do with a key after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the key back at the end of the queue
    Retry,
    /// Record the key as failed
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    final_kinds: Vec<FailureKind>,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: max_retries.max(1),
            final_kinds: Vec::new(),
        }
    }

    /// Failure kinds that end a key on the first occurrence.
    #[must_use]
    pub fn with_final_kinds(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.final_kinds = kinds.into_iter().collect();
        self
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide after a failure. `attempts` counts failed attempts including this one.
    #[must_use]
    pub fn decide(&self, attempts: u32, error: &FetchError) -> RetryDecision {
        if self.final_kinds.contains(&error.kind()) || attempts >= self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> FetchError {
        FetchError::transient(FailureKind::Timeout, "result table never appeared")
    }

    #[test]
    fn test_retries_until_cap() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.decide(1, &timeout()), RetryDecision::Retry);
        assert_eq!(policy.decide(2, &timeout()), RetryDecision::Retry);
        assert_eq!(policy.decide(3, &timeout()), RetryDecision::GiveUp);
        assert_eq!(policy.decide(7, &timeout()), RetryDecision::GiveUp);
    }

    #[test]
    fn test_session_errors_are_retried() {
        let policy = RetryPolicy::default();
        let err = FetchError::Session("target closed".to_string());
        assert_eq!(policy.decide(1, &err), RetryDecision::Retry);
    }

    #[test]
    fn test_final_kinds_give_up_immediately() {
        let policy = RetryPolicy::default().with_final_kinds([FailureKind::SelectorNotFound]);
        let err = FetchError::transient(FailureKind::SelectorNotFound, "#NumeroDocumento");
        assert_eq!(policy.decide(1, &err), RetryDecision::GiveUp);
        assert_eq!(policy.decide(1, &timeout()), RetryDecision::Retry);
    }

    #[test]
    fn test_unknown_errors_are_retried_by_default() {
        let policy = RetryPolicy::default();
        let err = FetchError::transient(FailureKind::Unknown, "oneshot canceled");
        assert_eq!(policy.decide(1, &err), RetryDecision::Retry);
    }

    #[test]
    fn test_zero_is_clamped() {
        assert_eq!(RetryPolicy::new(0).max_retries(), 1);
    }
}
