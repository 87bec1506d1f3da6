//! In-memory backlog owned by the orchestrator.

use crate::retry::{RetryDecision, RetryPolicy};
use lineas_browser::FetchError;
use lineas_core::{RucKey, WorkRecord, WorkStatus};
use std::collections::{HashMap, HashSet, VecDeque};

/// Pending FIFO plus the bookkeeping record of every key in the run.
#[derive(Debug, Default)]
pub struct Backlog {
    queue: VecDeque<RucKey>,
    records: HashMap<RucKey, WorkRecord>,
    in_progress: usize,
    succeeded: usize,
    failed: usize,
    retries: u64,
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacklogCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl Backlog {
    /// Build a backlog from de-duplicated keys, in input order.
    #[must_use]
    pub fn new(keys: impl IntoIterator<Item = RucKey>) -> Self {
        let mut backlog = Self::default();
        for key in keys {
            if backlog.records.contains_key(&key) {
                continue;
            }
            backlog
                .records
                .insert(key.clone(), WorkRecord::pending(key.clone()));
            backlog.queue.push_back(key);
        }
        backlog
    }

    /// Take the next pending key and mark it in progress.
    pub fn next(&mut self) -> Option<WorkRecord> {
        let key = self.queue.pop_front()?;
        let record = self.records.get_mut(&key)?;
        record.status = WorkStatus::InProgress;
        self.in_progress += 1;
        Some(record.clone())
    }

    /// Terminal success.
    pub fn succeed(&mut self, key: &RucKey) {
        if self.transition(key, WorkStatus::Succeeded) {
            self.succeeded += 1;
        }
    }

    /// Count a failed attempt and either re-queue the key at the back or fail it.
    pub fn fail(&mut self, key: &RucKey, error: &FetchError, policy: &RetryPolicy) -> RetryDecision {
        let Some(record) = self.records.get_mut(key) else {
            return RetryDecision::GiveUp;
        };
        if record.status != WorkStatus::InProgress {
            return RetryDecision::GiveUp;
        }

        record.attempts += 1;
        let decision = policy.decide(record.attempts, error);
        self.in_progress -= 1;

        match decision {
            RetryDecision::Retry => {
                record.status = WorkStatus::Pending;
                self.queue.push_back(key.clone());
                self.retries += 1;
            }
            RetryDecision::GiveUp => {
                record.status = WorkStatus::Failed;
                self.failed += 1;
            }
        }
        decision
    }

    /// Put an in-progress key back at the front without touching its attempts.
    pub fn release(&mut self, key: &RucKey) {
        if self.transition(key, WorkStatus::Pending) {
            self.queue.push_front(key.clone());
        }
    }

    fn transition(&mut self, key: &RucKey, to: WorkStatus) -> bool {
        match self.records.get_mut(key) {
            Some(record) if record.status == WorkStatus::InProgress => {
                record.status = to;
                self.in_progress -= 1;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn record(&self, key: &RucKey) -> Option<&WorkRecord> {
        self.records.get(key)
    }

    /// Keys that are not terminal: pending plus in progress.
    #[must_use]
    pub fn remaining(&self) -> HashSet<RucKey> {
        self.records
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.key.clone())
            .collect()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// No pending and no in-progress keys are left.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.in_progress == 0
    }

    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries
    }

    #[must_use]
    pub fn counts(&self) -> BacklogCounts {
        BacklogCounts {
            total: self.records.len(),
            pending: self.queue.len(),
            in_progress: self.in_progress,
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineas_core::FailureKind;

    fn key(n: u64) -> RucKey {
        RucKey::new(format!("{:011}", 20_000_000_000 + n)).unwrap()
    }

    fn timeout() -> FetchError {
        FetchError::transient(FailureKind::Timeout, "slow")
    }

    #[test]
    fn test_fifo_and_dedup() {
        let mut backlog = Backlog::new([key(1), key(2), key(1), key(3)]);
        assert_eq!(backlog.counts().total, 3);

        let order: Vec<_> = std::iter::from_fn(|| backlog.next().map(|r| r.key)).collect();
        assert_eq!(order, vec![key(1), key(2), key(3)]);
        assert_eq!(backlog.counts().in_progress, 3);
    }

    #[test]
    fn test_retry_goes_to_back() {
        let mut backlog = Backlog::new([key(1), key(2)]);
        let first = backlog.next().unwrap();

        let decision = backlog.fail(&first.key, &timeout(), &RetryPolicy::new(3));
        assert_eq!(decision, RetryDecision::Retry);
        assert_eq!(backlog.record(&first.key).unwrap().attempts, 1);

        assert_eq!(backlog.next().unwrap().key, key(2));
        assert_eq!(backlog.next().unwrap().key, key(1));
        assert_eq!(backlog.retries(), 1);
    }

    #[test]
    fn test_exhausted_key_never_requeued() {
        let policy = RetryPolicy::new(2);
        let mut backlog = Backlog::new([key(1)]);

        backlog.next().unwrap();
        assert_eq!(backlog.fail(&key(1), &timeout(), &policy), RetryDecision::Retry);
        backlog.next().unwrap();
        assert_eq!(backlog.fail(&key(1), &timeout(), &policy), RetryDecision::GiveUp);

        let record = backlog.record(&key(1)).unwrap();
        assert_eq!(record.status, WorkStatus::Failed);
        assert_eq!(record.attempts, 2);
        assert!(backlog.next().is_none());
        assert!(backlog.remaining().is_empty());
        assert!(backlog.is_drained());

        // A late report for a terminal key changes nothing
        backlog.release(&key(1));
        assert!(!backlog.has_pending());
    }

    #[test]
    fn test_release_keeps_attempts() {
        let mut backlog = Backlog::new([key(1), key(2)]);
        backlog.next().unwrap();
        backlog.fail(&key(1), &timeout(), &RetryPolicy::new(3));

        backlog.next().unwrap(); // key 2
        let again = backlog.next().unwrap(); // key 1, attempts 1
        backlog.release(&again.key);

        assert_eq!(backlog.record(&key(1)).unwrap().attempts, 1);
        assert_eq!(backlog.next().unwrap().key, key(1));
    }

    #[test]
    fn test_counts_and_remaining() {
        let mut backlog = Backlog::new([key(1), key(2), key(3)]);
        backlog.next().unwrap();
        backlog.succeed(&key(1));
        backlog.next().unwrap();

        let counts = backlog.counts();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.pending, 1);

        let remaining = backlog.remaining();
        assert!(remaining.contains(&key(2)));
        assert!(remaining.contains(&key(3)));
        assert!(!remaining.contains(&key(1)));
        assert!(!backlog.is_drained());
    }
}
