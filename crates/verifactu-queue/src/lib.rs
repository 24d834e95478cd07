// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Fixed backoff schedule in seconds, indexed by attempt number (0-based).
/// The last interval repeats for all further attempts.
pub const RETRY_INTERVALS_SECONDS: [i64; 5] = [60, 300, 900, 3600, 7200];

/// Default maximum queue capacity.
pub const MAX_QUEUE_SIZE: usize = 1_000;

/// Entries older than this are flagged by the Contingency Manager's health
/// check as requiring escalation.
pub const MAX_QUEUE_AGE_HOURS: i64 = 48;

/// Scheduling priority for a queued entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    /// Lowest priority.
    Low,
    /// Default priority.
    Normal,
    /// Elevated priority — processed before `Normal`/`Low`.
    High,
}

/// Lifecycle status of a queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for its first or next attempt.
    Pending,
    /// An attempt is scheduled and the backoff window is in effect.
    Retrying,
    /// Exhausted retries or received a non-retryable rejection.
    Failed,
    /// Withdrawn before completion (e.g. by manual intervention).
    Cancelled,
}

/// A record waiting for transmission under contingency (spec §3
/// "Contingency queue entry").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Unique identifier — the record's `(issuer_nif, sequence_number)`
    /// identity, stringified.
    pub id: String,
    /// Scheduling priority.
    pub priority: QueuePriority,
    /// Current lifecycle status.
    pub status: QueueStatus,
    /// Number of attempts made so far.
    pub attempts: u32,
    /// When the most recent attempt ran, if any.
    pub last_attempt_at: Option<DateTime<FixedOffset>>,
    /// Error from the most recent attempt, if any.
    pub last_error: Option<String>,
    /// Earliest instant the next attempt may run.
    pub next_attempt_at: Option<DateTime<FixedOffset>>,
    /// When this entry was first enqueued.
    pub enqueued_at: DateTime<FixedOffset>,
}

/// Errors returned by [`RetryQueue`] operations.
#[derive(Debug)]
pub enum QueueError {
    /// The queue has reached its maximum capacity.
    Full {
        /// Maximum number of items the queue can hold.
        max: usize,
    },
    /// An entry with the given ID is already enqueued.
    DuplicateId(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full { max } => write!(f, "queue is full (max {max})"),
            QueueError::DuplicateId(id) => write!(f, "duplicate queue entry: {id}"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Snapshot statistics for a [`RetryQueue`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueStats {
    /// Number of entries currently in the queue.
    pub total: usize,
    /// Maximum queue capacity.
    pub max: usize,
    /// Breakdown of entries per priority level.
    pub by_priority: BTreeMap<String, usize>,
}

/// The next retry delay, in seconds, for the given (0-based) attempt count.
///
/// # Examples
///
/// ```
/// use verifactu_queue::next_retry_delay_seconds;
/// assert_eq!(next_retry_delay_seconds(0), 60);
/// assert_eq!(next_retry_delay_seconds(1), 300);
/// assert_eq!(next_retry_delay_seconds(2), 900);
/// assert_eq!(next_retry_delay_seconds(10), 7200);
/// ```
#[must_use]
pub fn next_retry_delay_seconds(attempts: u32) -> i64 {
    let idx = (attempts as usize).min(RETRY_INTERVALS_SECONDS.len() - 1);
    RETRY_INTERVALS_SECONDS[idx]
}

/// A bounded, priority-aware retry queue.
///
/// [`dequeue_ready`](RetryQueue::dequeue_ready) returns the highest-priority
/// entry whose `next_attempt_at` has elapsed (FIFO within a priority tier).
pub struct RetryQueue {
    entries: Vec<QueueEntry>,
    max_size: usize,
}

impl RetryQueue {
    /// Create a new queue with the given maximum capacity.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_size,
        }
    }

    /// Add an entry to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] if at capacity, or
    /// [`QueueError::DuplicateId`] if the ID already exists.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<(), QueueError> {
        if self.entries.len() >= self.max_size {
            return Err(QueueError::Full { max: self.max_size });
        }
        if self.entries.iter().any(|e| e.id == entry.id) {
            return Err(QueueError::DuplicateId(entry.id));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Remove and return the highest-priority entry that is due (`status ==
    /// Pending` and `next_attempt_at` is `None` or has elapsed by `now`).
    pub fn dequeue_ready(&mut self, now: DateTime<FixedOffset>) -> Option<QueueEntry> {
        let candidate_priority = self
            .entries
            .iter()
            .filter(|e| e.status == QueueStatus::Pending && e.next_attempt_at.map_or(true, |t| t <= now))
            .map(|e| e.priority)
            .max()?;
        let idx = self.entries.iter().position(|e| {
            e.priority == candidate_priority
                && e.status == QueueStatus::Pending
                && e.next_attempt_at.map_or(true, |t| t <= now)
        })?;
        Some(self.entries.remove(idx))
    }

    /// Peek at the next entry [`dequeue_ready`](Self::dequeue_ready) would
    /// return, without removing it.
    #[must_use]
    pub fn peek_ready(&self, now: DateTime<FixedOffset>) -> Option<&QueueEntry> {
        let candidate_priority = self
            .entries
            .iter()
            .filter(|e| e.status == QueueStatus::Pending && e.next_attempt_at.map_or(true, |t| t <= now))
            .map(|e| e.priority)
            .max()?;
        self.entries.iter().find(|e| {
            e.priority == candidate_priority
                && e.status == QueueStatus::Pending
                && e.next_attempt_at.map_or(true, |t| t <= now)
        })
    }

    /// Number of entries currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the queue holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `true` if the queue is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    /// Remove a specific entry by ID, returning it if found.
    pub fn remove(&mut self, id: &str) -> Option<QueueEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Mutable access to a specific entry by ID, for in-place status/attempt
    /// updates without a remove-then-reinsert round trip.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut QueueEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// References to all entries older than [`MAX_QUEUE_AGE_HOURS`] as of
    /// `now`.
    #[must_use]
    pub fn stale_entries(&self, now: DateTime<FixedOffset>) -> Vec<&QueueEntry> {
        self.entries
            .iter()
            .filter(|e| (now - e.enqueued_at).num_hours() >= MAX_QUEUE_AGE_HOURS)
            .collect()
    }

    /// A snapshot of queue statistics.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let mut by_priority = BTreeMap::new();
        for entry in &self.entries {
            let key = match entry.priority {
                QueuePriority::Low => "low",
                QueuePriority::Normal => "normal",
                QueuePriority::High => "high",
            };
            *by_priority.entry(key.to_string()).or_insert(0usize) += 1;
        }
        QueueStats {
            total: self.entries.len(),
            max: self.max_size,
            by_priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(s: i64) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0).unwrap().timestamp_opt(s, 0).unwrap()
    }

    fn entry(id: &str, priority: QueuePriority, next: Option<DateTime<FixedOffset>>) -> QueueEntry {
        QueueEntry {
            id: id.to_string(),
            priority,
            status: QueueStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            next_attempt_at: next,
            enqueued_at: at(0),
        }
    }

    #[test]
    fn dequeue_respects_priority_order() {
        let mut q = RetryQueue::new(10);
        q.enqueue(entry("a", QueuePriority::Low, None)).unwrap();
        q.enqueue(entry("b", QueuePriority::High, None)).unwrap();
        q.enqueue(entry("c", QueuePriority::Normal, None)).unwrap();
        assert_eq!(q.dequeue_ready(at(100)).unwrap().id, "b");
        assert_eq!(q.dequeue_ready(at(100)).unwrap().id, "c");
        assert_eq!(q.dequeue_ready(at(100)).unwrap().id, "a");
    }

    #[test]
    fn dequeue_skips_entries_not_yet_due() {
        let mut q = RetryQueue::new(10);
        q.enqueue(entry("later", QueuePriority::High, Some(at(1_000)))).unwrap();
        q.enqueue(entry("now", QueuePriority::Low, None)).unwrap();
        assert_eq!(q.dequeue_ready(at(100)).unwrap().id, "now");
        assert!(q.dequeue_ready(at(100)).is_none());
        assert_eq!(q.dequeue_ready(at(2_000)).unwrap().id, "later");
    }

    #[test]
    fn full_queue_rejects_enqueue() {
        let mut q = RetryQueue::new(1);
        q.enqueue(entry("a", QueuePriority::Normal, None)).unwrap();
        let err = q.enqueue(entry("b", QueuePriority::Normal, None)).unwrap_err();
        assert!(matches!(err, QueueError::Full { max: 1 }));
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut q = RetryQueue::new(10);
        q.enqueue(entry("a", QueuePriority::Normal, None)).unwrap();
        let err = q.enqueue(entry("a", QueuePriority::High, None)).unwrap_err();
        assert!(matches!(err, QueueError::DuplicateId(_)));
    }

    /// Scenario 5: backoff progresses 60 -> 300 -> 900 seconds over three
    /// attempts.
    #[test]
    fn backoff_schedule_matches_scenario_5() {
        assert_eq!(next_retry_delay_seconds(0), 60);
        assert_eq!(next_retry_delay_seconds(1), 300);
        assert_eq!(next_retry_delay_seconds(2), 900);
    }

    #[test]
    fn backoff_caps_at_last_interval() {
        assert_eq!(next_retry_delay_seconds(100), 7_200);
    }

    #[test]
    fn stale_entries_flagged_past_max_age() {
        let mut q = RetryQueue::new(10);
        let mut old = entry("old", QueuePriority::Normal, None);
        old.enqueued_at = at(0);
        q.enqueue(old).unwrap();
        let now = at(MAX_QUEUE_AGE_HOURS * 3600 + 1);
        assert_eq!(q.stale_entries(now).len(), 1);
    }
}
