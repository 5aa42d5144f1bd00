//! Timed, retryable change detection over card-id snapshots.
//!
//! The producer's replies are never trusted for control flow; new cards are
//! discovered by diffing listing snapshots against a baseline captured
//! before the production request went out. One [`PollingManager`] covers one
//! detection attempt plus its manual retries; once the retry budget is spent
//! the instance is finished for good and a fresh one must be constructed.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cards::CardId;

/// Default wall-clock budget for one detection attempt.
const DEFAULT_TIMEOUT_SECS: u64 = 60;
/// Default pause between poll ticks.
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
/// Default number of manual retries after a timeout.
const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PollConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl PollConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Outcome of [`PollingManager::should_continue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollVerdict {
    /// Another tick is allowed.
    Continue,
    /// Detection already succeeded; nothing left to poll for.
    Completed,
    /// The wall-clock budget is spent.
    TimedOut,
}

impl PollVerdict {
    pub fn should_continue(&self) -> bool {
        matches!(self, PollVerdict::Continue)
    }
}

/// Display snapshot of a detection attempt.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PollStatus {
    pub elapsed_secs: u64,
    pub remaining_secs: u64,
    pub poll_count: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub baseline_count: usize,
    pub detected_count: usize,
    pub timed_out: bool,
    pub completed: bool,
}

/// Snapshot-diff change detector with a bounded timeout and bounded manual
/// retries.
#[derive(Debug)]
pub struct PollingManager {
    config: PollConfig,
    baseline: HashSet<CardId>,
    detected: HashSet<CardId>,
    started_at: Instant,
    poll_count: u32,
    retry_count: u32,
    timed_out: bool,
    completed: bool,
}

impl PollingManager {
    pub fn new(config: PollConfig) -> Self {
        PollingManager {
            config,
            baseline: HashSet::new(),
            detected: HashSet::new(),
            started_at: Instant::now(),
            poll_count: 0,
            retry_count: 0,
            timed_out: false,
            completed: false,
        }
    }

    /// Stores the pre-operation id snapshot later arrivals are diffed
    /// against. The baseline never changes after capture.
    pub fn record_baseline(&mut self, ids: HashSet<CardId>) {
        log::debug!("Poll: baseline recorded with {} id(s)", ids.len());
        self.baseline = ids;
    }

    /// Returns `current − baseline` and folds the result into the running
    /// detected set. Repeating the baseline snapshot yields the empty set;
    /// repeating a later snapshot returns the same diff again, so callers
    /// deduplicate at delivery.
    pub fn check_for_new(&mut self, current: &HashSet<CardId>) -> HashSet<CardId> {
        let new_ids: HashSet<CardId> = current.difference(&self.baseline).copied().collect();
        if !new_ids.is_empty() {
            self.detected.extend(new_ids.iter().copied());
            log::info!(
                "Poll: {} new card(s) in snapshot, {} detected in total",
                new_ids.len(),
                self.detected.len()
            );
        }
        new_ids
    }

    /// Decides whether another tick is allowed, flagging the timeout once
    /// the wall-clock budget runs out.
    pub fn should_continue(&mut self) -> PollVerdict {
        if self.completed {
            return PollVerdict::Completed;
        }
        if self.timed_out {
            return PollVerdict::TimedOut;
        }
        if self.started_at.elapsed() >= self.config.timeout() {
            self.timed_out = true;
            log::warn!(
                "Poll: timed out after {}s ({} poll(s), retry {}/{})",
                self.config.timeout_secs,
                self.poll_count,
                self.retry_count,
                self.config.max_retries
            );
            return PollVerdict::TimedOut;
        }
        PollVerdict::Continue
    }

    /// The sole suspension point of a tick: sleeps one configured interval
    /// and counts the poll.
    pub async fn wait_interval(&mut self) {
        tokio::time::sleep(self.config.poll_interval()).await;
        self.poll_count += 1;
    }

    /// Marks detection as successfully finished.
    pub fn mark_completed(&mut self) {
        self.completed = true;
    }

    /// A manual retry is allowed only from the timed-out state and only
    /// while the retry budget lasts.
    pub fn can_retry(&self) -> bool {
        self.timed_out && !self.completed && self.retry_count < self.config.max_retries
    }

    /// Starts the next attempt: fresh window and poll counter, incremented
    /// retry counter. Baseline and detected set carry over so cards the
    /// producer wrote late still count.
    pub fn retry(&mut self) -> bool {
        if !self.can_retry() {
            return false;
        }
        self.retry_count += 1;
        self.started_at = Instant::now();
        self.poll_count = 0;
        self.timed_out = false;
        log::info!(
            "Poll: retry {}/{} started",
            self.retry_count,
            self.config.max_retries
        );
        true
    }

    /// Reopens the timeout window without consuming a retry. Used when a
    /// suspended layer resumes polling.
    pub(crate) fn restart_window(&mut self) {
        self.started_at = Instant::now();
        self.timed_out = false;
    }

    pub fn retries_remaining(&self) -> u32 {
        self.config.max_retries.saturating_sub(self.retry_count)
    }

    pub fn detected_count(&self) -> usize {
        self.detected.len()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub fn status(&self) -> PollStatus {
        let elapsed = self.started_at.elapsed();
        let remaining = self.config.timeout().saturating_sub(elapsed);
        PollStatus {
            elapsed_secs: elapsed.as_secs(),
            remaining_secs: remaining.as_secs(),
            poll_count: self.poll_count,
            retry_count: self.retry_count,
            max_retries: self.config.max_retries,
            baseline_count: self.baseline.len(),
            detected_count: self.detected.len(),
            timed_out: self.timed_out,
            completed: self.completed,
        }
    }
}
