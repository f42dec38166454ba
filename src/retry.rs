//! Bounded retry of CIS connect and stream start
//!
//! Establishing a CIS (or starting a stream on it) may fail transiently while
//! the controller is busy with the other headset. Each request is queued as a
//! [`RetryWorkItem`] and attempted when due. A failed attempt is re-queued with
//! an incremented retry count after the backoff; once the count reaches the
//! bound the item is dropped and the caller tears the link down.
//!
//! Items for different channels are staggered by the backoff so two headsets
//! connecting at the same time do not hit the controller in the same interval.
//!
//! # Lifecycle
//!
//! ```text
//! schedule ──▶ Pending ──take_due──▶ Attempting ──complete──▶ Success
//!                 ▲                        │
//!                 └────── Rescheduled ◀────┴──────────────▶ Exhausted
//! ```

use heapless::Vec;

use crate::TransportError;
use crate::constants::{MAX_CHANNELS, MAX_RETRIES, RETRY_BACKOFF_MS};
use crate::iso::BackendError;
use crate::log::{debug, error, warn};

/// Operation retried by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RetryOp {
    /// Connect the CIS of a channel
    CisConnect,
    /// Start the audio stream of a channel
    StreamStart,
}

/// Retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RetryConfig {
    /// Retries allowed after the initial attempt (default 5)
    pub max_retries: u8,
    /// Delay between attempts in milliseconds (default 500)
    pub backoff_ms: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff_ms: RETRY_BACKOFF_MS,
        }
    }
}

/// One pending connect or start attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RetryWorkItem {
    /// Target channel index
    pub channel: usize,
    /// Operation to attempt
    pub op: RetryOp,
    /// Number of failed attempts so far
    pub retries: u8,
    /// Time at which the item becomes due, in milliseconds
    pub due_at_ms: u64,
}

/// Result of completing an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RetryOutcome {
    /// The attempt succeeded; the item is gone
    Success,
    /// The attempt failed and was queued again
    Rescheduled {
        /// Retry count of the queued item
        retries: u8,
        /// Time of the next attempt in milliseconds
        due_at_ms: u64,
    },
    /// The attempt failed and no retries are left; the link must be torn down
    Exhausted {
        /// Channel whose link must be torn down
        channel: usize,
        /// Operation that failed
        op: RetryOp,
    },
}

/// Bounded queue of retry work items, at most one per channel
#[derive(Debug, Clone)]
pub struct ConnectionRetryScheduler {
    config: RetryConfig,
    queue: Vec<RetryWorkItem, MAX_CHANNELS>,
}

impl ConnectionRetryScheduler {
    /// Create an empty scheduler
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self {
            config,
            queue: Vec::new(),
        }
    }

    /// Active retry policy
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Number of queued items
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The item queued for `channel`, if any
    #[must_use]
    pub fn pending(&self, channel: usize) -> Option<&RetryWorkItem> {
        self.queue.iter().find(|item| item.channel == channel)
    }

    /// Queue a first attempt for `channel`
    ///
    /// The attempt becomes due after `backoff_ms` times the number of items
    /// already queued. An item already queued for `channel` is replaced.
    ///
    /// # Errors
    /// Returns `TransportError::QueueFull` if no slot is free.
    pub fn schedule(
        &mut self,
        channel: usize,
        op: RetryOp,
        now_ms: u64,
    ) -> Result<(), TransportError> {
        self.cancel(channel);
        let position = self.queue.len() as u64;
        let item = RetryWorkItem {
            channel,
            op,
            retries: 0,
            due_at_ms: now_ms + u64::from(self.config.backoff_ms) * position,
        };
        self.queue.push(item).map_err(|_| {
            warn!("[RETRY] Queue full, cannot schedule {} for channel {}", op, channel);
            TransportError::QueueFull
        })?;
        debug!("[RETRY] Scheduled {} for channel {} at {}ms", op, channel, item.due_at_ms);
        Ok(())
    }

    /// Remove and return the earliest item that is due at `now_ms`
    pub fn take_due(&mut self, now_ms: u64) -> Option<RetryWorkItem> {
        let index = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, item)| item.due_at_ms <= now_ms)
            .min_by_key(|(_, item)| item.due_at_ms)
            .map(|(i, _)| i)?;
        Some(self.queue.remove(index))
    }

    /// Record the result of an attempt taken with [`Self::take_due`]
    ///
    /// Transient failures are queued again with an incremented retry count
    /// while the count is below `max_retries`. Anything else ends the item.
    pub fn complete(
        &mut self,
        item: RetryWorkItem,
        result: Result<(), BackendError>,
        now_ms: u64,
    ) -> RetryOutcome {
        let err = match result {
            Ok(()) => {
                debug!("[RETRY] {} on channel {} succeeded", item.op, item.channel);
                return RetryOutcome::Success;
            }
            Err(e) => e,
        };

        if err.is_transient() && item.retries < self.config.max_retries {
            let next = RetryWorkItem {
                retries: item.retries + 1,
                due_at_ms: now_ms + u64::from(self.config.backoff_ms),
                ..item
            };
            warn!(
                "[RETRY] {} on channel {} failed ({}), retry {}",
                item.op, item.channel, err, next.retries
            );
            self.cancel(item.channel);
            if self.queue.push(next).is_ok() {
                return RetryOutcome::Rescheduled {
                    retries: next.retries,
                    due_at_ms: next.due_at_ms,
                };
            }
        }

        error!(
            "[RETRY] Could not complete {} on channel {} after {} retries ({})",
            item.op, item.channel, item.retries, err
        );
        RetryOutcome::Exhausted {
            channel: item.channel,
            op: item.op,
        }
    }

    /// Drop the item queued for `channel`
    ///
    /// Returns whether an item was removed.
    pub fn cancel(&mut self, channel: usize) -> bool {
        let before = self.queue.len();
        self.queue.retain(|item| item.channel != channel);
        before != self.queue.len()
    }

    /// Drop every queued item
    pub fn cancel_all(&mut self) {
        self.queue.clear();
    }

    /// Earliest due time among queued items
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.iter().map(|item| item.due_at_ms).min()
    }
}

impl Default for ConnectionRetryScheduler {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
