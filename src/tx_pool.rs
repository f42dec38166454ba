//! Per-channel transmit buffer admission control
//!
//! Every isochronous channel may have at most `cap` SDUs handed to the controller
//! and not yet reported as sent. The audio path reserves a slot before each send
//! and the controller's sent callback releases it again. Both sides only need a
//! shared reference, so the counters are atomics.
//!
//! A reservation that finds the channel at its cap is rejected without side
//! effects on the counter: the frame is dropped for that cycle and the caller is
//! free to try again on the next one.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::TransportError;
use crate::constants::{HCI_ISO_BUF_ALLOC_PER_CHAN, MAX_CHANNELS};
use crate::log::{debug, warn};

/// Bounded in-flight counters, one per configured channel
#[derive(Debug)]
pub struct TxBufferPool {
    cap: u8,
    channels: usize,
    in_flight: [AtomicU8; MAX_CHANNELS],
    overrun_logged: [AtomicBool; MAX_CHANNELS],
    flush_pending: AtomicBool,
}

impl TxBufferPool {
    /// Create a pool for `channels` channels (clamped to `MAX_CHANNELS`) with
    /// the default per-channel cap
    #[must_use]
    pub const fn new(channels: usize) -> Self {
        Self::with_cap(channels, HCI_ISO_BUF_ALLOC_PER_CHAN)
    }

    /// Create a pool with an explicit per-channel cap
    #[must_use]
    pub const fn with_cap(channels: usize, cap: u8) -> Self {
        let channels = if channels > MAX_CHANNELS {
            MAX_CHANNELS
        } else {
            channels
        };
        Self {
            cap,
            channels,
            in_flight: [const { AtomicU8::new(0) }; MAX_CHANNELS],
            overrun_logged: [const { AtomicBool::new(false) }; MAX_CHANNELS],
            flush_pending: AtomicBool::new(false),
        }
    }

    /// Per-channel cap
    #[must_use]
    pub const fn cap(&self) -> u8 {
        self.cap
    }

    /// Number of configured channels
    #[must_use]
    pub const fn channel_count(&self) -> usize {
        self.channels
    }

    fn counter(&self, channel: usize) -> Result<&AtomicU8, TransportError> {
        if channel >= self.channels {
            return Err(TransportError::InvalidChannel);
        }
        Ok(&self.in_flight[channel])
    }

    /// Try to reserve one transmit slot on `channel`
    ///
    /// Returns `Ok(false)` and leaves the counter untouched when the channel is
    /// at its cap. The overflow warning is logged once per overflow episode.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `channel` is out of range.
    pub fn try_reserve(&self, channel: usize) -> Result<bool, TransportError> {
        let counter = self.counter(channel)?;
        let reserved = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.cap).then_some(n + 1)
            })
            .is_ok();

        if reserved {
            self.overrun_logged[channel].store(false, Ordering::Relaxed);
        } else if !self.overrun_logged[channel].swap(true, Ordering::Relaxed) {
            warn!("[POOL] HCI ISO TX overrun on channel {}, dropping frames", channel);
        }
        Ok(reserved)
    }

    /// Release one transmit slot on `channel`
    ///
    /// Releasing an empty channel is logged and ignored.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `channel` is out of range.
    pub fn release(&self, channel: usize) -> Result<(), TransportError> {
        let counter = self.counter(channel)?;
        if counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!("[POOL] Release on channel {} with nothing in flight", channel);
        }
        Ok(())
    }

    /// Number of buffers currently in flight on `channel`
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `channel` is out of range.
    pub fn in_flight(&self, channel: usize) -> Result<u8, TransportError> {
        Ok(self.counter(channel)?.load(Ordering::Acquire))
    }

    /// Whether `channel` has nothing in flight
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `channel` is out of range.
    pub fn is_empty(&self, channel: usize) -> Result<bool, TransportError> {
        Ok(self.in_flight(channel)? == 0)
    }

    /// Whether `channel` is at its cap
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `channel` is out of range.
    pub fn is_full(&self, channel: usize) -> Result<bool, TransportError> {
        Ok(self.in_flight(channel)? >= self.cap)
    }

    /// Zero the counter of `channel` (link dropped or stream stopped)
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `channel` is out of range.
    pub fn clear(&self, channel: usize) -> Result<(), TransportError> {
        self.counter(channel)?.store(0, Ordering::Release);
        self.overrun_logged[channel].store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Whether every configured channel has drained
    #[must_use]
    pub fn all_drained(&self) -> bool {
        self.in_flight[..self.channels]
            .iter()
            .all(|c| c.load(Ordering::Acquire) == 0)
    }

    /// Hold stereo sends until both channels drain
    ///
    /// Used when another CIS joins while audio is already flowing, so the new
    /// channel starts on the same SDU boundary as the existing one.
    pub fn request_flush(&self) {
        debug!("[POOL] Flush requested");
        self.flush_pending.store(true, Ordering::Release);
    }

    /// Whether a flush is pending
    #[must_use]
    pub fn flush_pending(&self) -> bool {
        self.flush_pending.load(Ordering::Acquire)
    }

    /// Finish a pending flush once every channel has drained
    ///
    /// Returns `true` when no flush is pending afterwards.
    pub fn complete_flush(&self) -> bool {
        if !self.flush_pending() {
            return true;
        }
        if self.all_drained() {
            self.flush_pending.store(false, Ordering::Release);
            debug!("[POOL] Flush complete");
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_up_to_cap() {
        let pool = TxBufferPool::new(2);
        assert_eq!(pool.try_reserve(0), Ok(true));
        assert_eq!(pool.try_reserve(0), Ok(true));
        assert_eq!(pool.try_reserve(0), Ok(false));
        assert_eq!(pool.in_flight(0), Ok(2));
        assert_eq!(pool.is_full(0), Ok(true));
        assert_eq!(pool.is_empty(1), Ok(true));
    }

    #[test]
    fn test_release_frees_slot() {
        let pool = TxBufferPool::new(1);
        assert_eq!(pool.try_reserve(0), Ok(true));
        assert_eq!(pool.try_reserve(0), Ok(true));
        pool.release(0).unwrap();
        assert_eq!(pool.in_flight(0), Ok(1));
        assert_eq!(pool.try_reserve(0), Ok(true));
    }

    #[test]
    fn test_release_on_empty_is_ignored() {
        let pool = TxBufferPool::new(1);
        assert_eq!(pool.release(0), Ok(()));
        assert_eq!(pool.in_flight(0), Ok(0));
    }

    #[test]
    fn test_invalid_channel() {
        let pool = TxBufferPool::new(1);
        assert_eq!(pool.try_reserve(1), Err(TransportError::InvalidChannel));
        assert_eq!(pool.release(5), Err(TransportError::InvalidChannel));
        assert_eq!(pool.is_empty(1), Err(TransportError::InvalidChannel));
        assert_eq!(pool.clear(2), Err(TransportError::InvalidChannel));
    }

    #[test]
    fn test_channel_count_is_clamped() {
        let pool = TxBufferPool::new(MAX_CHANNELS + 3);
        assert_eq!(pool.channel_count(), MAX_CHANNELS);
    }

    #[test]
    fn test_budget_never_exceeds_cap_or_goes_negative() {
        let pool = TxBufferPool::new(2);
        let mut seed: u32 = 0x1234_5678;
        let mut model = [0u8; 2];

        for _ in 0..10_000 {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let channel = (seed >> 16) as usize % 2;
            if seed & 1 == 0 {
                let reserved = pool.try_reserve(channel).unwrap();
                assert_eq!(reserved, model[channel] < HCI_ISO_BUF_ALLOC_PER_CHAN);
                if reserved {
                    model[channel] += 1;
                }
            } else {
                pool.release(channel).unwrap();
                model[channel] = model[channel].saturating_sub(1);
            }
            let n = pool.in_flight(channel).unwrap();
            assert!(n <= HCI_ISO_BUF_ALLOC_PER_CHAN);
            assert_eq!(n, model[channel]);
        }
    }

    #[test]
    fn test_rejected_reservations_have_no_side_effects() {
        let pool = TxBufferPool::new(2);
        pool.try_reserve(0).unwrap();
        pool.try_reserve(0).unwrap();
        for _ in 0..1000 {
            assert_eq!(pool.try_reserve(0), Ok(false));
        }
        assert_eq!(pool.in_flight(0), Ok(2));
        assert_eq!(pool.in_flight(1), Ok(0));
        assert!(!pool.flush_pending());

        pool.release(0).unwrap();
        pool.release(0).unwrap();
        assert_eq!(pool.is_empty(0), Ok(true));
    }

    #[test]
    fn test_clear() {
        let pool = TxBufferPool::new(2);
        pool.try_reserve(1).unwrap();
        pool.try_reserve(1).unwrap();
        pool.clear(1).unwrap();
        assert_eq!(pool.in_flight(1), Ok(0));
        assert_eq!(pool.try_reserve(1), Ok(true));
    }

    #[test]
    fn test_flush_completes_when_drained() {
        let pool = TxBufferPool::new(2);
        assert!(pool.complete_flush());

        pool.try_reserve(0).unwrap();
        pool.request_flush();
        assert!(pool.flush_pending());
        assert!(!pool.complete_flush());

        pool.release(0).unwrap();
        assert!(pool.complete_flush());
        assert!(!pool.flush_pending());
    }
}
