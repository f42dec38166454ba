//! Stereo anchor-point timing
//!
//! With two CIS channels the left and right halves of a stereo frame are handed
//! to the controller one after the other. If the first SDU of a streaming
//! session lands right next to an ISO anchor point, the left half may go out in
//! interval N and the right half in interval N+1, leaving a permanent offset
//! between the channels. Before sending after a pause the coordinator reads the
//! controller's last TX anchor and, if the current time is within the guard
//! window of the next anchor, asks the caller to wait until it has passed.
//!
//! The coordinator keeps no anchor samples between calls; every check reads a
//! fresh one, and [`TimingCoordinator::invalidate`] forces a check after a
//! channel has been released.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::constants::{ISO_CONN_INTERVAL_US, SYNC_OFFS_GUARD_US, SYNC_OFFS_PAUSE_INTERVALS};
use crate::iso::BackendError;
use crate::log::{debug, warn};

/// Tunable parameters of the stereo timing workaround
///
/// The defaults were tuned on hardware and are not derived from a formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingConfig {
    /// Guard window around the anchor point in microseconds (default 1600)
    pub guard_window_us: u32,
    /// Number of ISO intervals without stereo sends before a new check (default 3)
    pub pause_intervals: u32,
    /// Nominal ISO interval in microseconds (default 10 000)
    pub iso_interval_us: u32,
}

impl TimingConfig {
    /// Pause after which the anchor is checked again, in milliseconds
    #[must_use]
    pub const fn pause_threshold_ms(&self) -> u32 {
        self.pause_intervals.saturating_mul(self.iso_interval_us) / 1000
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            guard_window_us: SYNC_OFFS_GUARD_US,
            pause_intervals: SYNC_OFFS_PAUSE_INTERVALS,
            iso_interval_us: ISO_CONN_INTERVAL_US,
        }
    }
}

/// Anchor point read from the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingSample {
    /// SDU reference timestamp of the last anchor in microseconds
    pub timestamp_us: u32,
    /// Time offset reported with the anchor in microseconds
    pub offset_us: u32,
}

/// What the send path should do before handing a stereo frame to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendTiming {
    /// Send now
    Immediate,
    /// Wait the given number of microseconds, then send
    Delay {
        /// Delay in microseconds
        us: u32,
    },
}

/// Computes send-delay adjustments for stereo transmission
#[derive(Debug)]
pub struct TimingCoordinator {
    config: TimingConfig,
    last_send_ms: AtomicU32,
    armed: AtomicBool,
}

impl TimingCoordinator {
    /// Create a coordinator; the first stereo send is always checked
    #[must_use]
    pub const fn new(config: TimingConfig) -> Self {
        Self {
            config,
            last_send_ms: AtomicU32::new(0),
            armed: AtomicBool::new(true),
        }
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &TimingConfig {
        &self.config
    }

    /// Force an anchor check on the next stereo send
    pub fn invalidate(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// Whether the next stereo send will check the anchor regardless of pause
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Plan the next stereo send
    ///
    /// `connected` is the number of connected channels and `anchor` reads the
    /// controller's TX anchor. The anchor is only read when more than one
    /// channel is connected and the previous stereo send is older than the
    /// pause threshold (or a check is forced). An anchor that is not yet
    /// established yields `Immediate` and forces a check on the next call;
    /// other read failures are logged and yield `Immediate`.
    pub fn plan<F>(&self, now_ms: u64, now_us: u32, connected: usize, anchor: F) -> SendTiming
    where
        F: FnOnce() -> Result<TimingSample, BackendError>,
    {
        if connected < 2 {
            return SendTiming::Immediate;
        }

        // Millisecond clock is compared modulo 2^32, long enough for a pause check.
        let now = now_ms as u32;
        let last = self.last_send_ms.swap(now, Ordering::AcqRel);
        let forced = self.armed.swap(false, Ordering::AcqRel);
        if !forced && now.wrapping_sub(last) <= self.config.pause_threshold_ms() {
            return SendTiming::Immediate;
        }

        let sample = match anchor() {
            Ok(sample) => sample,
            Err(BackendError::NotEstablished) => {
                debug!("[TIMING] Anchor not established yet, checking next cycle");
                self.armed.store(true, Ordering::Release);
                return SendTiming::Immediate;
            }
            Err(e) => {
                warn!("[TIMING] Failed to read ISO TX anchor: {}", e);
                return SendTiming::Immediate;
            }
        };

        let guard = self.config.guard_window_us as i32;
        let diff = now_us
            .wrapping_sub(sample.timestamp_us)
            .wrapping_sub(self.config.iso_interval_us) as i32;
        if diff.unsigned_abs() < self.config.guard_window_us {
            let us = (guard - diff) as u32;
            debug!("[TIMING] Anchor too close: diff={}us, delaying {}us", diff, us);
            SendTiming::Delay { us }
        } else {
            SendTiming::Immediate
        }
    }
}

impl Default for TimingCoordinator {
    fn default() -> Self {
        Self::new(TimingConfig::default())
    }
}
