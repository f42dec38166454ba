//! Isochronous channel table
//!
//! The registry is created once with the configured channel count and never
//! grows. Channels are never removed; teardown resets a channel to `Idle` and
//! drops its peer association.

use heapless::Vec;

use crate::constants::MAX_CHANNELS;
use crate::log::debug;
use crate::{Direction, TransportError, TransportKind};

/// Connection state of one isochronous channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    /// No isochronous link
    #[default]
    Idle,
    /// Link setup in progress
    Connecting,
    /// Isochronous link established
    Connected,
    /// Audio is flowing on the link
    Streaming,
    /// Link teardown in progress
    Disconnecting,
}

impl ChannelState {
    /// Whether the isochronous link is up
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Streaming)
    }
}

/// One isochronous stream endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Channel {
    /// Logical index: 0 is left or mono, 1 is right or the second headset
    pub index: usize,
    /// Data direction
    pub direction: Direction,
    /// Transport kind
    pub kind: TransportKind,
    /// Connection state
    pub state: ChannelState,
    /// ACL connection handle of the associated peer
    pub peer: Option<u16>,
}

/// Fixed table of isochronous channels
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    channels: Vec<Channel, MAX_CHANNELS>,
}

impl ChannelRegistry {
    /// Create a registry with `count` idle channels (clamped to `MAX_CHANNELS`)
    #[must_use]
    pub fn new(count: usize, kind: TransportKind, direction: Direction) -> Self {
        let channels = (0..count.min(MAX_CHANNELS))
            .map(|index| Channel {
                index,
                direction,
                kind,
                state: ChannelState::Idle,
                peer: None,
            })
            .collect();
        Self { channels }
    }

    /// Number of configured channels
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channel is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Iterate over all channels
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    /// Get a channel by index
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `index` is out of range.
    pub fn channel(&self, index: usize) -> Result<&Channel, TransportError> {
        self.channels
            .get(index)
            .ok_or(TransportError::InvalidChannel)
    }

    fn channel_mut(&mut self, index: usize) -> Result<&mut Channel, TransportError> {
        self.channels
            .get_mut(index)
            .ok_or(TransportError::InvalidChannel)
    }

    /// Get the state of a channel
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `index` is out of range.
    pub fn state(&self, index: usize) -> Result<ChannelState, TransportError> {
        Ok(self.channel(index)?.state)
    }

    /// Set the state of a channel
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `index` is out of range.
    pub fn set_state(&mut self, index: usize, state: ChannelState) -> Result<(), TransportError> {
        let channel = self.channel_mut(index)?;
        if channel.state != state {
            debug!("[REGISTRY] Channel {}: {} -> {}", index, channel.state, state);
            channel.state = state;
        }
        Ok(())
    }

    /// Whether every configured channel is connected or streaming
    #[must_use]
    pub fn all_channels_connected(&self) -> bool {
        !self.channels.is_empty() && self.channels.iter().all(|c| c.state.is_connected())
    }

    /// Number of connected or streaming channels
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.state.is_connected())
            .count()
    }

    /// Index of the first connected or streaming channel
    #[must_use]
    pub fn first_connected(&self) -> Option<usize> {
        self.channels
            .iter()
            .position(|c| c.state.is_connected())
    }

    /// Index of the channel associated with `peer`
    #[must_use]
    pub fn find_by_peer(&self, peer: u16) -> Option<usize> {
        self.channels.iter().position(|c| c.peer == Some(peer))
    }

    /// Index of the first channel without a peer
    #[must_use]
    pub fn first_unassigned(&self) -> Option<usize> {
        self.channels.iter().position(|c| c.peer.is_none())
    }

    /// Associate `peer` with a channel
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `index` is out of range.
    pub fn assign_peer(&mut self, index: usize, peer: u16) -> Result<(), TransportError> {
        self.channel_mut(index)?.peer = Some(peer);
        Ok(())
    }

    /// Reset a channel to `Idle` and drop its peer
    ///
    /// Returns whether anything changed, so releasing an idle channel is a no-op.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `index` is out of range.
    pub fn release(&mut self, index: usize) -> Result<bool, TransportError> {
        let channel = self.channel_mut(index)?;
        let changed = channel.state != ChannelState::Idle || channel.peer.is_some();
        channel.state = ChannelState::Idle;
        channel.peer = None;
        Ok(changed)
    }
}
