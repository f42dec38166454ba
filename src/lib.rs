#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::too_many_lines)]

mod address;
pub mod adv;
pub mod api;
pub mod constants;
pub mod event;
pub mod iso;
mod log;
pub mod processor;
pub mod registry;
pub mod retry;
pub mod role;
pub mod timing;
pub mod transport;
pub mod tx_pool;

#[cfg(test)]
mod testing;

use crate::constants::{
    DEFAULT_PEER_NAME, DEFAULT_RX_STATS_INTERVAL_S, MAX_CHANNELS, PA_RETRY_COUNT, QUEUE_DEPTH,
};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

pub use address::{AddressKind, LeAddress};
pub use event::StackEvent;
pub use iso::{BackendError, IsoBackend, ScanMode};
pub use registry::{ChannelRegistry, ChannelState};
pub use retry::{ConnectionRetryScheduler, RetryConfig, RetryOp, RetryOutcome, RetryWorkItem};
pub use role::{Action, AudioRoleBehavior, StreamState, Transition};
pub use timing::{SendTiming, TimingConfig, TimingCoordinator, TimingSample};
pub use transport::{PollOutcome, RxStatsSnapshot, SendReport, StreamTransport};
pub use tx_pool::TxBufferPool;

pub(crate) static REQUEST_CHANNEL: Channel<CriticalSectionRawMutex, Request, QUEUE_DEPTH> =
    Channel::new();

pub(crate) static RESPONSE_CHANNEL: Channel<CriticalSectionRawMutex, Response, QUEUE_DEPTH> =
    Channel::new();

/// Callbacks from the LE host stack, pushed by the stack shim and drained by the processor
pub(crate) static STACK_EVENT_CHANNEL: Channel<CriticalSectionRawMutex, StackEvent, QUEUE_DEPTH> =
    Channel::new();

/// Lifecycle events published for the audio pipeline and UI layers
pub(crate) static LE_AUDIO_EVENT_CHANNEL: Channel<
    CriticalSectionRawMutex,
    LeAudioEvent,
    QUEUE_DEPTH,
> = Channel::new();

/// Audio device role, selected once per build / at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// Audio source side (connects to headsets or broadcasts)
    Gateway,
    /// Audio sink side (advertises or synchronizes to a broadcast)
    Headset,
}

/// Isochronous transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportKind {
    /// Broadcast Isochronous Stream
    Bis,
    /// Connected Isochronous Stream
    Cis,
}

/// Data direction of an isochronous channel, seen from this device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Receive only
    Rx,
    /// Transmit only
    Tx,
    /// Transmit and receive
    Bidirectional,
}

impl Direction {
    /// Whether this direction includes transmission
    #[must_use]
    pub const fn transmits(self) -> bool {
        matches!(self, Self::Tx | Self::Bidirectional)
    }

    /// Whether this direction includes reception
    #[must_use]
    pub const fn receives(self) -> bool {
        matches!(self, Self::Rx | Self::Bidirectional)
    }
}

/// Channel selection for an outgoing audio frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelSelector {
    /// Left channel only (index 0)
    Left,
    /// Right channel only (index 1)
    Right,
    /// Both channels; the payload holds left then right halves
    Stereo,
    /// Single mono / return channel (index 0)
    Mono,
}

/// Lifecycle events published to the audio pipeline and UI layers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LeAudioEvent {
    /// A peer link (ACL, CIS or periodic advertising) came up
    Connected,
    /// The last peer link went down
    Disconnected,
    /// The isochronous link is ready to carry audio
    LinkReady,
    /// Audio is streaming
    Streaming,
    /// Audio stopped streaming
    NotStreaming,
    /// A usable codec configuration was received
    ConfigReceived,
    /// No usable codec configuration was found
    NoValidConfig,
}

/// Transport errors with detailed error information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Channel index outside the configured channel table
    InvalidChannel,
    /// Invalid parameter provided (e.g. odd stereo payload, malformed address)
    InvalidParameter,
    /// Operation not valid in the current lifecycle state
    InvalidState,
    /// Operation not supported by the active role
    NotSupported,
    /// Audio was received but no receive callback is registered
    NoReceiveCallback,
    /// The transport is already initialized
    AlreadyInitialized,
    /// The retry queue has no room for another item
    QueueFull,
    /// Retries for a channel were exhausted and the link was torn down
    RetriesExhausted,
    /// The channel is not connected
    NotConnected,
    /// An operation timed out
    Timeout,
    /// The LE host stack rejected an operation
    Backend(BackendError),
}

impl TransportError {
    /// Whether the error signals API misuse by the caller rather than a runtime condition
    #[must_use]
    pub const fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidChannel
                | Self::InvalidParameter
                | Self::NoReceiveCallback
                | Self::AlreadyInitialized
        )
    }
}

impl From<BackendError> for TransportError {
    fn from(e: BackendError) -> Self {
        Self::Backend(e)
    }
}

/// Received-audio callback: `(data, bad_frame, timestamp, channel_index)`
pub type IsoRxCallback = fn(&[u8], bool, u32, usize);

/// Options for configuring a `StreamTransport` instance
///
/// # Examples
///
/// ```rust
/// use isotrans::{Direction, TransportOptions};
///
/// // Stereo CIS gateway with default timing and retry policy
/// let gateway = TransportOptions::gateway_cis();
/// assert_eq!(gateway.channel_count, 2);
///
/// // Broadcast sink syncing to BIS index 2
/// let sink = TransportOptions::broadcast_sink().with_bis_index_bitfield(0b100);
/// assert_eq!(sink.direction, Direction::Rx);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Device role
    pub role: Role,
    /// Isochronous transport kind
    pub kind: TransportKind,
    /// Data direction
    pub direction: Direction,
    /// Number of configured channels (1..=`MAX_CHANNELS`)
    pub channel_count: usize,
    /// Local name of the headsets a CIS gateway connects to
    pub peer_name: &'static str,
    /// Stereo timing workaround parameters
    pub timing: TimingConfig,
    /// CIS connect / stream start retry policy
    pub retry: RetryConfig,
    /// Periodic advertising interval multiplier for PA sync timeouts
    pub pa_retry_count: u32,
    /// BIS indexes a broadcast sink synchronizes to (bit n = BIS index n)
    pub bis_index_bitfield: u32,
    /// RX statistics reporting interval in seconds (0 disables reporting)
    pub rx_stats_interval_s: u32,
    /// Transmit an incrementing test pattern instead of the audio payload
    pub test_pattern: bool,
    /// Enable streams as soon as QoS is configured (unicast client)
    pub play_on_connect: bool,
    /// Drive unicast streams through sink discovery and codec / QoS
    /// configuration instead of connecting the CIS right after the MTU exchange
    pub stream_discovery: bool,
}

impl TransportOptions {
    /// Stereo CIS gateway (unicast client)
    #[must_use]
    pub fn gateway_cis() -> Self {
        Self::default()
    }

    /// CIS headset (unicast server), single channel
    #[must_use]
    pub fn headset_cis() -> Self {
        Self {
            role: Role::Headset,
            direction: Direction::Rx,
            channel_count: 1,
            ..Self::default()
        }
    }

    /// BIS gateway (broadcast source), single BIS
    #[must_use]
    pub fn broadcast_source() -> Self {
        Self {
            kind: TransportKind::Bis,
            channel_count: 1,
            ..Self::default()
        }
    }

    /// BIS headset (broadcast sink), single BIS
    #[must_use]
    pub fn broadcast_sink() -> Self {
        Self {
            role: Role::Headset,
            kind: TransportKind::Bis,
            direction: Direction::Rx,
            channel_count: 1,
            ..Self::default()
        }
    }

    /// Set the data direction
    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Set the number of channels
    #[must_use]
    pub fn with_channel_count(mut self, channel_count: usize) -> Self {
        self.channel_count = channel_count;
        self
    }

    /// Set the peer name a CIS gateway connects to
    #[must_use]
    pub fn with_peer_name(mut self, peer_name: &'static str) -> Self {
        self.peer_name = peer_name;
        self
    }

    /// Set the stereo timing parameters
    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the BIS indexes a broadcast sink synchronizes to
    #[must_use]
    pub fn with_bis_index_bitfield(mut self, bitfield: u32) -> Self {
        self.bis_index_bitfield = bitfield;
        self
    }

    /// Set the RX statistics reporting interval
    #[must_use]
    pub fn with_rx_stats_interval(mut self, seconds: u32) -> Self {
        self.rx_stats_interval_s = seconds;
        self
    }

    /// Enable or disable test pattern transmission
    #[must_use]
    pub fn with_test_pattern(mut self, enabled: bool) -> Self {
        self.test_pattern = enabled;
        self
    }

    /// Enable or disable sink discovery and stream configuration (unicast client)
    #[must_use]
    pub fn with_stream_discovery(mut self, enabled: bool) -> Self {
        self.stream_discovery = enabled;
        self
    }

    /// Validate the option combination
    ///
    /// # Errors
    /// Returns `TransportError::InvalidParameter` if the channel count is out of
    /// range, a broadcast source is asked to receive, a broadcast sink is asked to
    /// transmit, or a broadcast sink has no BIS index selected.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(TransportError::InvalidParameter);
        }
        match (self.kind, self.role) {
            (TransportKind::Bis, Role::Gateway) if self.direction != Direction::Tx => {
                Err(TransportError::InvalidParameter)
            }
            (TransportKind::Bis, Role::Headset)
                if self.direction != Direction::Rx || self.bis_index_bitfield == 0 =>
            {
                Err(TransportError::InvalidParameter)
            }
            _ => Ok(()),
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            role: Role::Gateway,
            kind: TransportKind::Cis,
            direction: Direction::Tx,
            channel_count: MAX_CHANNELS,
            peer_name: DEFAULT_PEER_NAME,
            timing: TimingConfig::default(),
            retry: RetryConfig::default(),
            pa_retry_count: PA_RETRY_COUNT,
            bis_index_bitfield: 0b10,
            rx_stats_interval_s: DEFAULT_RX_STATS_INTERVAL_S,
            test_pattern: false,
            play_on_connect: true,
            stream_discovery: false,
        }
    }
}

/// API requests sent to the processor task
#[derive(Debug, Clone)]
pub(crate) enum Request {
    /// Start the transport for the configured role
    Start,
    /// Stop the transport for the configured role
    Stop,
    /// Get the current lifecycle state
    GetState,
    /// Get and reset RX statistics
    TakeRxStats,
    /// Provide the broadcast code for an encrypted BIG
    SetBroadcastCode([u8; constants::BROADCAST_CODE_LENGTH]),
}

/// API responses sent back from the processor task
#[derive(Debug, Clone)]
pub(crate) enum Response {
    /// Start request accepted
    Started,
    /// Stop request accepted
    Stopped,
    /// Current lifecycle state
    State(StreamState),
    /// RX statistics since the previous request
    RxStats(RxStatsSnapshot),
    /// Broadcast code stored
    BroadcastCodeSet,
    /// Error occurred
    Error(TransportError),
}
