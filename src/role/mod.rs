//! Streaming lifecycle state machines
//!
//! One state machine per device role and transport kind:
//!
//! | Role    | Kind | State machine                          |
//! |---------|------|----------------------------------------|
//! | Gateway | CIS  | [`unicast_client::UnicastClient`]      |
//! | Headset | CIS  | [`unicast_server::UnicastServer`]      |
//! | Gateway | BIS  | [`broadcast_source::BroadcastSource`]  |
//! | Headset | BIS  | [`broadcast_sink::BroadcastSink`]      |
//!
//! # Architecture
//!
//! Every entry point of [`AudioRoleBehavior`] returns a [`Transition`]: the
//! state machine has already updated itself and the shared channel table, and
//! hands back at most one outward [`Action`] plus the events to publish. The
//! transport executes the action against the LE host stack. A failure of that
//! action comes back later as a stack event, so the follow-up action belongs to
//! a transition of its own.

pub mod broadcast_sink;
pub mod broadcast_source;
pub mod unicast_client;
pub mod unicast_server;

use heapless::Vec;

use crate::constants::{BROADCAST_CODE_LENGTH, MAX_EVENTS_PER_TRANSITION};
use crate::log::warn;
use crate::{
    ChannelRegistry, ConnectionRetryScheduler, LeAddress, LeAudioEvent, Role, ScanMode,
    StackEvent, TimingCoordinator, TransportError, TransportKind, TransportOptions, TxBufferPool,
};

use broadcast_sink::BroadcastSink;
use broadcast_source::BroadcastSource;
use unicast_client::UnicastClient;
use unicast_server::UnicastServer;

/// Lifecycle state of the active role
///
/// Each role uses a subset of the states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamState {
    /// Not started
    #[default]
    Idle,
    /// Scanning for a headset or a broadcast source
    Scanning,
    /// Advertising for a gateway
    Advertising,
    /// ACL connection in progress
    AclConnecting,
    /// ACL connection up, no stream configured
    AclConnected,
    /// Security and service discovery in progress
    ServiceDiscovering,
    /// Codec configured
    CodecConfigured,
    /// QoS configured
    QosConfigured,
    /// Stream enabled, waiting for start
    Enabled,
    /// CIS connect in flight
    Connecting,
    /// Audio streaming
    Streaming,
    /// Stream being disabled
    Disabling,
    /// Broadcast source being created
    BroadcastSourceCreating,
    /// Extended advertising being started
    AdvertisingExtended,
    /// Periodic advertising being started
    PeriodicAdvertising,
    /// BIG being created
    BigCreating,
    /// BIG being terminated
    Stopping,
    /// Periodic advertising sync in progress
    PeriodicSyncing,
    /// Periodic advertising sync established
    PaSynced,
    /// BASE received
    BaseReceived,
    /// BIGInfo received, BIG can be synced
    Syncable,
    /// BIG sync in progress
    BigSyncing,
}

/// Disconnect reason requested by a state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectCause {
    /// Security could not be raised
    AuthenticationFailure,
    /// Local decision (unsupported configuration, retries exhausted)
    RemoteUserTerminated,
}

impl From<DisconnectCause> for bt_hci::param::DisconnectReason {
    fn from(cause: DisconnectCause) -> Self {
        match cause {
            DisconnectCause::AuthenticationFailure => Self::AuthenticationFailure,
            DisconnectCause::RemoteUserTerminated => Self::RemoteUserTerminatedConn,
        }
    }
}

/// Outward operation issued by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    /// Start scanning
    StartScan(ScanMode),
    /// Stop scanning
    StopScan,
    /// Start connectable advertising
    StartAdvertising,
    /// Stop all advertising
    StopAdvertising,
    /// Stop scanning and connect to a headset
    ConnectAcl(LeAddress),
    /// Raise the security level of a link
    SetSecurity {
        /// ACL connection handle
        acl: u16,
    },
    /// Exchange the ATT MTU on a link
    ExchangeMtu {
        /// ACL connection handle
        acl: u16,
    },
    /// Discover the audio sink of a headset
    DiscoverSink {
        /// ACL connection handle
        acl: u16,
    },
    /// Configure the codec of a stream
    ConfigureCodec {
        /// Channel index
        channel: usize,
        /// ACL connection handle
        acl: u16,
    },
    /// Configure the QoS of a stream
    ConfigureQos {
        /// Channel index
        channel: usize,
        /// ACL connection handle
        acl: u16,
    },
    /// Enable one stream
    EnableStream {
        /// Channel index
        channel: usize,
    },
    /// Enable the streams in `mask` (bit n = channel n)
    EnableStreams {
        /// Channel bit mask
        mask: u8,
    },
    /// Disable the streams in `mask` (bit n = channel n)
    DisableStreams {
        /// Channel bit mask
        mask: u8,
    },
    /// Queue a CIS connect attempt on the retry scheduler
    ScheduleCisConnect {
        /// Channel index
        channel: usize,
    },
    /// Queue a stream start attempt on the retry scheduler
    ScheduleStreamStart {
        /// Channel index
        channel: usize,
    },
    /// Disconnect an ACL link
    Disconnect {
        /// ACL connection handle
        acl: u16,
        /// Reason sent to the peer
        cause: DisconnectCause,
    },
    /// Create the broadcast source
    CreateBroadcastSource,
    /// Start extended advertising
    StartExtendedAdvertising,
    /// Start periodic advertising
    StartPeriodicAdvertising,
    /// Create the BIG
    CreateBig {
        /// Number of BIS in the group
        num_bis: usize,
    },
    /// Terminate the BIG
    TerminateBig,
    /// Stop scanning and synchronize to a periodic advertising train
    CreatePaSync {
        /// Advertiser address
        peer: LeAddress,
        /// Advertising set ID
        sid: u8,
        /// Sync timeout in 10 ms units
        timeout_10ms: u16,
    },
    /// Synchronize to the BIG
    SyncBig {
        /// BIS indexes to synchronize to
        bis_bitfield: u32,
        /// Broadcast code for encrypted BIGs
        broadcast_code: Option<[u8; BROADCAST_CODE_LENGTH]>,
    },
    /// Delete the pending or established periodic advertising sync
    DeletePaSync,
    /// Drop the current sync state and scan for a broadcast source again
    RestartScan {
        /// Whether the periodic advertising sync must be deleted first
        delete_pa_sync: bool,
    },
}

/// Result of one state machine step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    /// Outward operation to execute, if any
    pub action: Option<Action>,
    /// Events to publish, in order
    pub events: Vec<LeAudioEvent, MAX_EVENTS_PER_TRANSITION>,
}

impl Transition {
    /// Nothing to do
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Transition carrying `action`
    #[must_use]
    pub fn action(action: Action) -> Self {
        Self {
            action: Some(action),
            events: Vec::new(),
        }
    }

    /// Add an event to publish
    #[must_use]
    pub fn publish(mut self, event: LeAudioEvent) -> Self {
        if self.events.push(event).is_err() {
            warn!("[ROLE] Event {} dropped, transition full", event);
        }
        self
    }

    /// Whether the transition does nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.action.is_none() && self.events.is_empty()
    }
}

/// Shared transport state a state machine may touch during a step
pub struct RoleContext<'a> {
    /// Channel table
    pub registry: &'a mut ChannelRegistry,
    /// Transmit budgets
    pub pool: &'a TxBufferPool,
    /// Pending connect / start retries
    pub retry: &'a mut ConnectionRetryScheduler,
    /// Stereo timing state
    pub timing: &'a TimingCoordinator,
    /// Current time in milliseconds
    pub now_ms: u64,
}

impl RoleContext<'_> {
    /// Tear a channel down: reset it to `Idle`, cancel its retry, clear its
    /// budget and invalidate timing samples
    ///
    /// Returns whether the channel was not already idle.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidChannel` if `channel` is out of range.
    pub fn release_channel(&mut self, channel: usize) -> Result<bool, TransportError> {
        let changed = self.registry.release(channel)?;
        self.retry.cancel(channel);
        self.pool.clear(channel)?;
        self.timing.invalidate();
        Ok(changed)
    }

    /// Tear every channel down
    pub fn release_all(&mut self) {
        for channel in 0..self.registry.len() {
            // Indexes come from the registry itself.
            let _ = self.release_channel(channel);
        }
    }
}

/// Capabilities every role state machine provides
pub trait AudioRoleBehavior {
    /// Start the role (scan, advertise, or create the broadcast)
    ///
    /// # Errors
    /// Returns `TransportError::InvalidState` if the role cannot start now.
    fn start(&mut self, ctx: &mut RoleContext<'_>) -> Result<Transition, TransportError>;

    /// Stop (or pause) the role
    ///
    /// # Errors
    /// Returns `TransportError::InvalidState` if the role is not running.
    fn stop(&mut self, ctx: &mut RoleContext<'_>) -> Result<Transition, TransportError>;

    /// An isochronous channel connected
    fn on_connected(&mut self, ctx: &mut RoleContext<'_>, channel: usize) -> Transition;

    /// An isochronous channel disconnected
    fn on_disconnected(&mut self, ctx: &mut RoleContext<'_>, channel: usize, reason: u8)
    -> Transition;

    /// Any other stack event
    fn on_event(&mut self, ctx: &mut RoleContext<'_>, event: &StackEvent) -> Transition;

    /// Time-driven work (deadlines)
    fn on_tick(&mut self, _ctx: &mut RoleContext<'_>) -> Transition {
        Transition::none()
    }

    /// Next time `on_tick` has work to do
    fn next_deadline(&self) -> Option<u64> {
        None
    }

    /// Current lifecycle state
    fn state(&self) -> StreamState;
}

/// The role selected at construction
#[derive(Debug)]
pub enum ActiveRole {
    /// Gateway CIS
    UnicastClient(UnicastClient),
    /// Headset CIS
    UnicastServer(UnicastServer),
    /// Gateway BIS
    BroadcastSource(BroadcastSource),
    /// Headset BIS
    BroadcastSink(BroadcastSink),
}

impl ActiveRole {
    /// Select the state machine for `options`
    #[must_use]
    pub fn new(options: &TransportOptions) -> Self {
        match (options.role, options.kind) {
            (Role::Gateway, TransportKind::Cis) => Self::UnicastClient(UnicastClient::new(options)),
            (Role::Headset, TransportKind::Cis) => Self::UnicastServer(UnicastServer::new()),
            (Role::Gateway, TransportKind::Bis) => {
                Self::BroadcastSource(BroadcastSource::new(options))
            }
            (Role::Headset, TransportKind::Bis) => Self::BroadcastSink(BroadcastSink::new(options)),
        }
    }

    fn behavior(&self) -> &dyn AudioRoleBehavior {
        match self {
            Self::UnicastClient(r) => r,
            Self::UnicastServer(r) => r,
            Self::BroadcastSource(r) => r,
            Self::BroadcastSink(r) => r,
        }
    }

    fn behavior_mut(&mut self) -> &mut dyn AudioRoleBehavior {
        match self {
            Self::UnicastClient(r) => r,
            Self::UnicastServer(r) => r,
            Self::BroadcastSource(r) => r,
            Self::BroadcastSink(r) => r,
        }
    }

    /// Provide the broadcast code of an encrypted BIG (broadcast sink only)
    ///
    /// # Errors
    /// Returns `TransportError::NotSupported` for every other role.
    pub fn set_broadcast_code(
        &mut self,
        code: [u8; BROADCAST_CODE_LENGTH],
    ) -> Result<Transition, TransportError> {
        match self {
            Self::BroadcastSink(sink) => Ok(sink.set_broadcast_code(code)),
            _ => Err(TransportError::NotSupported),
        }
    }
}

impl AudioRoleBehavior for ActiveRole {
    fn start(&mut self, ctx: &mut RoleContext<'_>) -> Result<Transition, TransportError> {
        self.behavior_mut().start(ctx)
    }

    fn stop(&mut self, ctx: &mut RoleContext<'_>) -> Result<Transition, TransportError> {
        self.behavior_mut().stop(ctx)
    }

    fn on_connected(&mut self, ctx: &mut RoleContext<'_>, channel: usize) -> Transition {
        self.behavior_mut().on_connected(ctx, channel)
    }

    fn on_disconnected(
        &mut self,
        ctx: &mut RoleContext<'_>,
        channel: usize,
        reason: u8,
    ) -> Transition {
        self.behavior_mut().on_disconnected(ctx, channel, reason)
    }

    fn on_event(&mut self, ctx: &mut RoleContext<'_>, event: &StackEvent) -> Transition {
        self.behavior_mut().on_event(ctx, event)
    }

    fn on_tick(&mut self, ctx: &mut RoleContext<'_>) -> Transition {
        self.behavior_mut().on_tick(ctx)
    }

    fn next_deadline(&self) -> Option<u64> {
        self.behavior().next_deadline()
    }

    fn state(&self) -> StreamState {
        self.behavior().state()
    }
}
