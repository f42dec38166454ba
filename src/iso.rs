//! LE host stack boundary
//!
//! [`IsoBackend`] is everything the transport needs from the LE host and
//! controller: a clock, the isochronous data path and the control operations
//! the state machines issue. Every method takes `&self`; implementations are
//! expected to forward to a stack that does its own locking (or to record the
//! call, in tests).
//!
//! Control operations only start a procedure. Their completion comes back
//! later as a [`crate::StackEvent`].

use bt_hci::param::{ConnHandle, DisconnectReason};

use crate::LeAddress;
use crate::constants::BROADCAST_CODE_LENGTH;
use crate::timing::TimingSample;

/// Errors reported by the LE host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BackendError {
    /// The controller or host is busy with another procedure
    Busy,
    /// No buffers available
    NoMemory,
    /// The ACL link is gone
    NoLink,
    /// The isochronous link has not delivered an anchor yet
    NotEstablished,
    /// The operation is not supported
    NotSupported,
    /// The stack rejected a parameter
    InvalidParameter,
    /// The procedure timed out
    Timeout,
    /// HCI status code reported by the controller
    Hci(u8),
}

impl BackendError {
    /// Whether the failure may go away by retrying later
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Busy | Self::NoMemory | Self::Timeout)
    }
}

/// Kind of scan started by a role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScanMode {
    /// Scan for connectable headsets (gateway CIS)
    Connectable,
    /// Scan for periodic advertisers of a broadcast source (headset BIS)
    PeriodicAdvertisers,
}

/// Operations the transport performs on the LE host stack
pub trait IsoBackend {
    /// Monotonic uptime in milliseconds
    fn now_ms(&self) -> u64;

    /// Audio sync timer in microseconds, the clock anchor points are reported in
    fn now_us(&self) -> u32;

    /// Busy-wait for `us` microseconds
    fn delay_us(&self, us: u32);

    /// Hand one SDU to the controller for `channel`
    ///
    /// # Errors
    /// Returns an error if the stack refused the SDU; no sent event follows.
    fn iso_send(&self, channel: usize, payload: &[u8]) -> Result<(), BackendError>;

    /// Read the last TX anchor of `channel`
    ///
    /// Must not be called from interrupt context.
    ///
    /// # Errors
    /// Returns `BackendError::NotEstablished` until the first SDU went out.
    fn read_iso_tx_anchor(&self, channel: usize) -> Result<TimingSample, BackendError>;

    /// Connect the CIS of `channel` over the ACL link `acl`
    ///
    /// # Errors
    /// Returns an error if the connect could not be started.
    fn iso_connect(&self, channel: usize, acl: ConnHandle) -> Result<(), BackendError>;

    /// Create an ACL connection to `peer`
    ///
    /// # Errors
    /// Returns an error if the connection could not be initiated.
    fn acl_create(&self, peer: LeAddress) -> Result<(), BackendError>;

    /// Disconnect the ACL link `acl`
    ///
    /// # Errors
    /// Returns an error if the disconnect could not be initiated.
    fn acl_disconnect(&self, acl: ConnHandle, reason: DisconnectReason)
    -> Result<(), BackendError>;

    /// Raise the security level of `acl`
    ///
    /// # Errors
    /// Returns an error if the procedure could not be started.
    fn set_security(&self, acl: ConnHandle) -> Result<(), BackendError>;

    /// Start the ATT MTU exchange on `acl`
    ///
    /// # Errors
    /// Returns an error if the procedure could not be started.
    fn exchange_mtu(&self, acl: ConnHandle) -> Result<(), BackendError>;

    /// Discover the audio sink endpoints of the peer on `acl`
    ///
    /// # Errors
    /// Returns an error if discovery could not be started.
    fn discover_sink(&self, acl: ConnHandle) -> Result<(), BackendError>;

    /// Configure the codec of the stream on `channel`
    ///
    /// # Errors
    /// Returns an error if the operation could not be started.
    fn stream_config(&self, channel: usize, acl: ConnHandle) -> Result<(), BackendError>;

    /// Configure the QoS of the stream on `channel`
    ///
    /// # Errors
    /// Returns an error if the operation could not be started.
    fn stream_qos(&self, channel: usize, acl: ConnHandle) -> Result<(), BackendError>;

    /// Enable the stream on `channel`
    ///
    /// # Errors
    /// Returns an error if the operation could not be started.
    fn stream_enable(&self, channel: usize) -> Result<(), BackendError>;

    /// Start the stream on `channel`
    ///
    /// # Errors
    /// Returns an error if the operation could not be started.
    fn stream_start(&self, channel: usize) -> Result<(), BackendError>;

    /// Disable the stream on `channel`
    ///
    /// # Errors
    /// Returns an error if the operation could not be started.
    fn stream_disable(&self, channel: usize) -> Result<(), BackendError>;

    /// Start scanning
    ///
    /// # Errors
    /// Returns an error if scanning could not be started.
    fn scan_start(&self, mode: ScanMode) -> Result<(), BackendError>;

    /// Stop scanning
    ///
    /// # Errors
    /// Returns an error if scanning could not be stopped.
    fn scan_stop(&self) -> Result<(), BackendError>;

    /// Start connectable advertising
    ///
    /// # Errors
    /// Returns an error if advertising could not be started.
    fn adv_start(&self) -> Result<(), BackendError>;

    /// Stop all advertising (legacy, extended and periodic)
    ///
    /// # Errors
    /// Returns an error if advertising could not be stopped.
    fn adv_stop(&self) -> Result<(), BackendError>;

    /// Create the broadcast source and its advertising set
    ///
    /// # Errors
    /// Returns an error if the source could not be created.
    fn broadcast_source_create(&self) -> Result<(), BackendError>;

    /// Start extended advertising of the broadcast source
    ///
    /// # Errors
    /// Returns an error if advertising could not be started.
    fn ext_adv_start(&self) -> Result<(), BackendError>;

    /// Start periodic advertising of the broadcast source
    ///
    /// # Errors
    /// Returns an error if advertising could not be started.
    fn per_adv_start(&self) -> Result<(), BackendError>;

    /// Create a BIG with `num_bis` streams
    ///
    /// # Errors
    /// Returns an error if the BIG could not be created.
    fn big_create(&self, num_bis: usize) -> Result<(), BackendError>;

    /// Terminate the BIG
    ///
    /// # Errors
    /// Returns an error if the BIG could not be terminated.
    fn big_terminate(&self) -> Result<(), BackendError>;

    /// Synchronize to the BIS indexes in `bis_bitfield` of the synced BIG
    ///
    /// # Errors
    /// Returns an error if synchronization could not be started.
    fn big_sync(
        &self,
        bis_bitfield: u32,
        broadcast_code: Option<&[u8; BROADCAST_CODE_LENGTH]>,
    ) -> Result<(), BackendError>;

    /// Synchronize to the periodic advertising train `sid` of `peer`
    ///
    /// # Errors
    /// Returns an error if synchronization could not be started.
    fn pa_sync_create(
        &self,
        peer: LeAddress,
        sid: u8,
        timeout_10ms: u16,
    ) -> Result<(), BackendError>;

    /// Delete the periodic advertising sync
    ///
    /// # Errors
    /// Returns an error if the sync could not be deleted.
    fn pa_sync_delete(&self) -> Result<(), BackendError>;
}
