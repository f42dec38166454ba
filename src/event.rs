//! Callbacks from the LE host stack
//!
//! The stack shim turns every callback it receives into a [`StackEvent`] and
//! pushes it with [`crate::api::notify`] (or [`crate::api::try_notify`] from
//! interrupt-like contexts). The processor task hands each event to
//! [`crate::StreamTransport::handle_event`].
//!
//! Channel indexes are the logical indexes of the channel table; ACL links are
//! identified by their raw connection handle.

use heapless::Vec;

use crate::LeAddress;
use crate::adv::AdvertisingType;
use crate::constants::MAX_ADV_DATA_LENGTH;

/// Audio location reported by a headset during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AudioLocation {
    /// Front left, channel 0
    FrontLeft,
    /// Front right, channel 1
    FrontRight,
    /// Any location the gateway cannot map to a channel
    Unsupported,
}

impl AudioLocation {
    /// Channel index the location maps to
    #[must_use]
    pub const fn channel(self) -> Option<usize> {
        match self {
            Self::FrontLeft => Some(0),
            Self::FrontRight => Some(1),
            Self::Unsupported => None,
        }
    }
}

/// One callback from the LE host stack
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackEvent {
    /// Advertising report received while scanning
    ScanReport {
        /// Advertiser address
        peer: LeAddress,
        /// Legacy PDU type (or `Extended`)
        adv_type: AdvertisingType,
        /// Advertising set ID
        sid: u8,
        /// Periodic advertising interval in 1.25 ms units, 0 if none
        pa_interval: u16,
        /// Advertising payload
        data: Vec<u8, MAX_ADV_DATA_LENGTH>,
    },
    /// ACL connection established
    AclConnected {
        /// Peer address
        peer: LeAddress,
        /// ACL connection handle
        acl: u16,
    },
    /// ACL connection could not be established
    AclConnectFailed {
        /// Peer address
        peer: LeAddress,
        /// HCI status
        status: u8,
    },
    /// ACL connection lost or closed
    AclDisconnected {
        /// ACL connection handle
        acl: u16,
        /// HCI disconnect reason
        reason: u8,
    },
    /// Security procedure finished
    SecurityChanged {
        /// ACL connection handle
        acl: u16,
        /// Security error, `None` on success
        error: Option<u8>,
    },
    /// ATT MTU exchange finished
    MtuExchanged {
        /// ACL connection handle
        acl: u16,
        /// Whether the exchange succeeded
        success: bool,
    },
    /// Audio sink discovery finished
    DiscoveryComplete {
        /// ACL connection handle
        acl: u16,
        /// Audio location of the sink
        location: AudioLocation,
    },
    /// Stream codec configured (by us as client, or by the peer as server)
    CodecConfigured {
        /// Channel index
        channel: usize,
        /// Whether the configuration is usable
        valid: bool,
    },
    /// Stream QoS configured
    QosConfigured {
        /// Channel index
        channel: usize,
    },
    /// Stream enabled
    StreamEnabled {
        /// Channel index
        channel: usize,
    },
    /// Stream started
    StreamStarted {
        /// Channel index
        channel: usize,
    },
    /// Stream stopped
    StreamStopped {
        /// Channel index
        channel: usize,
        /// HCI reason
        reason: u8,
    },
    /// Stream disabled
    StreamDisabled {
        /// Channel index
        channel: usize,
    },
    /// Stream released
    StreamReleased {
        /// Channel index
        channel: usize,
    },
    /// Isochronous channel connected (CIS established or BIS created / synced)
    IsoConnected {
        /// Channel index
        channel: usize,
    },
    /// Isochronous channel disconnected
    IsoDisconnected {
        /// Channel index
        channel: usize,
        /// HCI reason
        reason: u8,
    },
    /// SDU handed to the controller has been sent and its buffer freed
    IsoSent {
        /// Channel index
        channel: usize,
    },
    /// Broadcast source created
    BroadcastSourceCreated,
    /// Extended advertising started
    ExtendedAdvertisingStarted,
    /// Periodic advertising started
    PeriodicAdvertisingStarted,
    /// BIG terminated
    BigTerminated,
    /// Periodic advertising sync established
    PaSynced,
    /// Periodic advertising sync lost
    PaSyncLost {
        /// HCI reason
        reason: u8,
    },
    /// BASE received on the periodic advertising train
    BaseReceived {
        /// Whether a usable codec configuration was found
        valid: bool,
    },
    /// BIGInfo received, the BIG can be synced to
    Syncable {
        /// Whether the BIG is encrypted
        encrypted: bool,
    },
}

impl StackEvent {
    /// Build a scan report, truncating the payload to the legacy maximum
    #[must_use]
    pub fn scan_report(
        peer: LeAddress,
        adv_type: AdvertisingType,
        sid: u8,
        pa_interval: u16,
        payload: &[u8],
    ) -> Self {
        let len = payload.len().min(MAX_ADV_DATA_LENGTH);
        let mut data = Vec::new();
        // Cannot fail, the slice fits.
        let _ = data.extend_from_slice(&payload[..len]);
        Self::ScanReport {
            peer,
            adv_type,
            sid,
            pa_interval,
            data,
        }
    }

    /// Channel index the event refers to, for per-channel events
    #[must_use]
    pub const fn channel(&self) -> Option<usize> {
        match self {
            Self::CodecConfigured { channel, .. }
            | Self::QosConfigured { channel }
            | Self::StreamEnabled { channel }
            | Self::StreamStarted { channel }
            | Self::StreamStopped { channel, .. }
            | Self::StreamDisabled { channel }
            | Self::StreamReleased { channel }
            | Self::IsoConnected { channel }
            | Self::IsoDisconnected { channel, .. }
            | Self::IsoSent { channel } => Some(*channel),
            _ => None,
        }
    }
}
