//! `IsoTrans` Constants
//!
//! This module contains the constants used throughout the `isotrans` library:
//! channel and queue capacities, buffer budgets, retry policy defaults, timing
//! workaround defaults and the HCI error codes the state machines react to.

/// Maximum number of isochronous channels
pub const MAX_CHANNELS: usize = 2;

/// Maximum number of HCI ISO buffers in flight per channel
pub const HCI_ISO_BUF_ALLOC_PER_CHAN: u8 = 2;

/// Maximum number of retries for a CIS connect / stream start before the link is torn down
pub const MAX_RETRIES: u8 = 5;

/// Backoff between retry attempts in milliseconds
pub const RETRY_BACKOFF_MS: u32 = 500;

/// ISO interval in microseconds (8 * 1.25 ms)
pub const ISO_CONN_INTERVAL_US: u32 = 10_000;

/// Guard window around the ISO anchor point for stereo transmission in microseconds
pub const SYNC_OFFS_GUARD_US: u32 = 1600;

/// Number of ISO intervals without stereo traffic before the anchor check is repeated
pub const SYNC_OFFS_PAUSE_INTERVALS: u32 = 3;

/// Multiplier applied to the periodic advertising interval for PA sync timeouts
pub const PA_RETRY_COUNT: u32 = 6;

/// Maximum SDU payload handed to the controller per channel
pub const MAX_ISO_PAYLOAD: usize = 251;

/// Maximum advertising data length parsed from a legacy advertising report
pub const MAX_ADV_DATA_LENGTH: usize = 31;

/// Depth of the request, response, stack event and published event queues
pub const QUEUE_DEPTH: usize = 8;

/// Maximum number of events published by a single transition
pub const MAX_EVENTS_PER_TRANSITION: usize = 4;

/// Default RX statistics reporting interval in seconds (0 disables reporting)
pub const DEFAULT_RX_STATS_INTERVAL_S: u32 = 0;

/// Processor wake-up interval when nothing is scheduled, in milliseconds
pub const IDLE_POLL_MS: u64 = 1000;

/// Broadcast code length in bytes
pub const BROADCAST_CODE_LENGTH: usize = 16;

/// HCI error: connection timeout
pub const HCI_ERR_CONN_TIMEOUT: u8 = 0x08;

/// HCI error: remote user terminated connection
pub const HCI_ERR_REMOTE_USER_TERM_CONN: u8 = 0x13;

/// HCI error: connection terminated by local host
pub const HCI_ERR_LOCALHOST_TERM_CONN: u8 = 0x16;

/// HCI error: connection terminated due to MIC failure
pub const HCI_ERR_TERM_DUE_TO_MIC_FAIL: u8 = 0x3D;

/// HCI error: connection failed to be established / synchronization timeout
pub const HCI_ERR_CONN_FAIL_TO_ESTAB: u8 = 0x3E;

/// Default peer device name the gateway connects to
pub const DEFAULT_PEER_NAME: &str = "NRF5340_AUDIO_H";

/// AD type: shortened local name
pub const AD_TYPE_NAME_SHORTENED: u8 = 0x08;

/// AD type: complete local name
pub const AD_TYPE_NAME_COMPLETE: u8 = 0x09;
