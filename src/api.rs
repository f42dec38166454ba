//! `isotrans` API Functions
//!
//! This module provides the public API functions for interacting with the transport
//! processor tasks. These functions use static channels to communicate with the
//! processor and are designed to be called from application code.
//!
//! Three groups of callers use them:
//!
//! * the application controls the stream with [`transport_start`],
//!   [`transport_stop`] and friends
//! * the LE host stack shim forwards its callbacks with [`notify`] (or
//!   [`try_notify`] where it cannot wait)
//! * the audio pipeline and UI follow the lifecycle with [`next_event`]
//!
//! # Usage
//!
//! ```rust,no_run
//! use isotrans::LeAudioEvent;
//! use isotrans::api::{next_event, transport_start};
//!
//! # async fn example() -> Result<(), isotrans::TransportError> {
//! transport_start().await?;
//!
//! loop {
//!     if next_event().await == LeAudioEvent::Streaming {
//!         // Start feeding audio frames
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::constants::BROADCAST_CODE_LENGTH;
use crate::{
    LE_AUDIO_EVENT_CHANNEL, LeAudioEvent, REQUEST_CHANNEL, RESPONSE_CHANNEL, Request, Response,
    RxStatsSnapshot, STACK_EVENT_CHANNEL, StackEvent, StreamState, TransportError,
};

/// Start the transport for the configured role.
///
/// For a unicast gateway that is already running this resumes paused streams.
///
/// # Errors
///
/// Returns an error if the role cannot start in its current state, or the response is unexpected.
pub async fn transport_start() -> Result<(), TransportError> {
    REQUEST_CHANNEL.sender().send(Request::Start).await;
    match RESPONSE_CHANNEL.receiver().receive().await {
        Response::Started => Ok(()),
        Response::Error(e) => Err(e),
        _ => Err(TransportError::InvalidState),
    }
}

/// Stop the transport for the configured role.
///
/// For a unicast gateway this pauses the streams and keeps the headsets connected.
///
/// # Errors
///
/// Returns an error if the role is not running, or the response is unexpected.
pub async fn transport_stop() -> Result<(), TransportError> {
    REQUEST_CHANNEL.sender().send(Request::Stop).await;
    match RESPONSE_CHANNEL.receiver().receive().await {
        Response::Stopped => Ok(()),
        Response::Error(e) => Err(e),
        _ => Err(TransportError::InvalidState),
    }
}

/// Get the lifecycle state of the configured role.
///
/// # Errors
///
/// Returns an error if the response is unexpected.
pub async fn transport_state() -> Result<StreamState, TransportError> {
    REQUEST_CHANNEL.sender().send(Request::GetState).await;
    match RESPONSE_CHANNEL.receiver().receive().await {
        Response::State(state) => Ok(state),
        Response::Error(e) => Err(e),
        _ => Err(TransportError::InvalidState),
    }
}

/// Get and reset the received-audio statistics.
///
/// # Errors
///
/// Returns an error if the response is unexpected.
pub async fn take_rx_stats() -> Result<RxStatsSnapshot, TransportError> {
    REQUEST_CHANNEL.sender().send(Request::TakeRxStats).await;
    match RESPONSE_CHANNEL.receiver().receive().await {
        Response::RxStats(stats) => Ok(stats),
        Response::Error(e) => Err(e),
        _ => Err(TransportError::InvalidState),
    }
}

/// Provide the broadcast code of an encrypted broadcast.
///
/// # Errors
///
/// Returns an error if the role is not a broadcast sink, or the response is unexpected.
pub async fn set_broadcast_code(code: [u8; BROADCAST_CODE_LENGTH]) -> Result<(), TransportError> {
    REQUEST_CHANNEL
        .sender()
        .send(Request::SetBroadcastCode(code))
        .await;
    match RESPONSE_CHANNEL.receiver().receive().await {
        Response::BroadcastCodeSet => Ok(()),
        Response::Error(e) => Err(e),
        _ => Err(TransportError::InvalidState),
    }
}

/// Forward a callback from the LE host stack, waiting for queue space.
pub async fn notify(event: StackEvent) {
    STACK_EVENT_CHANNEL.sender().send(event).await;
}

/// Forward a callback from the LE host stack without waiting.
///
/// # Errors
///
/// Returns `TransportError::QueueFull` if the event queue is full; the event is dropped.
pub fn try_notify(event: StackEvent) -> Result<(), TransportError> {
    STACK_EVENT_CHANNEL
        .try_send(event)
        .map_err(|_| TransportError::QueueFull)
}

/// Wait for the next lifecycle event.
pub async fn next_event() -> LeAudioEvent {
    LE_AUDIO_EVENT_CHANNEL.receiver().receive().await
}

/// Take the next lifecycle event if one is queued.
#[must_use]
pub fn try_next_event() -> Option<LeAudioEvent> {
    LE_AUDIO_EVENT_CHANNEL.try_receive().ok()
}
