//! Headset BIS state machine (broadcast sink)
//!
//! `Idle -> Scanning -> PeriodicSyncing -> PaSynced -> BaseReceived -> Syncable
//! -> BigSyncing -> Streaming`
//!
//! Finding a source and establishing the periodic advertising sync is bounded
//! by a deadline of the periodic advertising interval times the configured
//! retry count. Missing it, or losing the sync later, drops back to scanning.
//! A stopped sink drops the sync instead and stays idle.
//!
//! How a BIS disconnect is handled depends on the reason:
//!
//! | Reason                | Meaning              | Next state  |
//! |-----------------------|----------------------|-------------|
//! | local host terminated | local stop           | `PaSynced`  |
//! | remote user terminated| source stopped       | `PaSynced`  |
//! | MIC failure           | wrong broadcast code | `Syncable`  |
//! | anything else         | sync lost            | `Scanning`  |

use crate::constants::{
    BROADCAST_CODE_LENGTH, HCI_ERR_LOCALHOST_TERM_CONN, HCI_ERR_REMOTE_USER_TERM_CONN,
    HCI_ERR_TERM_DUE_TO_MIC_FAIL,
};
use crate::log::{debug, info, warn};
use crate::role::{Action, AudioRoleBehavior, RoleContext, StreamState, Transition};
use crate::{ChannelState, LeAddress, LeAudioEvent, ScanMode, StackEvent, TransportError, TransportOptions};

/// Shortest sync timeout accepted by the controller, in 10 ms units
const PA_SYNC_TIMEOUT_MIN: u32 = 0x000A;
/// Longest sync timeout accepted by the controller, in 10 ms units
const PA_SYNC_TIMEOUT_MAX: u32 = 0x4000;

/// Headset BIS state machine
#[derive(Debug)]
pub struct BroadcastSink {
    bis_bitfield: u32,
    pa_retry_count: u32,
    broadcast_code: Option<[u8; BROADCAST_CODE_LENGTH]>,
    started: bool,
    state: StreamState,
    encrypted: bool,
    /// Time allowed for the current sync step, in milliseconds
    sync_span_ms: u64,
    deadline: Option<u64>,
    link_announced: bool,
    streaming_announced: bool,
}

impl BroadcastSink {
    /// Create an idle broadcast sink
    #[must_use]
    pub fn new(options: &TransportOptions) -> Self {
        Self {
            bis_bitfield: options.bis_index_bitfield,
            pa_retry_count: options.pa_retry_count,
            broadcast_code: None,
            started: false,
            state: StreamState::Idle,
            encrypted: false,
            sync_span_ms: 0,
            deadline: None,
            link_announced: false,
            streaming_announced: false,
        }
    }

    /// Whether a broadcast code is stored
    #[must_use]
    pub fn has_broadcast_code(&self) -> bool {
        self.broadcast_code.is_some()
    }

    /// Store the broadcast code of an encrypted BIG
    ///
    /// Syncs to the BIG right away if it was only waiting for the code.
    pub fn set_broadcast_code(&mut self, code: [u8; BROADCAST_CODE_LENGTH]) -> Transition {
        info!("[BROADCAST SINK] Broadcast code set");
        self.broadcast_code = Some(code);
        if self.state == StreamState::Syncable {
            self.try_sync()
        } else {
            Transition::none()
        }
    }

    /// Sync to the BIG if started and the code (if needed) is known
    fn try_sync(&mut self) -> Transition {
        if !self.started {
            return Transition::none();
        }

        let broadcast_code = if self.encrypted {
            let Some(code) = self.broadcast_code else {
                warn!("[BROADCAST SINK] BIG is encrypted, waiting for broadcast code");
                return Transition::none();
            };
            Some(code)
        } else {
            None
        };

        info!("[BROADCAST SINK] Syncing to BIS {:#x}", self.bis_bitfield);
        self.state = StreamState::BigSyncing;
        Transition::action(Action::SyncBig {
            bis_bitfield: self.bis_bitfield,
            broadcast_code,
        })
    }

    /// Drop all sync state and scan for a source again, unless stopped
    fn sync_lost(&mut self, ctx: &mut RoleContext<'_>, delete_pa_sync: bool) -> Transition {
        ctx.release_all();
        self.deadline = None;
        self.encrypted = false;

        let mut transition = if self.started {
            self.state = StreamState::Scanning;
            Transition::action(Action::RestartScan { delete_pa_sync })
        } else {
            self.state = StreamState::Idle;
            if delete_pa_sync {
                Transition::action(Action::DeletePaSync)
            } else {
                Transition::none()
            }
        };
        if self.streaming_announced {
            self.streaming_announced = false;
            transition = transition.publish(LeAudioEvent::NotStreaming);
        }
        if self.link_announced {
            self.link_announced = false;
            transition = transition.publish(LeAudioEvent::Disconnected);
        }
        transition
    }

    fn not_streaming(&mut self, state: StreamState) -> Transition {
        self.state = state;
        if self.streaming_announced {
            self.streaming_announced = false;
            Transition::none().publish(LeAudioEvent::NotStreaming)
        } else {
            Transition::none()
        }
    }

    fn on_scan_report(
        &mut self,
        ctx: &RoleContext<'_>,
        peer: LeAddress,
        sid: u8,
        pa_interval: u16,
    ) -> Transition {
        if self.state != StreamState::Scanning || pa_interval == 0 {
            return Transition::none();
        }

        // Interval is in 1.25 ms units
        let interval_ms = u32::from(pa_interval) * 5 / 4;
        let span_ms = interval_ms.saturating_mul(self.pa_retry_count);
        let timeout_10ms = (span_ms / 10).clamp(PA_SYNC_TIMEOUT_MIN, PA_SYNC_TIMEOUT_MAX);

        info!(
            "[BROADCAST SINK] Found source {} (sid {}, interval {} ms)",
            peer.format_hex().as_str(),
            sid,
            interval_ms
        );
        self.state = StreamState::PeriodicSyncing;
        self.sync_span_ms = u64::from(span_ms);
        self.deadline = Some(ctx.now_ms + self.sync_span_ms);

        let mut transition = Transition::action(Action::CreatePaSync {
            peer,
            sid,
            // Clamped above
            timeout_10ms: u16::try_from(timeout_10ms).unwrap_or(u16::MAX),
        });
        if !self.link_announced {
            self.link_announced = true;
            transition = transition.publish(LeAudioEvent::Connected);
        }
        transition
    }
}

impl AudioRoleBehavior for BroadcastSink {
    fn start(&mut self, _ctx: &mut RoleContext<'_>) -> Result<Transition, TransportError> {
        if self.started {
            return Err(TransportError::InvalidState);
        }

        self.started = true;
        match self.state {
            StreamState::Idle => {
                info!("[BROADCAST SINK] Scanning for broadcast source");
                self.state = StreamState::Scanning;
                Ok(Transition::action(Action::StartScan(
                    ScanMode::PeriodicAdvertisers,
                )))
            }
            StreamState::Syncable => Ok(self.try_sync()),
            _ => Ok(Transition::none()),
        }
    }

    fn stop(&mut self, ctx: &mut RoleContext<'_>) -> Result<Transition, TransportError> {
        if !self.started {
            return Err(TransportError::InvalidState);
        }

        self.started = false;
        match self.state {
            StreamState::Scanning => {
                info!("[BROADCAST SINK] Stop scanning");
                ctx.release_all();
                self.state = StreamState::Idle;
                let mut transition = Transition::action(Action::StopScan);
                if self.link_announced {
                    self.link_announced = false;
                    transition = transition.publish(LeAudioEvent::Disconnected);
                }
                Ok(transition)
            }
            StreamState::BigSyncing | StreamState::Streaming => {
                info!("[BROADCAST SINK] Leaving BIG");
                self.state = StreamState::Stopping;
                Ok(Transition::action(Action::TerminateBig))
            }
            StreamState::PeriodicSyncing | StreamState::PaSynced | StreamState::BaseReceived => {
                info!("[BROADCAST SINK] Cancelling periodic advertising sync");
                Ok(self.sync_lost(ctx, true))
            }
            // Stay synced to the periodic advertising train
            _ => Ok(Transition::none()),
        }
    }

    fn on_connected(&mut self, ctx: &mut RoleContext<'_>, channel: usize) -> Transition {
        if ctx.registry.set_state(channel, ChannelState::Streaming).is_err() {
            warn!("[BROADCAST SINK] BIS synced on unknown channel {}", channel);
            return Transition::none();
        }
        if self.state != StreamState::BigSyncing || !ctx.registry.all_channels_connected() {
            return Transition::none();
        }

        info!("[BROADCAST SINK] BIG synced, streaming");
        self.state = StreamState::Streaming;
        if self.streaming_announced {
            Transition::none()
        } else {
            self.streaming_announced = true;
            Transition::none().publish(LeAudioEvent::Streaming)
        }
    }

    fn on_disconnected(
        &mut self,
        ctx: &mut RoleContext<'_>,
        channel: usize,
        reason: u8,
    ) -> Transition {
        if ctx.registry.set_state(channel, ChannelState::Idle).is_err() {
            warn!("[BROADCAST SINK] BIS lost on unknown channel {}", channel);
            return Transition::none();
        }
        let _ = ctx.pool.clear(channel);

        if ctx.registry.connected_count() > 0 {
            debug!("[BROADCAST SINK] BIS {} closed, waiting for the rest", channel);
            return Transition::none();
        }

        match reason {
            HCI_ERR_LOCALHOST_TERM_CONN => {
                info!("[BROADCAST SINK] BIG left");
                self.not_streaming(StreamState::PaSynced)
            }
            HCI_ERR_REMOTE_USER_TERM_CONN => {
                info!("[BROADCAST SINK] Source stopped the BIG");
                self.not_streaming(StreamState::PaSynced)
            }
            HCI_ERR_TERM_DUE_TO_MIC_FAIL => {
                warn!("[BROADCAST SINK] MIC failure, broadcast code rejected");
                self.broadcast_code = None;
                self.encrypted = true;
                self.not_streaming(StreamState::Syncable)
            }
            _ => {
                warn!("[BROADCAST SINK] BIG sync lost, reason {:#x}", reason);
                self.sync_lost(ctx, true)
            }
        }
    }

    fn on_event(&mut self, ctx: &mut RoleContext<'_>, event: &StackEvent) -> Transition {
        match *event {
            StackEvent::ScanReport {
                peer,
                sid,
                pa_interval,
                ..
            } => self.on_scan_report(ctx, peer, sid, pa_interval),
            StackEvent::PaSynced => {
                if self.state != StreamState::PeriodicSyncing {
                    return Transition::none();
                }
                info!("[BROADCAST SINK] Periodic advertising synced");
                self.state = StreamState::PaSynced;
                // BIGInfo must follow within the same span
                self.deadline = Some(ctx.now_ms + self.sync_span_ms);
                Transition::none()
            }
            StackEvent::PaSyncLost { reason } => {
                warn!("[BROADCAST SINK] Periodic advertising sync lost, reason {:#x}", reason);
                self.sync_lost(ctx, false)
            }
            StackEvent::BaseReceived { valid } => {
                if !matches!(self.state, StreamState::PaSynced | StreamState::BaseReceived) {
                    return Transition::none();
                }
                if valid {
                    let first = self.state == StreamState::PaSynced;
                    self.state = StreamState::BaseReceived;
                    if first {
                        Transition::none().publish(LeAudioEvent::ConfigReceived)
                    } else {
                        Transition::none()
                    }
                } else {
                    warn!("[BROADCAST SINK] BASE carries no usable configuration");
                    Transition::none().publish(LeAudioEvent::NoValidConfig)
                }
            }
            StackEvent::Syncable { encrypted } => {
                if !matches!(self.state, StreamState::PaSynced | StreamState::BaseReceived) {
                    return Transition::none();
                }
                debug!("[BROADCAST SINK] BIGInfo received, encrypted: {}", encrypted);
                self.deadline = None;
                self.encrypted = encrypted;
                self.state = StreamState::Syncable;
                let transition = self.try_sync();
                Transition {
                    action: transition.action,
                    ..Transition::none().publish(LeAudioEvent::LinkReady)
                }
            }
            _ => {
                debug!("[BROADCAST SINK] Ignoring event {}", event);
                Transition::none()
            }
        }
    }

    fn on_tick(&mut self, ctx: &mut RoleContext<'_>) -> Transition {
        match self.deadline {
            Some(deadline) if ctx.now_ms >= deadline => {
                warn!("[BROADCAST SINK] Sync to source timed out in state {}", self.state);
                self.sync_lost(ctx, true)
            }
            _ => Transition::none(),
        }
    }

    fn next_deadline(&self) -> Option<u64> {
        self.deadline
    }

    fn state(&self) -> StreamState {
        self.state
    }
}
