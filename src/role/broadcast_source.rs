//! Gateway BIS state machine (broadcast source)
//!
//! `Idle -> BroadcastSourceCreating -> AdvertisingExtended -> PeriodicAdvertising
//! -> BigCreating -> Streaming -> Stopping -> Idle`

use crate::constants::HCI_ERR_LOCALHOST_TERM_CONN;
use crate::log::{info, warn};
use crate::role::{Action, AudioRoleBehavior, RoleContext, StreamState, Transition};
use crate::{ChannelState, LeAudioEvent, StackEvent, TransportError, TransportOptions};

/// Gateway BIS state machine
#[derive(Debug)]
pub struct BroadcastSource {
    num_bis: usize,
    state: StreamState,
    link_announced: bool,
    streaming_announced: bool,
}

impl BroadcastSource {
    /// Create an idle broadcast source with one BIS per configured channel
    #[must_use]
    pub fn new(options: &TransportOptions) -> Self {
        Self {
            num_bis: options.channel_count,
            state: StreamState::Idle,
            link_announced: false,
            streaming_announced: false,
        }
    }

    /// Stop advertising and reset every channel
    fn finish_stop(&mut self, ctx: &mut RoleContext<'_>) -> Transition {
        info!("[BROADCAST SOURCE] Stopped");
        ctx.release_all();
        self.state = StreamState::Idle;

        let mut transition = Transition::action(Action::StopAdvertising);
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

    fn in_state(&self, expected: StreamState, event: &StackEvent) -> bool {
        if self.state == expected {
            true
        } else {
            warn!("[BROADCAST SOURCE] {} in state {}", event, self.state);
            false
        }
    }
}

impl AudioRoleBehavior for BroadcastSource {
    fn start(&mut self, _ctx: &mut RoleContext<'_>) -> Result<Transition, TransportError> {
        if self.state != StreamState::Idle {
            return Err(TransportError::InvalidState);
        }

        info!("[BROADCAST SOURCE] Creating broadcast with {} BIS", self.num_bis);
        self.state = StreamState::BroadcastSourceCreating;
        Ok(Transition::action(Action::CreateBroadcastSource))
    }

    fn stop(&mut self, ctx: &mut RoleContext<'_>) -> Result<Transition, TransportError> {
        match self.state {
            StreamState::Idle | StreamState::Stopping => Err(TransportError::InvalidState),
            StreamState::BigCreating | StreamState::Streaming => {
                info!("[BROADCAST SOURCE] Terminating BIG");
                self.state = StreamState::Stopping;
                Ok(Transition::action(Action::TerminateBig))
            }
            _ => Ok(self.finish_stop(ctx)),
        }
    }

    fn on_connected(&mut self, ctx: &mut RoleContext<'_>, channel: usize) -> Transition {
        if ctx.registry.set_state(channel, ChannelState::Streaming).is_err() {
            warn!("[BROADCAST SOURCE] BIS connected on unknown channel {}", channel);
            return Transition::none();
        }
        if self.state != StreamState::BigCreating || !ctx.registry.all_channels_connected() {
            return Transition::none();
        }

        info!("[BROADCAST SOURCE] BIG created, streaming");
        self.state = StreamState::Streaming;
        let mut transition = Transition::none().publish(LeAudioEvent::LinkReady);
        if !self.streaming_announced {
            self.streaming_announced = true;
            transition = transition.publish(LeAudioEvent::Streaming);
        }
        transition
    }

    fn on_disconnected(
        &mut self,
        ctx: &mut RoleContext<'_>,
        channel: usize,
        reason: u8,
    ) -> Transition {
        if ctx.registry.set_state(channel, ChannelState::Idle).is_err() {
            warn!("[BROADCAST SOURCE] BIS disconnected on unknown channel {}", channel);
            return Transition::none();
        }
        let _ = ctx.pool.clear(channel);
        ctx.timing.invalidate();

        if reason == HCI_ERR_LOCALHOST_TERM_CONN || self.state != StreamState::Streaming {
            return Transition::none();
        }

        // BIG lost without a local request, create it again
        warn!("[BROADCAST SOURCE] BIS {} lost, reason {:#x}", channel, reason);
        self.state = StreamState::BigCreating;
        let mut transition = Transition::action(Action::CreateBig {
            num_bis: self.num_bis,
        });
        if self.streaming_announced {
            self.streaming_announced = false;
            transition = transition.publish(LeAudioEvent::NotStreaming);
        }
        transition
    }

    fn on_event(&mut self, ctx: &mut RoleContext<'_>, event: &StackEvent) -> Transition {
        match event {
            StackEvent::BroadcastSourceCreated => {
                if !self.in_state(StreamState::BroadcastSourceCreating, event) {
                    return Transition::none();
                }
                self.state = StreamState::AdvertisingExtended;
                Transition::action(Action::StartExtendedAdvertising)
            }
            StackEvent::ExtendedAdvertisingStarted => {
                if !self.in_state(StreamState::AdvertisingExtended, event) {
                    return Transition::none();
                }
                self.state = StreamState::PeriodicAdvertising;
                let mut transition = Transition::action(Action::StartPeriodicAdvertising);
                if !self.link_announced {
                    self.link_announced = true;
                    transition = transition.publish(LeAudioEvent::Connected);
                }
                transition
            }
            StackEvent::PeriodicAdvertisingStarted => {
                if !self.in_state(StreamState::PeriodicAdvertising, event) {
                    return Transition::none();
                }
                self.state = StreamState::BigCreating;
                Transition::action(Action::CreateBig {
                    num_bis: self.num_bis,
                })
            }
            StackEvent::BigTerminated => {
                if self.state == StreamState::Stopping {
                    self.finish_stop(ctx)
                } else {
                    warn!("[BROADCAST SOURCE] BIG terminated in state {}", self.state);
                    Transition::none()
                }
            }
            _ => {
                warn!("[BROADCAST SOURCE] Unexpected event {}", event);
                Transition::none()
            }
        }
    }

    fn state(&self) -> StreamState {
        self.state
    }
}
