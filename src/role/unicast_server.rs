//! Headset CIS state machine (unicast server)
//!
//! The headset advertises until a gateway connects, then follows whatever the
//! gateway drives: security, optional stream configuration and the CIS itself.
//! A headset only talks to one gateway, so the CIS always lands on channel 0.

use crate::constants::HCI_ERR_REMOTE_USER_TERM_CONN;
use crate::log::{debug, error, info, warn};
use crate::role::{Action, AudioRoleBehavior, DisconnectCause, RoleContext, StreamState, Transition};
use crate::{ChannelState, LeAudioEvent, StackEvent, TransportError};

const CHANNEL: usize = 0;

/// Headset CIS state machine
#[derive(Debug, Default)]
pub struct UnicastServer {
    started: bool,
    state: StreamState,
    acl: Option<u16>,
    /// The gateway configures the stream before starting it
    configured_by_peer: bool,
    link_announced: bool,
    streaming_announced: bool,
}

impl UnicastServer {
    /// Create an idle headset
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// ACL link to the gateway, if connected
    #[must_use]
    pub fn acl(&self) -> Option<u16> {
        self.acl
    }

    fn announce_streaming(&mut self, ctx: &mut RoleContext<'_>, transition: Transition) -> Transition {
        self.state = StreamState::Streaming;
        let _ = ctx.registry.set_state(CHANNEL, ChannelState::Streaming);
        if self.streaming_announced {
            return transition;
        }
        self.streaming_announced = true;
        transition.publish(LeAudioEvent::Streaming)
    }

    fn stop_streaming(&mut self, transition: Transition) -> Transition {
        if self.streaming_announced {
            self.streaming_announced = false;
            transition.publish(LeAudioEvent::NotStreaming)
        } else {
            transition
        }
    }

    fn on_acl_connected(&mut self, ctx: &mut RoleContext<'_>, acl: u16) -> Transition {
        if let Some(current) = self.acl {
            warn!("[HEADSET] Already connected to {}, rejecting {}", current, acl);
            return Transition::action(Action::Disconnect {
                acl,
                cause: DisconnectCause::RemoteUserTerminated,
            });
        }

        info!("[HEADSET] Gateway connected: {}", acl);
        self.acl = Some(acl);
        let _ = ctx.registry.assign_peer(CHANNEL, acl);
        let _ = ctx.registry.set_state(CHANNEL, ChannelState::Connecting);
        self.state = StreamState::AclConnected;
        Transition::none()
    }

    fn on_acl_disconnected(&mut self, ctx: &mut RoleContext<'_>, acl: u16, reason: u8) -> Transition {
        if self.acl != Some(acl) {
            debug!("[HEADSET] Disconnect of unknown connection {}", acl);
            return Transition::none();
        }

        info!("[HEADSET] Gateway disconnected, reason {:#x}", reason);
        self.acl = None;
        self.configured_by_peer = false;
        let _ = ctx.release_channel(CHANNEL);

        let mut transition = if self.started {
            self.state = StreamState::Advertising;
            Transition::action(Action::StartAdvertising)
        } else {
            self.state = StreamState::Idle;
            Transition::none()
        };
        transition = self.stop_streaming(transition);
        if self.link_announced {
            self.link_announced = false;
            transition = transition.publish(LeAudioEvent::Disconnected);
        }
        transition
    }

    fn on_stream_event(&mut self, ctx: &mut RoleContext<'_>, event: &StackEvent) -> Transition {
        if event.channel() != Some(CHANNEL) {
            warn!("[HEADSET] Stream event for channel {}", event.channel());
            return Transition::none();
        }

        match *event {
            StackEvent::CodecConfigured { valid: true, .. } => {
                info!("[HEADSET] Codec configured");
                self.configured_by_peer = true;
                self.state = StreamState::CodecConfigured;
                Transition::none().publish(LeAudioEvent::ConfigReceived)
            }
            StackEvent::CodecConfigured { valid: false, .. } => {
                warn!("[HEADSET] No valid codec configuration");
                let transition = Transition::none().publish(LeAudioEvent::NoValidConfig);
                match self.acl {
                    Some(acl) => Transition {
                        action: Some(Action::Disconnect {
                            acl,
                            cause: DisconnectCause::RemoteUserTerminated,
                        }),
                        ..transition
                    },
                    None => transition,
                }
            }
            StackEvent::QosConfigured { .. } => {
                self.state = StreamState::QosConfigured;
                Transition::none()
            }
            StackEvent::StreamEnabled { .. } => {
                self.state = StreamState::Enabled;
                Transition::none()
            }
            StackEvent::StreamStarted { .. } => {
                info!("[HEADSET] Stream started");
                self.announce_streaming(ctx, Transition::none())
            }
            StackEvent::StreamStopped { .. } | StackEvent::StreamDisabled { .. } => {
                info!("[HEADSET] Stream stopped");
                self.state = StreamState::Disabling;
                if ctx.registry.state(CHANNEL) == Ok(ChannelState::Streaming) {
                    let _ = ctx.registry.set_state(CHANNEL, ChannelState::Connected);
                }
                self.stop_streaming(Transition::none())
            }
            StackEvent::StreamReleased { .. } => {
                self.state = StreamState::AclConnected;
                self.stop_streaming(Transition::none())
            }
            _ => Transition::none(),
        }
    }
}

impl AudioRoleBehavior for UnicastServer {
    fn start(&mut self, _ctx: &mut RoleContext<'_>) -> Result<Transition, TransportError> {
        if self.started {
            return Err(TransportError::InvalidState);
        }

        self.started = true;
        if self.acl.is_some() {
            return Ok(Transition::none());
        }
        info!("[HEADSET] Advertising");
        self.state = StreamState::Advertising;
        Ok(Transition::action(Action::StartAdvertising))
    }

    fn stop(&mut self, _ctx: &mut RoleContext<'_>) -> Result<Transition, TransportError> {
        if !self.started {
            return Err(TransportError::InvalidState);
        }

        self.started = false;
        match self.acl {
            Some(acl) => {
                info!("[HEADSET] Stopping, disconnecting {}", acl);
                Ok(Transition::action(Action::Disconnect {
                    acl,
                    cause: DisconnectCause::RemoteUserTerminated,
                }))
            }
            None => {
                info!("[HEADSET] Stopping advertising");
                self.state = StreamState::Idle;
                Ok(Transition::action(Action::StopAdvertising))
            }
        }
    }

    fn on_connected(&mut self, ctx: &mut RoleContext<'_>, channel: usize) -> Transition {
        if channel != CHANNEL {
            warn!("[HEADSET] CIS connected on unexpected channel {}", channel);
            return Transition::none();
        }
        if !ctx.registry.channel(CHANNEL).is_ok_and(|c| c.peer.is_some()) {
            warn!("[HEADSET] CIS connected without a gateway");
            return Transition::none();
        }

        info!("[HEADSET] CIS connected");
        let _ = ctx.registry.set_state(CHANNEL, ChannelState::Connected);

        let mut transition = Transition::none();
        if !self.link_announced {
            self.link_announced = true;
            transition = transition
                .publish(LeAudioEvent::Connected)
                .publish(LeAudioEvent::LinkReady);
        }
        if self.configured_by_peer {
            transition
        } else {
            self.announce_streaming(ctx, transition)
        }
    }

    fn on_disconnected(
        &mut self,
        ctx: &mut RoleContext<'_>,
        channel: usize,
        reason: u8,
    ) -> Transition {
        if channel != CHANNEL {
            warn!("[HEADSET] CIS disconnected on unexpected channel {}", channel);
            return Transition::none();
        }

        if reason == HCI_ERR_REMOTE_USER_TERM_CONN {
            info!("[HEADSET] CIS closed by gateway");
        } else {
            info!("[HEADSET] CIS disconnected, reason {:#x}", reason);
        }
        let _ = ctx.pool.clear(CHANNEL);
        ctx.timing.invalidate();
        let _ = ctx.registry.set_state(CHANNEL, ChannelState::Idle);
        if self.acl.is_some() {
            self.state = if self.configured_by_peer {
                StreamState::QosConfigured
            } else {
                StreamState::AclConnected
            };
        }

        let mut transition = self.stop_streaming(Transition::none());
        if self.link_announced {
            self.link_announced = false;
            transition = transition.publish(LeAudioEvent::Disconnected);
        }
        transition
    }

    fn on_event(&mut self, ctx: &mut RoleContext<'_>, event: &StackEvent) -> Transition {
        match *event {
            StackEvent::AclConnected { acl, .. } => self.on_acl_connected(ctx, acl),
            StackEvent::AclDisconnected { acl, reason } => self.on_acl_disconnected(ctx, acl, reason),
            StackEvent::SecurityChanged { acl, error } => {
                if self.acl != Some(acl) {
                    return Transition::none();
                }
                if let Some(err) = error {
                    error!("[HEADSET] Security failed: {}", err);
                    return Transition::action(Action::Disconnect {
                        acl,
                        cause: DisconnectCause::AuthenticationFailure,
                    });
                }
                self.state = StreamState::ServiceDiscovering;
                Transition::none()
            }
            StackEvent::MtuExchanged { .. } => Transition::none(),
            StackEvent::CodecConfigured { .. }
            | StackEvent::QosConfigured { .. }
            | StackEvent::StreamEnabled { .. }
            | StackEvent::StreamStarted { .. }
            | StackEvent::StreamStopped { .. }
            | StackEvent::StreamDisabled { .. }
            | StackEvent::StreamReleased { .. } => self.on_stream_event(ctx, event),
            _ => {
                warn!("[HEADSET] Unexpected event {}", event);
                Transition::none()
            }
        }
    }

    fn state(&self) -> StreamState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::tests::Harness;
    use crate::{Direction, LeAddress, TransportKind};

    const GATEWAY: LeAddress = LeAddress::public([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);

    fn setup() -> (UnicastServer, Harness) {
        (
            UnicastServer::new(),
            Harness::new(1, TransportKind::Cis, Direction::Rx),
        )
    }

    fn connected(server: &mut UnicastServer, h: &mut Harness) {
        server.start(&mut h.ctx()).unwrap();
        let t = server.on_event(
            &mut h.ctx(),
            &StackEvent::AclConnected {
                peer: GATEWAY,
                acl: 0x20,
            },
        );
        assert!(t.is_empty());
    }

    #[test]
    fn test_start_advertises() {
        let (mut server, mut h) = setup();
        let t = server.start(&mut h.ctx()).unwrap();
        assert_eq!(t.action, Some(Action::StartAdvertising));
        assert_eq!(server.state(), StreamState::Advertising);
        assert_eq!(server.start(&mut h.ctx()), Err(TransportError::InvalidState));
    }

    #[test]
    fn test_cis_without_configuration_streams() {
        let (mut server, mut h) = setup();
        connected(&mut server, &mut h);
        assert_eq!(server.state(), StreamState::AclConnected);
        assert_eq!(h.registry.find_by_peer(0x20), Some(0));

        let t = server.on_connected(&mut h.ctx(), 0);
        assert_eq!(
            t.events.as_slice(),
            &[
                LeAudioEvent::Connected,
                LeAudioEvent::LinkReady,
                LeAudioEvent::Streaming
            ]
        );
        assert_eq!(server.state(), StreamState::Streaming);
        assert_eq!(h.registry.state(0), Ok(ChannelState::Streaming));
    }

    #[test]
    fn test_configured_stream_lifecycle() {
        let (mut server, mut h) = setup();
        connected(&mut server, &mut h);
        server.on_event(
            &mut h.ctx(),
            &StackEvent::SecurityChanged {
                acl: 0x20,
                error: None,
            },
        );
        assert_eq!(server.state(), StreamState::ServiceDiscovering);

        let t = server.on_event(
            &mut h.ctx(),
            &StackEvent::CodecConfigured {
                channel: 0,
                valid: true,
            },
        );
        assert_eq!(t.events.as_slice(), &[LeAudioEvent::ConfigReceived]);
        server.on_event(&mut h.ctx(), &StackEvent::QosConfigured { channel: 0 });
        assert_eq!(server.state(), StreamState::QosConfigured);
        server.on_event(&mut h.ctx(), &StackEvent::StreamEnabled { channel: 0 });
        assert_eq!(server.state(), StreamState::Enabled);

        let t = server.on_connected(&mut h.ctx(), 0);
        assert_eq!(
            t.events.as_slice(),
            &[LeAudioEvent::Connected, LeAudioEvent::LinkReady]
        );
        let t = server.on_event(&mut h.ctx(), &StackEvent::StreamStarted { channel: 0 });
        assert_eq!(t.events.as_slice(), &[LeAudioEvent::Streaming]);
        assert_eq!(server.state(), StreamState::Streaming);

        let t = server.on_event(&mut h.ctx(), &StackEvent::StreamDisabled { channel: 0 });
        assert_eq!(t.events.as_slice(), &[LeAudioEvent::NotStreaming]);
        assert_eq!(server.state(), StreamState::Disabling);
        assert_eq!(h.registry.state(0), Ok(ChannelState::Connected));

        let t = server.on_event(&mut h.ctx(), &StackEvent::StreamReleased { channel: 0 });
        assert!(t.events.is_empty());
        assert_eq!(server.state(), StreamState::AclConnected);
    }

    #[test]
    fn test_invalid_configuration_disconnects() {
        let (mut server, mut h) = setup();
        connected(&mut server, &mut h);
        let t = server.on_event(
            &mut h.ctx(),
            &StackEvent::CodecConfigured {
                channel: 0,
                valid: false,
            },
        );
        assert_eq!(t.events.as_slice(), &[LeAudioEvent::NoValidConfig]);
        assert_eq!(
            t.action,
            Some(Action::Disconnect {
                acl: 0x20,
                cause: DisconnectCause::RemoteUserTerminated
            })
        );
    }

    #[test]
    fn test_disconnect_returns_to_advertising() {
        let (mut server, mut h) = setup();
        connected(&mut server, &mut h);
        server.on_connected(&mut h.ctx(), 0);

        let t = server.on_disconnected(&mut h.ctx(), 0, HCI_ERR_REMOTE_USER_TERM_CONN);
        assert_eq!(
            t.events.as_slice(),
            &[LeAudioEvent::NotStreaming, LeAudioEvent::Disconnected]
        );
        assert_eq!(server.state(), StreamState::AclConnected);

        let t = server.on_event(
            &mut h.ctx(),
            &StackEvent::AclDisconnected {
                acl: 0x20,
                reason: HCI_ERR_REMOTE_USER_TERM_CONN,
            },
        );
        assert_eq!(t.action, Some(Action::StartAdvertising));
        assert!(t.events.is_empty());
        assert_eq!(server.state(), StreamState::Advertising);
        assert_eq!(h.registry.channel(0).unwrap().peer, None);
    }

    #[test]
    fn test_acl_loss_without_cis_event_still_reports() {
        let (mut server, mut h) = setup();
        connected(&mut server, &mut h);
        server.on_connected(&mut h.ctx(), 0);
        let t = server.on_event(
            &mut h.ctx(),
            &StackEvent::AclDisconnected {
                acl: 0x20,
                reason: 0x08,
            },
        );
        assert_eq!(
            t.events.as_slice(),
            &[LeAudioEvent::NotStreaming, LeAudioEvent::Disconnected]
        );
    }

    #[test]
    fn test_second_gateway_is_rejected() {
        let (mut server, mut h) = setup();
        connected(&mut server, &mut h);
        let t = server.on_event(
            &mut h.ctx(),
            &StackEvent::AclConnected {
                peer: GATEWAY,
                acl: 0x21,
            },
        );
        assert_eq!(
            t.action,
            Some(Action::Disconnect {
                acl: 0x21,
                cause: DisconnectCause::RemoteUserTerminated
            })
        );
        assert_eq!(server.acl(), Some(0x20));
    }

    #[test]
    fn test_stop() {
        let (mut server, mut h) = setup();
        assert_eq!(server.stop(&mut h.ctx()), Err(TransportError::InvalidState));

        server.start(&mut h.ctx()).unwrap();
        let t = server.stop(&mut h.ctx()).unwrap();
        assert_eq!(t.action, Some(Action::StopAdvertising));
        assert_eq!(server.state(), StreamState::Idle);

        connected(&mut server, &mut h);
        let t = server.stop(&mut h.ctx()).unwrap();
        assert!(matches!(t.action, Some(Action::Disconnect { acl: 0x20, .. })));
        let t = server.on_event(
            &mut h.ctx(),
            &StackEvent::AclDisconnected {
                acl: 0x20,
                reason: 0x16,
            },
        );
        assert_eq!(t.action, None);
        assert_eq!(server.state(), StreamState::Idle);
    }

    #[test]
    fn test_security_failure_disconnects() {
        let (mut server, mut h) = setup();
        connected(&mut server, &mut h);
        let t = server.on_event(
            &mut h.ctx(),
            &StackEvent::SecurityChanged {
                acl: 0x20,
                error: Some(0x05),
            },
        );
        assert_eq!(
            t.action,
            Some(Action::Disconnect {
                acl: 0x20,
                cause: DisconnectCause::AuthenticationFailure
            })
        );
        assert_eq!(server.state(), StreamState::AclConnected);
    }

    #[test]
    fn test_cis_without_gateway_is_ignored() {
        let (mut server, mut h) = setup();
        server.start(&mut h.ctx()).unwrap();
        let t = server.on_connected(&mut h.ctx(), 0);
        assert!(t.is_empty());
        assert_eq!(server.state(), StreamState::Advertising);
        assert_eq!(h.registry.state(0), Ok(ChannelState::Idle));
    }
}
